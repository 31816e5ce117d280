use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Fixed-capacity window over the most recent events of a session, oldest
/// evicted first. Evicted ranges are recoverable from the durable log only.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    entries: VecDeque<(u64, String)>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, idx: u64, payload: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((idx, payload));
    }

    pub fn oldest_idx(&self) -> Option<u64> {
        self.entries.front().map(|(idx, _)| *idx)
    }

    pub fn events_after(&self, last_idx: i64) -> Vec<(u64, String)> {
        self.entries
            .iter()
            .filter(|(idx, _)| *idx as i64 > last_idx)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct SessionInner {
    buffer: EventBuffer,
    /// Last assigned sequence index; -1 before the first event.
    last_idx: i64,
    listeners: usize,
    /// At most one pending disconnect-cancel timer.
    disconnect_timer: Option<JoinHandle<()>>,
}

/// Per-conversation mutable state. Index assignment, buffer writes and
/// listener/timer bookkeeping all go through the single inner lock;
/// `finished` and `cancel_requested` are write-once atomics shared with the
/// producer loop and the cancel endpoint.
pub struct Session {
    pub id: String,
    created_at: Instant,
    created_unix: i64,
    finished: AtomicBool,
    cancel: Arc<AtomicBool>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: impl Into<String>, buffer_capacity: usize) -> Self {
        Self::with_created(id, buffer_capacity, Instant::now())
    }

    pub(crate) fn with_created(
        id: impl Into<String>,
        buffer_capacity: usize,
        created_at: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            created_unix: chrono::Utc::now().timestamp(),
            finished: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(SessionInner {
                buffer: EventBuffer::new(buffer_capacity),
                last_idx: -1,
                listeners: 0,
                disconnect_timer: None,
            }),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn created_unix(&self) -> i64 {
        self.created_unix
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Write-once; never reset.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Write-once; never reset. Cooperative: the producer polls this between
    /// fragments, it is never a forced interrupt.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Shared flag handed to the generation backend so it can stop producing.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Assign the next sequence index and append the payload to the buffer in
    /// one critical section, so indices are gapless and ordered even with a
    /// resumed producer racing a reclaim pass.
    pub fn next_event(&self, payload: String) -> u64 {
        let mut inner = self.inner.lock();
        inner.last_idx += 1;
        let idx = inner.last_idx as u64;
        inner.buffer.push(idx, payload);
        idx
    }

    pub fn last_idx(&self) -> i64 {
        self.inner.lock().last_idx
    }

    pub fn oldest_buffered_idx(&self) -> Option<u64> {
        self.inner.lock().buffer.oldest_idx()
    }

    /// Oldest retained index and the buffered tail after `last_idx`, read in
    /// one critical section. A racing append/evict between two separate reads
    /// could otherwise shift the eviction boundary and double-deliver the
    /// shifted range on resume.
    pub fn replay_snapshot(&self, last_idx: i64) -> (Option<u64>, Vec<(u64, String)>) {
        let inner = self.inner.lock();
        (inner.buffer.oldest_idx(), inner.buffer.events_after(last_idx))
    }

    /// A listener attached: bump the count and disarm any pending
    /// disconnect-cancel timer, atomically with respect to `detach_listener`.
    pub fn attach_listener(&self) {
        let mut inner = self.inner.lock();
        inner.listeners += 1;
        if let Some(timer) = inner.disconnect_timer.take() {
            timer.abort();
            debug!("Session {}: disconnect timer disarmed", self.id);
        }
    }

    /// A listener detached. When the last one leaves and cancellation was not
    /// requested, arm a one-shot timer that cancels the session unless a new
    /// listener attaches first. The timer re-checks the listener count under
    /// the same lock before firing.
    pub fn detach_listener(self: &Arc<Self>, cancel_after: Duration) {
        let mut inner = self.inner.lock();
        inner.listeners = inner.listeners.saturating_sub(1);
        if inner.listeners != 0 || self.cancel_requested() || cancel_after.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(self);
        inner.disconnect_timer = Some(handle.spawn(async move {
            tokio::time::sleep(cancel_after).await;
            let inner = session.inner.lock();
            if inner.listeners == 0 && !session.cancel_requested() {
                debug!(
                    "Session {}: no listeners after {:?}, requesting cancel",
                    session.id, cancel_after
                );
                session.request_cancel();
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_evicts_oldest_first() {
        let mut buf = EventBuffer::new(4);
        for i in 0..10u64 {
            buf.push(i, format!("p{}", i));
        }
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.oldest_idx(), Some(6));
        let tail = buf.events_after(7);
        assert_eq!(
            tail.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![8, 9]
        );
    }

    #[test]
    fn test_buffer_events_after_minus_one_returns_all() {
        let mut buf = EventBuffer::new(8);
        buf.push(0, "a".into());
        buf.push(1, "b".into());
        assert_eq!(buf.events_after(-1).len(), 2);
        assert!(buf.events_after(1).is_empty());
    }

    #[test]
    fn test_indices_are_gapless_from_zero() {
        let session = Session::new("s", 16);
        assert_eq!(session.last_idx(), -1);
        for expected in 0..5u64 {
            assert_eq!(session.next_event(format!("e{}", expected)), expected);
        }
        assert_eq!(session.last_idx(), 4);
    }

    #[test]
    fn test_replay_snapshot_is_consistent_under_concurrent_appends() {
        // With a tiny buffer and a writer thread evicting continuously, the
        // snapshot must still pair the oldest index with a matching,
        // contiguous tail. Two separate lock acquisitions would let the
        // eviction boundary move between the reads.
        let session = Arc::new(Session::new("s", 4));
        let writer = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for i in 0..2000u64 {
                    session.next_event(format!("e{}", i));
                }
            })
        };

        for _ in 0..500 {
            let (oldest, events) = session.replay_snapshot(-1);
            if let Some((first, _)) = events.first() {
                assert_eq!(Some(*first), oldest);
                for (offset, (idx, _)) in events.iter().enumerate() {
                    assert_eq!(*idx, first + offset as u64);
                }
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_replay_snapshot_honors_cursor() {
        let session = Session::new("s", 8);
        for i in 0..5u64 {
            session.next_event(format!("e{}", i));
        }
        let (oldest, events) = session.replay_snapshot(2);
        assert_eq!(oldest, Some(0));
        assert_eq!(
            events.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn test_flags_are_write_once() {
        let session = Session::new("s", 16);
        assert!(!session.is_finished());
        session.finish();
        session.finish();
        assert!(session.is_finished());
        session.request_cancel();
        assert!(session.cancel_requested());
        assert!(session.cancel_handle().load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_timer_fires_after_last_detach() {
        let session = Arc::new(Session::new("s", 16));
        session.attach_listener();
        session.detach_listener(Duration::from_millis(50));
        assert!(!session.cancel_requested());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(session.cancel_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_disarms_disconnect_timer() {
        let session = Arc::new(Session::new("s", 16));
        session.attach_listener();
        session.detach_listener(Duration::from_millis(50));
        session.attach_listener();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!session.cancel_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_never_arms_timer() {
        let session = Arc::new(Session::new("s", 16));
        session.attach_listener();
        session.detach_listener(Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!session.cancel_requested());
    }
}
