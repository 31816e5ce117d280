use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures::stream::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::database::EventLog;
use crate::models::chat::{ChatMessage, StreamChunk};
use crate::services::context::ContextBudgetManager;
use crate::services::llm::Generator;
use crate::services::session::{Session, SessionStore};

/// Client-supplied `<session_id>:<last_seen_index>` pair. Anything malformed
/// is treated as "no cursor", never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCursor {
    pub session_id: String,
    pub last_index: i64,
}

impl ResumeCursor {
    pub fn parse(raw: &str) -> Option<Self> {
        let (session_id, idx) = raw.split_once(':')?;
        let last_index = idx.parse::<i64>().ok()?;
        if session_id.is_empty() {
            return None;
        }
        Some(Self {
            session_id: session_id.to_string(),
            last_index,
        })
    }
}

fn indexed_event(session_id: &str, idx: u64, data: String) -> Event {
    Event::default()
        .id(format!("{}:{}", session_id, idx))
        .data(data)
}

/// Terminal sentinel: `data: [DONE]`, no id line, never persisted.
fn sentinel() -> Event {
    Event::default().data("[DONE]")
}

/// Decrements the listener count when the response stream goes away for any
/// reason, arming the disconnect-cancel timer and giving the store a
/// reclamation pass.
struct DetachGuard {
    session: Arc<Session>,
    store: Arc<SessionStore>,
    cancel_after: Duration,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.session.detach_listener(self.cancel_after);
        self.store.reclaim();
    }
}

/// Orchestrates one streaming attempt: replay decision, generation loop,
/// termination sequence and listener/timer bookkeeping.
pub struct StreamCoordinator {
    session: Arc<Session>,
    generator: Arc<dyn Generator>,
    context: Arc<ContextBudgetManager>,
    event_log: Option<Arc<EventLog>>,
    store: Arc<SessionStore>,
    cancel_after_disconnect: Duration,
    session_ttl: Duration,
}

/// Bound on the producer/consumer hand-off queue.
const FRAGMENT_QUEUE_CAPACITY: usize = 64;

impl StreamCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        generator: Arc<dyn Generator>,
        context: Arc<ContextBudgetManager>,
        event_log: Option<Arc<EventLog>>,
        store: Arc<SessionStore>,
        cancel_after_disconnect: Duration,
        session_ttl: Duration,
    ) -> Self {
        Self {
            session,
            generator,
            context,
            event_log,
            store,
            cancel_after_disconnect,
            session_ttl,
        }
    }

    /// Drive one streaming attempt to completion. Every stream, whatever
    /// happens inside, ends with the `[DONE]` sentinel.
    pub fn run(
        self,
        messages: Vec<ChatMessage>,
        max_tokens: usize,
        temperature: f32,
        cursor: Option<ResumeCursor>,
    ) -> impl Stream<Item = Result<Event, Infallible>> {
        let StreamCoordinator {
            session,
            generator,
            context,
            event_log,
            store,
            cancel_after_disconnect,
            session_ttl,
        } = self;

        async_stream::stream! {
            session.attach_listener();
            let _guard = DetachGuard {
                session: session.clone(),
                store,
                cancel_after: cancel_after_disconnect,
            };

            // Replay applies only when the cursor addresses this session.
            // A cursor for a different session means a fresh stream.
            let replay = cursor.filter(|c| c.session_id == session.id);
            if let Some(cursor) = replay {
                let replay_from = cursor.last_index;
                // Oldest idx and buffered tail come from one critical section
                // so a concurrent append/evict cannot shift the boundary and
                // double-deliver the shifted range.
                let (oldest, buffered) = session.replay_snapshot(replay_from);

                // The buffer may have evicted part of the requested range;
                // the durable log fills the gap below the oldest retained idx.
                let gap = oldest.map_or(true, |o| o as i64 > replay_from.saturating_add(1));
                if gap {
                    if let Some(log) = &event_log {
                        match log.events_after(&session.id, replay_from).await {
                            Ok(rows) => {
                                for (idx, data) in rows {
                                    if oldest.map_or(true, |o| idx < o as i64) {
                                        yield Ok(indexed_event(&session.id, idx as u64, data));
                                    }
                                }
                            }
                            Err(e) => warn!("Durable replay failed for {}: {}", session.id, e),
                        }
                    }
                }
                for (idx, data) in buffered {
                    yield Ok(indexed_event(&session.id, idx, data));
                }

                if session.is_finished() {
                    debug!("Session {} already finished, replay only", session.id);
                    yield Ok(sentinel());
                    return;
                }
            }

            // Context budget runs immediately before generation.
            let (turns, _report) = context.fit(generator.as_ref(), &messages, max_tokens);

            let (tx, mut rx) = mpsc::channel::<(u64, String)>(FRAGMENT_QUEUE_CAPACITY);
            let producer = Producer {
                session: session.clone(),
                generator,
                event_log,
                session_ttl,
            };
            tokio::spawn(producer.run(turns, max_tokens, temperature, tx));

            while let Some((idx, data)) = rx.recv().await {
                yield Ok(indexed_event(&session.id, idx, data));
            }

            yield Ok(sentinel());
        }
    }
}

/// Generation side of the hand-off queue. Runs detached from the response so
/// a disconnected client does not stop generation; fragments keep landing in
/// the buffer and durable log until completion or cancellation.
struct Producer {
    session: Arc<Session>,
    generator: Arc<dyn Generator>,
    event_log: Option<Arc<EventLog>>,
    session_ttl: Duration,
}

impl Producer {
    /// Append one chunk to the buffer and durable log, then offer it to the
    /// listener. A dropped receiver is not an error.
    async fn emit(&self, chunk: &StreamChunk, tx: &mpsc::Sender<(u64, String)>) {
        let data = match serde_json::to_string(chunk) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize chunk for {}: {}", self.session.id, e);
                return;
            }
        };
        let idx = self.session.next_event(data.clone());
        if let Some(log) = &self.event_log {
            if let Err(e) = log.append_event(&self.session.id, idx as i64, &data).await {
                warn!("Durable append failed for {}:{}: {}", self.session.id, idx, e);
            }
        }
        let _ = tx.send((idx, data)).await;
    }

    async fn run(
        self,
        turns: Vec<ChatMessage>,
        max_tokens: usize,
        temperature: f32,
        tx: mpsc::Sender<(u64, String)>,
    ) {
        let model = self.generator.model_id();

        // Initial assistant role delta opens the stream.
        self.emit(&StreamChunk::role(&self.session.id, &model), &tx).await;

        match self
            .generator
            .generate_stream(&turns, max_tokens, temperature, self.session.cancel_handle())
            .await
        {
            Ok(mut fragments) => {
                while let Some(item) = fragments.next().await {
                    match item {
                        Ok(piece) => {
                            if piece.is_empty() {
                                continue;
                            }
                            self.emit(&StreamChunk::content(&self.session.id, &model, &piece), &tx)
                                .await;
                            if self.session.cancel_requested() {
                                debug!("Session {}: cancel observed, stopping", self.session.id);
                                break;
                            }
                        }
                        Err(e) => {
                            // Collaborator failures terminate the stream
                            // cleanly; the finish chunk and sentinel follow.
                            warn!("Generation error for {}: {}", self.session.id, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to start generation for {}: {}", self.session.id, e),
        }

        self.emit(&StreamChunk::finish(&self.session.id, &model), &tx).await;
        self.session.finish();

        if let Some(log) = &self.event_log {
            if let Err(e) = log.mark_finished(&self.session.id).await {
                warn!("Failed to persist finish for {}: {}", self.session.id, e);
            }
            if let Err(e) = log.gc(self.session_ttl).await {
                warn!("Durable log gc failed: {}", e);
            }
        }
    }
}
