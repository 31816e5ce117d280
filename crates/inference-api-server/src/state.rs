use std::sync::Arc;

use crate::config::Settings;
use crate::database::EventLog;
use crate::services::{ContextBudgetManager, Generator, SessionStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<SessionStore>,
    pub generator: Arc<dyn Generator>,
    pub context: Arc<ContextBudgetManager>,
    pub event_log: Option<Arc<EventLog>>,
}
