pub mod context;
pub mod llm;
pub mod session;
pub mod stream;

pub use context::ContextBudgetManager;
pub use llm::{Generator, LlmService};
pub use session::{Session, SessionStore};
pub use stream::{ResumeCursor, StreamCoordinator};
