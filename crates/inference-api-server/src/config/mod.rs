pub mod settings;

pub use settings::{ContextConfig, LlmConfig, ServerConfig, SessionsConfig, Settings};
