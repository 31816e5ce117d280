use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub sessions: SessionsConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible generation backend.
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub default_max_tokens: usize,
    pub default_temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionsConfig {
    pub ttl_seconds: u64,
    pub max_sessions: usize,
    /// Ring buffer capacity per session (most recent events kept in memory).
    pub buffer_capacity: usize,
    /// Mirror events into SQLite so resume survives buffer eviction/restarts.
    pub persist: bool,
    pub db_path: String,
    /// Auto-cancel generation when all listeners stay away this long. 0 disables.
    pub cancel_after_disconnect_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ContextConfig {
    pub auto_compression: bool,
    /// 0 means infer the window from the backend (or fall back to the default).
    pub max_context_tokens: usize,
    pub safety_margin: usize,
    pub strategy: String, // truncate | summarize (future)
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("llm.base_url", "http://127.0.0.1:8080")?
            .set_default("llm.model", "qwen3-vl-2b-thinking")?
            .set_default("llm.timeout_seconds", 600)?
            .set_default("llm.default_max_tokens", 4096)?
            .set_default("llm.default_temperature", 0.7)?
            .set_default("sessions.ttl_seconds", 600)?
            .set_default("sessions.max_sessions", 256)?
            .set_default("sessions.buffer_capacity", 2048)?
            .set_default("sessions.persist", false)?
            .set_default("sessions.db_path", "sessions.db")?
            .set_default("sessions.cancel_after_disconnect_seconds", 3600)?
            .set_default("context.auto_compression", true)?
            .set_default("context.max_context_tokens", 0)?
            .set_default("context.safety_margin", 256)?
            .set_default("context.strategy", "truncate")?
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_file_or_env() {
        let settings = Settings::load().expect("defaults should deserialize");
        assert_eq!(settings.sessions.max_sessions, 256);
        assert_eq!(settings.sessions.buffer_capacity, 2048);
        assert_eq!(settings.context.safety_margin, 256);
        assert_eq!(settings.context.strategy, "truncate");
        assert!(!settings.sessions.persist);
    }
}
