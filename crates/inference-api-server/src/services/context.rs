use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ContextConfig;
use crate::models::chat::ChatMessage;
use crate::services::llm::Generator;
use crate::utils::token_estimator::estimate_tokens;

/// Fallback context window when neither config nor the backend reports one.
pub const DEFAULT_MAX_CONTEXT: usize = 32_768;

/// Hard floor for the prompt budget regardless of margins.
const MIN_BUDGET: usize = 1024;

/// Runaway guard for the truncation loop.
const MAX_DROP_ITERATIONS: usize = 10_000;

/// Accounting attached to every generation, echoed in responses and `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextReport {
    pub compressed: bool,
    pub prompt_tokens: usize,
    pub max_context: usize,
    pub budget: usize,
    pub strategy: String,
    pub dropped_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOverview {
    #[serde(rename = "compressionEnabled")]
    pub compression_enabled: bool,
    pub strategy: String,
    #[serde(rename = "safetyMargin")]
    pub safety_margin: usize,
    #[serde(rename = "modelMaxContext")]
    pub model_max_context: usize,
    pub last: Option<ContextReport>,
}

/// Trims the oldest non-system turns until the rendered prompt fits the token
/// budget, before every generation (single-shot and streaming).
pub struct ContextBudgetManager {
    enabled: bool,
    max_context_override: usize,
    safety_margin: usize,
    strategy: String,
    last: Mutex<Option<ContextReport>>,
}

impl ContextBudgetManager {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            enabled: config.auto_compression,
            max_context_override: config.max_context_tokens,
            safety_margin: config.safety_margin,
            strategy: config.strategy.clone(),
            last: Mutex::new(None),
        }
    }

    /// Render turns into the prompt string used for token accounting, chat
    /// template style with a trailing generation prompt.
    fn render_prompt(messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        for m in messages {
            out.push_str(&m.role);
            out.push_str(": ");
            out.push_str(&m.text());
            out.push('\n');
        }
        out.push_str("assistant:");
        out
    }

    fn count_prompt_tokens(generator: &dyn Generator, text: &str) -> usize {
        generator
            .count_tokens(text)
            .unwrap_or_else(|| estimate_tokens(text))
    }

    fn max_context(&self, generator: &dyn Generator) -> usize {
        if self.max_context_override > 0 {
            self.max_context_override
        } else {
            generator.max_context().unwrap_or(DEFAULT_MAX_CONTEXT)
        }
    }

    /// Returns the (possibly truncated) turn list plus its report, and caches
    /// the report for observability.
    pub fn fit(
        &self,
        generator: &dyn Generator,
        messages: &[ChatMessage],
        max_new_tokens: usize,
    ) -> (Vec<ChatMessage>, ContextReport) {
        let text = Self::render_prompt(messages);
        let mut prompt_tokens = Self::count_prompt_tokens(generator, &text);
        let max_context = self.max_context(generator);
        let budget = (max_context as i64 - self.safety_margin as i64 - max_new_tokens as i64)
            .max(MIN_BUDGET as i64) as usize;

        if !self.enabled || prompt_tokens <= budget {
            let report = ContextReport {
                compressed: false,
                prompt_tokens,
                max_context,
                budget,
                strategy: self.strategy.clone(),
                dropped_messages: 0,
            };
            *self.last.lock() = Some(report.clone());
            return (messages.to_vec(), report);
        }

        let mut msgs = messages.to_vec();
        let mut dropped = 0usize;
        let mut guard = 0usize;
        loop {
            let text = Self::render_prompt(&msgs);
            prompt_tokens = Self::count_prompt_tokens(generator, &text);
            if prompt_tokens <= budget || msgs.len() <= 1 {
                break;
            }
            // Drop the earliest non-pinned turn; system turns survive.
            let Some(drop_idx) = msgs.iter().position(|m| m.role != "system") else {
                break;
            };
            msgs.remove(drop_idx);
            dropped += 1;
            guard += 1;
            if guard > MAX_DROP_ITERATIONS {
                break;
            }
        }

        debug!(
            "Context compressed: dropped {} turns, {} tokens against budget {}",
            dropped, prompt_tokens, budget
        );

        let report = ContextReport {
            compressed: true,
            prompt_tokens,
            max_context,
            budget,
            strategy: self.strategy.clone(),
            dropped_messages: dropped,
        };
        *self.last.lock() = Some(report.clone());
        (msgs, report)
    }

    pub fn last_report(&self) -> Option<ContextReport> {
        self.last.lock().clone()
    }

    /// Health-endpoint view of the compression configuration and last run.
    pub fn overview(&self, generator: &dyn Generator) -> ContextOverview {
        ContextOverview {
            compression_enabled: self.enabled,
            strategy: self.strategy.clone(),
            safety_margin: self.safety_margin,
            model_max_context: self.max_context(generator),
            last: self.last_report(),
        }
    }
}
