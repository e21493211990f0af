use std::fmt;

use psup_llm::{DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a patient competitive-programming tutor. \
Guide the student toward the solution with hints instead of handing out full code. \
When the student shares code, review it for bugs, edge cases and complexity. \
Suggest test cases that expose mistakes, and keep explanations short and concrete.";

/// Per-request settings the coordinator reads when it opens a stream.
#[derive(Clone, PartialEq)]
pub struct ChatConfig {
    pub api_key: String,
    pub model_id: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: u64,
}

impl ChatConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model_id: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ChatConfig")
            .field("api_key", &if self.has_credential() { "<set>" } else { "<empty>" })
            .field("model_id", &self.model_id)
            .field("system_prompt", &self.system_prompt.len())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}
