use serde::{Deserialize, Serialize};

/// Storage-local message role, intentionally decoupled from chat-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One persisted chat turn, serialized into the `messages_json` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
}

impl StoredMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: i64,
    pub problem_id: String,
    pub messages: Vec<StoredMessage>,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

/// One sample input/output pair of a problem statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub input: String,
    pub output: String,
}

/// Problem statement as fetched from the judge and cached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemStatement {
    #[serde(alias = "problem_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_description: String,
    #[serde(default)]
    pub output_description: String,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub time_limit: String,
    #[serde(default)]
    pub memory_limit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemRecord {
    pub id: i64,
    pub statement: ProblemStatement,
    pub created_at_unix_seconds: u64,
}

/// Aggregated solve count for one calendar day (UTC), bucketed for heatmap shading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityDay {
    pub date: String,
    pub count: u32,
    pub level: u8,
}

/// Maps a daily solve count onto the five heatmap intensity levels.
pub fn activity_level(count: u32) -> u8 {
    match count {
        0 => 0,
        1..=2 => 1,
        3..=5 => 2,
        6..=10 => 3,
        _ => 4,
    }
}
