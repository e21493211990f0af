use psup_llm::{ProviderMessage, Role as ProviderRole};
use psup_storage::{MessageRole as StorageMessageRole, StoredMessage};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn. Ordering inside a conversation is chronological.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates the empty assistant turn that stands in for not-yet-received text.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new())
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        let role = match self.role {
            Role::User => ProviderRole::User,
            Role::Assistant => ProviderRole::Assistant,
        };
        ProviderMessage::new(role, self.content.clone())
    }
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        let role = match stored.role {
            StorageMessageRole::User => Role::User,
            StorageMessageRole::Assistant => Role::Assistant,
        };
        Self::new(role, stored.content)
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        let role = match message.role {
            Role::User => StorageMessageRole::User,
            Role::Assistant => StorageMessageRole::Assistant,
        };
        StoredMessage::new(role, message.content.clone())
    }
}

/// Builds the user-visible text of a turn, fencing an optional code attachment.
pub fn compose_display_content(text: &str, attachment: Option<&str>) -> String {
    match attachment {
        Some(code) if !code.trim().is_empty() => format!("{text}\n```\n{code}\n```"),
        _ => text.to_string(),
    }
}
