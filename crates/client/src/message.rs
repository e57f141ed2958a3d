use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry. Persisted as `{type, content, time, streaming}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    #[serde(rename = "type", alias = "role")]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "time", alias = "created_at")]
    pub created_at: DateTime<Utc>,
    /// Content is still arriving; only the last entry may carry this.
    #[serde(default)]
    pub streaming: bool,
}

impl MessageEntry {
    pub fn new(role: Role, content: impl Into<String>, streaming: bool) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
            streaming,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, false)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, false)
    }

    /// Empty assistant placeholder opened by a stream `start`.
    pub fn assistant_streaming() -> Self {
        Self::new(Role::Assistant, String::new(), true)
    }

    pub fn is_finalized(&self) -> bool {
        !self.streaming
    }
}
