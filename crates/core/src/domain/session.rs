use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::channel::{ChannelIdentity, ConversationKey};
use crate::domain::tool::CorrelationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("ses-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// An invocation is in flight.
    Active,
    Idle,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Expired => "expired",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of a session, handed out by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub identity: ChannelIdentity,
    pub conversation_key: ConversationKey,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub pending_tool_calls: BTreeSet<CorrelationId>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.state == SessionState::Expired
    }
}

/// Persisted form of a session routing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub identity: ChannelIdentity,
    pub conversation_key: ConversationKey,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn storage_key(identity: &ChannelIdentity) -> String {
        format!("session:{}:{}", identity.channel_type, identity.conversation_key())
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionId, SessionSnapshot};
    use crate::domain::channel::{ChannelIdentity, ChannelType};

    #[test]
    fn generated_session_ids_are_unique_and_prefixed() {
        let first = SessionId::generate();
        let second = SessionId::generate();

        assert!(first.0.starts_with("ses-"));
        assert_ne!(first, second);
    }

    #[test]
    fn snapshot_storage_key_includes_channel_and_conversation() {
        let identity = ChannelIdentity::group(ChannelType::Discord, "guild-7").with_thread("t-1");
        assert_eq!(
            SessionSnapshot::storage_key(&identity),
            "session:discord:group:guild-7:thread:t-1"
        );
    }
}
