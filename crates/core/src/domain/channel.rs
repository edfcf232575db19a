use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Telegram,
    Discord,
    Slack,
    WhatsApp,
    Signal,
    Matrix,
    WebChat,
}

impl ChannelType {
    pub const ALL: [ChannelType; 7] = [
        Self::Telegram,
        Self::Discord,
        Self::Slack,
        Self::WhatsApp,
        Self::Signal,
        Self::Matrix,
        Self::WebChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::WhatsApp => "whatsapp",
            Self::Signal => "signal",
            Self::Matrix => "matrix",
            Self::WebChat => "webchat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|channel| channel.as_str() == normalized)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a conversation is the user's direct ("main") chat or a shared group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationScope {
    Direct,
    Group,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel_type: ChannelType,
    pub scope: ConversationScope,
    /// User id for direct conversations, group id for group conversations.
    pub external_id: String,
    pub thread_id: Option<String>,
}

impl ChannelIdentity {
    pub fn direct(channel_type: ChannelType, user_id: impl Into<String>) -> Self {
        Self {
            channel_type,
            scope: ConversationScope::Direct,
            external_id: user_id.into(),
            thread_id: None,
        }
    }

    pub fn group(channel_type: ChannelType, group_id: impl Into<String>) -> Self {
        Self {
            channel_type,
            scope: ConversationScope::Group,
            external_id: group_id.into(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::for_identity(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey(pub String);

impl ConversationKey {
    /// Direct chats collapse to `main:{user}`; groups are keyed per group and
    /// per thread so a thread never shares state with its parent channel.
    pub fn for_identity(identity: &ChannelIdentity) -> Self {
        let base = match identity.scope {
            ConversationScope::Direct => format!("main:{}", identity.external_id),
            ConversationScope::Group => format!("group:{}", identity.external_id),
        };
        match &identity.thread_id {
            Some(thread_id) if !thread_id.is_empty() => Self(format!("{base}:thread:{thread_id}")),
            _ => Self(base),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Media { media_type: String, url: String, caption: Option<String> },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Media { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub channel_type: ChannelType,
    pub identity: ChannelIdentity,
    pub sender_id: String,
    pub content: Vec<ContentPart>,
    pub timestamp: DateTime<Utc>,
    pub message_id: MessageId,
}

impl InboundEnvelope {
    pub fn from_text(
        identity: ChannelIdentity,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_type: identity.channel_type,
            identity,
            sender_id: sender_id.into(),
            content: vec![ContentPart::text(text)],
            timestamp: Utc::now(),
            message_id: MessageId(message_id.into()),
        }
    }

    /// Concatenated text parts; media parts contribute their caption when present.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Media { caption, .. } => caption.as_deref(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub channel_type: ChannelType,
    pub identity: ChannelIdentity,
    pub content: Vec<ContentPart>,
    pub reply_to: Option<MessageId>,
    /// Set when the content is the partial output of an aborted invocation.
    pub partial: bool,
    pub timestamp: DateTime<Utc>,
}

impl OutboundEnvelope {
    pub fn text(identity: ChannelIdentity, text: impl Into<String>) -> Self {
        Self {
            channel_type: identity.channel_type,
            identity,
            content: vec![ContentPart::text(text)],
            reply_to: None,
            partial: false,
            timestamp: Utc::now(),
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn flagged_partial(mut self) -> Self {
        self.partial = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelIdentity, ChannelType, ConversationKey};

    #[test]
    fn direct_and_group_conversations_get_distinct_keys() {
        let direct = ChannelIdentity::direct(ChannelType::Telegram, "u-42");
        let group = ChannelIdentity::group(ChannelType::Telegram, "u-42");

        assert_eq!(direct.conversation_key(), ConversationKey("main:u-42".to_owned()));
        assert_eq!(group.conversation_key(), ConversationKey("group:u-42".to_owned()));
        assert_ne!(direct.conversation_key(), group.conversation_key());
    }

    #[test]
    fn threads_are_keyed_separately_from_their_group() {
        let group = ChannelIdentity::group(ChannelType::Slack, "C1");
        let thread = group.clone().with_thread("1730000000.1000");

        assert_eq!(
            thread.conversation_key().as_str(),
            "group:C1:thread:1730000000.1000"
        );
        assert_ne!(group.conversation_key(), thread.conversation_key());
    }

    #[test]
    fn channel_type_parses_its_own_encoding() {
        for channel in ChannelType::ALL {
            assert_eq!(ChannelType::parse(channel.as_str()), Some(channel));
        }
        assert_eq!(ChannelType::parse(" Telegram "), Some(ChannelType::Telegram));
        assert_eq!(ChannelType::parse("irc"), None);
    }
}
