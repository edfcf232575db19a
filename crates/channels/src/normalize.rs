use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::domain::channel::{
    ChannelIdentity, ChannelType, ContentPart, InboundEnvelope, MessageId,
};
use thiserror::Error;

/// Platform-neutral shape adapters hand to the router before normalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterEvent {
    DirectMessage(RawMessage),
    GroupMessage(RawGroupMessage),
}

impl AdapterEvent {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            Self::DirectMessage(message) => message.channel_type,
            Self::GroupMessage(message) => message.message.channel_type,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::DirectMessage(message) => &message.message_id,
            Self::GroupMessage(message) => &message.message.message_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel_type: ChannelType,
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Vec<RawMedia>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGroupMessage {
    #[serde(flatten)]
    pub message: RawMessage,
    pub group_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMedia {
    pub media_type: String,
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{channel} event is missing a message id")]
    MissingMessageId { channel: ChannelType },
    #[error("{channel} event {message_id} has no sender")]
    MissingSender { channel: ChannelType, message_id: String },
    #[error("{channel} group event {message_id} has no group id")]
    MissingGroup { channel: ChannelType, message_id: String },
    #[error("{channel} event {message_id} carries no content")]
    EmptyContent { channel: ChannelType, message_id: String },
}

pub fn normalize(event: AdapterEvent) -> Result<InboundEnvelope, NormalizeError> {
    match event {
        AdapterEvent::DirectMessage(message) => {
            check_required(&message)?;
            let identity = ChannelIdentity::direct(message.channel_type, message.sender_id.trim());
            build(message, identity)
        }
        AdapterEvent::GroupMessage(RawGroupMessage { message, group_id, thread_id }) => {
            check_required(&message)?;
            if group_id.trim().is_empty() {
                return Err(NormalizeError::MissingGroup {
                    channel: message.channel_type,
                    message_id: message.message_id,
                });
            }
            let mut identity = ChannelIdentity::group(message.channel_type, group_id.trim());
            if let Some(thread_id) = thread_id.filter(|thread| !thread.trim().is_empty()) {
                identity = identity.with_thread(thread_id.trim());
            }
            build(message, identity)
        }
    }
}

fn check_required(message: &RawMessage) -> Result<(), NormalizeError> {
    if message.message_id.trim().is_empty() {
        return Err(NormalizeError::MissingMessageId { channel: message.channel_type });
    }
    if message.sender_id.trim().is_empty() {
        return Err(NormalizeError::MissingSender {
            channel: message.channel_type,
            message_id: message.message_id.clone(),
        });
    }
    Ok(())
}

fn build(message: RawMessage, identity: ChannelIdentity) -> Result<InboundEnvelope, NormalizeError> {
    let mut content = Vec::with_capacity(1 + message.media.len());
    if let Some(text) = message.text.filter(|text| !text.trim().is_empty()) {
        content.push(ContentPart::text(text));
    }
    content.extend(message.media.into_iter().map(|media| ContentPart::Media {
        media_type: media.media_type,
        url: media.url,
        caption: media.caption,
    }));

    if content.is_empty() {
        return Err(NormalizeError::EmptyContent {
            channel: message.channel_type,
            message_id: message.message_id,
        });
    }

    Ok(InboundEnvelope {
        channel_type: message.channel_type,
        identity,
        sender_id: message.sender_id.trim().to_owned(),
        content,
        timestamp: message.sent_at.unwrap_or_else(Utc::now),
        message_id: MessageId(message.message_id.trim().to_owned()),
    })
}
