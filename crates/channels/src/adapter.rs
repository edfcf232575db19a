use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use switchboard_core::domain::channel::{ChannelType, OutboundEnvelope};
use switchboard_core::errors::GatewayError;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: ChannelType,
    pub external_message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn now(channel: ChannelType, external_message_id: Option<String>) -> Self {
        Self { channel, external_message_id, delivered_at: Utc::now() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("adapter is saturated")]
    Saturated,
    #[error("delivery rejected by platform: {0}")]
    Rejected(String),
}

/// Outbound half of a chat-platform integration. One implementation per
/// platform, selected by `ChannelType`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    async fn send(&self, envelope: &OutboundEnvelope) -> Result<DeliveryReceipt, DeliveryError>;

    /// `true` while the platform asks callers to slow down.
    fn is_saturated(&self) -> bool {
        false
    }
}

#[derive(Clone, Default)]
pub struct AdapterTable {
    adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
}

impl AdapterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any adapter previously registered for the same channel.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) -> &mut Self {
        let channel = adapter.channel_type();
        if self.adapters.insert(channel, adapter).is_some() {
            tracing::warn!(
                event_name = "channel.adapter.replaced",
                channel = %channel,
                "channel adapter replaced"
            );
        }
        self
    }

    pub fn get(&self, channel: ChannelType) -> Result<Arc<dyn ChannelAdapter>, GatewayError> {
        self.adapters.get(&channel).cloned().ok_or(GatewayError::UnknownChannel(channel))
    }

    pub fn channels(&self) -> Vec<ChannelType> {
        let mut channels: Vec<ChannelType> = self.adapters.keys().copied().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
