use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use switchboard_core::config::{ChannelsConfig, OverflowPolicy};
use switchboard_core::domain::channel::{ChannelType, InboundEnvelope, OutboundEnvelope};
use switchboard_core::domain::session::SessionId;
use switchboard_core::errors::GatewayError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterTable, ChannelAdapter, DeliveryReceipt};
use crate::dedupe::{Claim, DedupeCache};
use crate::normalize::{normalize, AdapterEvent, NormalizeError};
use crate::outbound::{send_with_retry, DispatchOutcome, OutboundQueue, SendFailure, SharedQueue};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterSettings {
    pub dedupe_capacity: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub retry: RetryPolicy,
}

impl From<&ChannelsConfig> for RouterSettings {
    fn from(config: &ChannelsConfig) -> Self {
        Self {
            dedupe_capacity: config.dedupe_capacity,
            queue_capacity: config.outbound_queue_capacity,
            overflow: config.overflow,
            retry: RetryPolicy::for_sends(config),
        }
    }
}

/// What processing one inbound message produced. Cached per message id so a
/// replay gets the same answer back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub session_id: Option<SessionId>,
    pub reply: Option<String>,
    pub partial: bool,
    pub error: Option<GatewayError>,
}

impl IngestOutcome {
    pub fn replied(session_id: SessionId, reply: impl Into<String>) -> Self {
        Self { session_id: Some(session_id), reply: Some(reply.into()), ..Self::default() }
    }

    pub fn failed(session_id: Option<SessionId>, error: GatewayError) -> Self {
        Self { session_id, error: Some(error), ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestReceipt {
    pub outcome: IngestOutcome,
    pub duplicate: bool,
}

pub struct ChannelRouter {
    adapters: AdapterTable,
    queues: HashMap<ChannelType, SharedQueue>,
    dedupe: DedupeCache<IngestOutcome>,
    retry: RetryPolicy,
}

impl ChannelRouter {
    pub fn new(adapters: AdapterTable, settings: RouterSettings) -> Self {
        let queues = adapters
            .channels()
            .into_iter()
            .map(|channel| {
                let queue =
                    OutboundQueue::new(channel, settings.queue_capacity, settings.overflow);
                (channel, Arc::new(queue))
            })
            .collect();
        Self {
            adapters,
            queues,
            dedupe: DedupeCache::new(settings.dedupe_capacity),
            retry: settings.retry,
        }
    }

    pub fn adapters(&self) -> &AdapterTable {
        &self.adapters
    }

    pub fn normalize(&self, event: AdapterEvent) -> Result<InboundEnvelope, NormalizeError> {
        normalize(event)
    }

    /// Claims `(channel, message id)`. The first claimant processes the
    /// message; later ones wait for its outcome.
    pub fn claim(&self, envelope: &InboundEnvelope) -> Claim<IngestOutcome> {
        self.dedupe.claim((envelope.channel_type, envelope.message_id.clone()))
    }

    /// Runs `handler` at most once per `(channel, message id)`. A replay that
    /// was waiting on an abandoned first claim claims the message itself.
    pub async fn ingest<F, Fut>(&self, envelope: InboundEnvelope, handler: F) -> IngestReceipt
    where
        F: FnOnce(InboundEnvelope) -> Fut,
        Fut: Future<Output = IngestOutcome>,
    {
        loop {
            match self.claim(&envelope) {
                Claim::First(ticket) => {
                    let outcome = handler(envelope).await;
                    ticket.complete(outcome.clone());
                    return IngestReceipt { outcome, duplicate: false };
                }
                Claim::Duplicate(waiter) => {
                    tracing::info!(
                        event_name = "channel.inbound.duplicate",
                        channel = %envelope.channel_type,
                        message_id = %envelope.message_id.0,
                        "duplicate inbound message; returning cached outcome"
                    );
                    if let Some(outcome) = waiter.outcome().await {
                        return IngestReceipt { outcome, duplicate: true };
                    }
                    tracing::info!(
                        event_name = "channel.inbound.reclaimed",
                        channel = %envelope.channel_type,
                        message_id = %envelope.message_id.0,
                        "first handler abandoned the message; processing replay"
                    );
                }
            }
        }
    }

    /// Sends through the matching adapter. While the adapter is saturated, or
    /// older sends are still queued, the envelope joins the channel queue.
    pub async fn dispatch(&self, envelope: OutboundEnvelope) -> Result<DispatchOutcome, GatewayError> {
        let channel = envelope.channel_type;
        let adapter = self.adapters.get(channel)?;
        let queue = self.queue(channel)?;

        if adapter.is_saturated() || !queue.is_empty() {
            return queue.enqueue(envelope);
        }

        match send_with_retry(adapter.as_ref(), &envelope, &self.retry).await {
            Ok(receipt) => {
                tracing::debug!(
                    event_name = "channel.outbound.delivered",
                    channel = %channel,
                    external_message_id = receipt.external_message_id.as_deref(),
                    partial = envelope.partial,
                    "outbound envelope delivered"
                );
                Ok(DispatchOutcome::Delivered(receipt))
            }
            Err(SendFailure::Saturated) => queue.enqueue(envelope),
            Err(SendFailure::Failed(error)) => Err(error),
        }
    }

    /// `dispatch` that waits for a queued send to resolve.
    pub async fn deliver(&self, envelope: OutboundEnvelope) -> Result<DeliveryReceipt, GatewayError> {
        let channel = envelope.channel_type;
        match self.dispatch(envelope).await? {
            DispatchOutcome::Delivered(receipt) => Ok(receipt),
            DispatchOutcome::Queued { position, receipt } => match receipt.await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::ChannelBackpressure { channel, queued: position }),
            },
        }
    }

    pub async fn drain(&self, channel: ChannelType) -> Result<usize, GatewayError> {
        let adapter = self.adapters.get(channel)?;
        let queue = self.queue(channel)?;
        Ok(queue.drain(adapter.as_ref(), &self.retry).await)
    }

    pub fn queued(&self, channel: ChannelType) -> usize {
        self.queues.get(&channel).map_or(0, |queue| queue.len())
    }

    /// One drain task per channel. Each wakes on new queued sends or every
    /// `poll`, and fails whatever is left once `shutdown` fires.
    pub fn spawn_drainers(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        poll: Duration,
    ) -> Vec<JoinHandle<()>> {
        self.queues
            .iter()
            .filter_map(|(channel, queue)| {
                let adapter = self.adapters.get(*channel).ok()?;
                Some(spawn_drainer(
                    *channel,
                    queue.clone(),
                    adapter,
                    self.retry.clone(),
                    shutdown.clone(),
                    poll,
                ))
            })
            .collect()
    }

    fn queue(&self, channel: ChannelType) -> Result<&SharedQueue, GatewayError> {
        self.queues.get(&channel).ok_or(GatewayError::UnknownChannel(channel))
    }
}

fn spawn_drainer(
    channel: ChannelType,
    queue: SharedQueue,
    adapter: Arc<dyn ChannelAdapter>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let failed = queue.fail_all();
                    tracing::info!(
                        event_name = "channel.outbound.drainer_stopped",
                        channel = %channel,
                        failed,
                        "outbound drainer stopped"
                    );
                    break;
                }
                _ = queue.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            if !queue.is_empty() {
                queue.drain(adapter.as_ref(), &retry).await;
            }
        }
    })
}
