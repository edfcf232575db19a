use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use switchboard_core::config::OverflowPolicy;
use switchboard_core::domain::channel::{ChannelType, OutboundEnvelope};
use switchboard_core::errors::GatewayError;
use tokio::sync::{oneshot, Notify};

use crate::adapter::{ChannelAdapter, DeliveryError, DeliveryReceipt};
use crate::retry::RetryPolicy;

pub type DeliveryResult = Result<DeliveryReceipt, GatewayError>;

/// Result of handing an envelope to the router.
#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered(DeliveryReceipt),
    /// The adapter is saturated; the send waits in the channel queue and the
    /// receiver resolves with its final result.
    Queued { position: usize, receipt: oneshot::Receiver<DeliveryResult> },
}

pub(crate) enum SendFailure {
    Saturated,
    Failed(GatewayError),
}

struct QueuedSend {
    envelope: OutboundEnvelope,
    reply: oneshot::Sender<DeliveryResult>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedSend>,
    /// A drained send is out with the adapter; it still counts as queued so
    /// new sends line up behind it.
    in_flight: bool,
}

/// Clears `in_flight` even when the draining future is dropped mid-send.
struct InFlight<'a> {
    queue: &'a OutboundQueue,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.lock().in_flight = false;
    }
}

/// Bounded FIFO of sends waiting for one saturated channel.
pub struct OutboundQueue {
    channel: ChannelType,
    capacity: usize,
    overflow: OverflowPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(channel: ChannelType, capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            channel,
            capacity: capacity.max(1),
            overflow,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Waiting sends plus the one being drained, if any.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pending.len() + usize::from(state.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && !state.in_flight
    }

    /// Drop-oldest evicts the head and reports `ChannelBackpressure` to its
    /// caller; reject-new refuses the incoming send instead.
    pub(crate) fn enqueue(&self, envelope: OutboundEnvelope) -> Result<DispatchOutcome, GatewayError> {
        let (reply, receipt) = oneshot::channel();
        let position = {
            let mut state = self.lock();
            let in_flight = usize::from(state.in_flight);
            let pending = &mut state.pending;
            if pending.len() >= self.capacity {
                match self.overflow {
                    OverflowPolicy::RejectNew => {
                        tracing::warn!(
                            event_name = "channel.outbound.rejected",
                            channel = %self.channel,
                            queued = pending.len(),
                            "outbound queue full; send rejected"
                        );
                        return Err(GatewayError::ChannelBackpressure {
                            channel: self.channel,
                            queued: pending.len(),
                        });
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(evicted) = pending.pop_front() {
                            tracing::warn!(
                                event_name = "channel.outbound.evicted",
                                channel = %self.channel,
                                queued = pending.len() + 1,
                                "outbound queue full; oldest send evicted"
                            );
                            let _ = evicted.reply.send(Err(GatewayError::ChannelBackpressure {
                                channel: self.channel,
                                queued: pending.len() + 1,
                            }));
                        }
                    }
                }
            }
            pending.push_back(QueuedSend { envelope, reply });
            pending.len() + in_flight
        };

        tracing::info!(
            event_name = "channel.outbound.queued",
            channel = %self.channel,
            position,
            "outbound send queued behind saturated adapter"
        );
        self.notify.notify_one();
        Ok(DispatchOutcome::Queued { position, receipt })
    }

    /// Sends queued envelopes in order until the queue empties or the adapter
    /// saturates again. Returns how many sends were resolved. A drain already
    /// in progress elsewhere keeps the queue; this call then resolves nothing.
    pub async fn drain(&self, adapter: &dyn ChannelAdapter, retry: &RetryPolicy) -> usize {
        let mut resolved = 0;
        loop {
            if adapter.is_saturated() {
                break;
            }
            let next = {
                let mut state = self.lock();
                if state.in_flight {
                    break;
                }
                let Some(next) = state.pending.pop_front() else {
                    break;
                };
                state.in_flight = true;
                next
            };
            let in_flight = InFlight { queue: self };
            let result = match send_with_retry(adapter, &next.envelope, retry).await {
                Ok(receipt) => Ok(receipt),
                Err(SendFailure::Failed(error)) => Err(error),
                Err(SendFailure::Saturated) => {
                    self.lock().pending.push_front(next);
                    break;
                }
            };
            drop(in_flight);
            let _ = next.reply.send(result);
            resolved += 1;
        }
        if resolved > 0 {
            tracing::debug!(
                event_name = "channel.outbound.drained",
                channel = %self.channel,
                resolved,
                remaining = self.len(),
                "outbound queue drained"
            );
        }
        resolved
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Fails every waiting send; used on shutdown.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<QueuedSend> = self.lock().pending.drain(..).collect();
        let count = drained.len();
        for queued in drained {
            let _ = queued.reply.send(Err(GatewayError::ChannelBackpressure {
                channel: self.channel,
                queued: count,
            }));
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Retries transient failures with bounded backoff. Saturation is handed back
/// to the caller so it can queue instead of spinning.
pub(crate) async fn send_with_retry(
    adapter: &dyn ChannelAdapter,
    envelope: &OutboundEnvelope,
    retry: &RetryPolicy,
) -> Result<DeliveryReceipt, SendFailure> {
    let channel = adapter.channel_type();
    let mut attempt = 0;
    loop {
        match adapter.send(envelope).await {
            Ok(receipt) => return Ok(receipt),
            Err(DeliveryError::Saturated) => return Err(SendFailure::Saturated),
            Err(DeliveryError::Rejected(message)) => {
                tracing::warn!(
                    event_name = "channel.outbound.rejected_by_platform",
                    channel = %channel,
                    error = %message,
                    "platform rejected outbound send"
                );
                return Err(SendFailure::Failed(GatewayError::TransientChannel {
                    channel,
                    message,
                    attempts: attempt + 1,
                }));
            }
            Err(DeliveryError::Transient(message)) => {
                if attempt >= retry.max_retries {
                    tracing::warn!(
                        event_name = "channel.outbound.failed",
                        channel = %channel,
                        attempts = attempt + 1,
                        error = %message,
                        "outbound send retries exhausted"
                    );
                    return Err(SendFailure::Failed(GatewayError::TransientChannel {
                        channel,
                        message,
                        attempts: attempt + 1,
                    }));
                }
                let delay = retry.backoff(attempt);
                tracing::debug!(
                    event_name = "channel.outbound.retry",
                    channel = %channel,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %message,
                    "retrying outbound send"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

pub(crate) type SharedQueue = Arc<OutboundQueue>;

#[cfg(test)]
mod tests {
    use switchboard_core::config::OverflowPolicy;
    use switchboard_core::domain::channel::{ChannelIdentity, ChannelType, OutboundEnvelope};
    use switchboard_core::errors::GatewayError;

    use super::{DispatchOutcome, OutboundQueue};

    fn envelope(text: &str) -> OutboundEnvelope {
        OutboundEnvelope::text(ChannelIdentity::direct(ChannelType::Discord, "u1"), text)
    }

    #[tokio::test]
    async fn drop_oldest_signals_evicted_caller() {
        let queue = OutboundQueue::new(ChannelType::Discord, 1, OverflowPolicy::DropOldest);

        let first = queue.enqueue(envelope("one"));
        let second = queue.enqueue(envelope("two"));
        assert!(matches!(second, Ok(DispatchOutcome::Queued { position: 1, .. })));

        let Ok(DispatchOutcome::Queued { receipt, .. }) = first else {
            panic!("first send should have been queued");
        };
        assert!(matches!(
            receipt.await,
            Ok(Err(GatewayError::ChannelBackpressure { channel: ChannelType::Discord, .. }))
        ));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn reject_new_refuses_when_full() {
        let queue = OutboundQueue::new(ChannelType::Discord, 1, OverflowPolicy::RejectNew);

        assert!(queue.enqueue(envelope("one")).is_ok());
        assert!(matches!(
            queue.enqueue(envelope("two")),
            Err(GatewayError::ChannelBackpressure { queued: 1, .. })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_resolves_waiters() {
        let queue = OutboundQueue::new(ChannelType::Discord, 4, OverflowPolicy::DropOldest);
        let Ok(DispatchOutcome::Queued { receipt, .. }) = queue.enqueue(envelope("one")) else {
            panic!("send should have been queued");
        };

        assert_eq!(queue.fail_all(), 1);
        assert!(matches!(receipt.await, Ok(Err(_))));
    }
}
