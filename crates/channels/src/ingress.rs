use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::domain::channel::{ChannelType, InboundEnvelope};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::normalize::{normalize, AdapterEvent};
use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

/// Inbound half of a chat-platform integration.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn channel_type(&self) -> ChannelType;
    async fn connect(&self) -> Result<(), TransportError>;
    /// `Ok(None)` means the platform closed the stream cleanly.
    async fn next_event(&self) -> Result<Option<AdapterEvent>, TransportError>;
    async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Receives normalized envelopes from an `IngressRunner`.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn accept(&self, envelope: InboundEnvelope);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngressExit {
    StreamClosed,
    Shutdown,
    RetriesExhausted,
}

/// Receive loop for one transport, reconnecting with exponential backoff.
/// Transport failures end the loop quietly; they never take the process down.
pub struct IngressRunner {
    transport: Arc<dyn ChannelTransport>,
    sink: Arc<dyn InboundSink>,
    reconnect_policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl IngressRunner {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        sink: Arc<dyn InboundSink>,
        reconnect_policy: RetryPolicy,
    ) -> Self {
        Self { transport, sink, reconnect_policy, shutdown: CancellationToken::new() }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The retry budget counts consecutive failures; a connection that
    /// delivers at least one event starts the count over.
    pub async fn start(&self) -> IngressExit {
        let channel = self.transport.channel_type();
        let mut attempt: u32 = 0;
        loop {
            let mut delivered = false;
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let _ = self.transport.disconnect().await;
                    info!(event_name = "ingress.transport.shutdown", channel = %channel, "ingress stopped");
                    return IngressExit::Shutdown;
                }
                result = self.connect_and_pump(attempt, &mut delivered) => result,
            };

            let transport_error = match result {
                Ok(()) => return IngressExit::StreamClosed,
                Err(transport_error) => transport_error,
            };
            if delivered {
                attempt = 0;
            }
            warn!(
                event_name = "ingress.transport.failed",
                channel = %channel,
                attempt,
                max_retries = self.reconnect_policy.max_retries,
                error = %transport_error,
                "channel transport failed"
            );

            if attempt >= self.reconnect_policy.max_retries {
                warn!(
                    event_name = "ingress.transport.retries_exhausted",
                    channel = %channel,
                    max_retries = self.reconnect_policy.max_retries,
                    "transport retries exhausted; continuing process without crash"
                );
                return IngressExit::RetriesExhausted;
            }

            let delay = self.reconnect_policy.backoff(attempt);
            attempt += 1;
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return IngressExit::Shutdown,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn connect_and_pump(&self, attempt: u32, delivered: &mut bool) -> Result<(), TransportError> {
        let channel = self.transport.channel_type();
        info!(event_name = "ingress.transport.connecting", channel = %channel, attempt, "opening channel transport");
        self.transport.connect().await?;

        loop {
            let Some(event) = self.transport.next_event().await? else {
                info!(event_name = "ingress.transport.closed", channel = %channel, attempt, "channel transport stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            *delivered = true;
            let message_id = event.message_id().to_owned();

            if let Err(error) = self.transport.acknowledge(&message_id).await {
                warn!(
                    event_name = "ingress.transport.ack_failed",
                    channel = %channel,
                    message_id = %message_id,
                    error = %error,
                    "failed to acknowledge inbound event"
                );
            } else {
                debug!(
                    event_name = "ingress.transport.ack_sent",
                    channel = %channel,
                    message_id = %message_id,
                    "acknowledged inbound event"
                );
            }

            match normalize(event) {
                Ok(envelope) => self.sink.accept(envelope).await,
                Err(error) => warn!(
                    event_name = "ingress.event.rejected",
                    channel = %channel,
                    message_id = %message_id,
                    error = %error,
                    "inbound event could not be normalized; skipping"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use switchboard_core::domain::channel::{ChannelType, InboundEnvelope};
    use tokio::sync::Mutex;

    use super::{ChannelTransport, InboundSink, IngressExit, IngressRunner, TransportError};
    use crate::normalize::{AdapterEvent, RawMessage};
    use crate::retry::RetryPolicy;

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        events: VecDeque<Result<Option<AdapterEvent>, TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            events: Vec<Result<Option<AdapterEvent>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    events: events.into(),
                    ..ScriptedState::default()
                }),
            }
        }
    }

    #[async_trait]
    impl ChannelTransport for ScriptedTransport {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Matrix
        }

        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_event(&self) -> Result<Option<AdapterEvent>, TransportError> {
            let mut state = self.state.lock().await;
            state.events.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError> {
            self.state.lock().await.acknowledgements.push(message_id.to_owned());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.state.lock().await.disconnect_calls += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        accepted: Mutex<Vec<InboundEnvelope>>,
    }

    #[async_trait]
    impl InboundSink for CollectingSink {
        async fn accept(&self, envelope: InboundEnvelope) {
            self.accepted.lock().await.push(envelope);
        }
    }

    fn direct(message_id: &str, text: Option<&str>) -> AdapterEvent {
        AdapterEvent::DirectMessage(RawMessage {
            channel_type: ChannelType::Matrix,
            message_id: message_id.to_owned(),
            sender_id: "@alice:example.org".to_owned(),
            text: text.map(str::to_owned),
            media: Vec::new(),
            sent_at: None,
        })
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(direct("evt-1", Some("hi")))), Ok(None)],
        ));
        let sink = Arc::new(CollectingSink::default());
        let runner = IngressRunner::new(transport.clone(), sink.clone(), RetryPolicy::immediate(2));

        assert_eq!(runner.start().await, IngressExit::StreamClosed);

        let state = transport.state.lock().await;
        assert_eq!(state.connect_attempts, 2);
        assert_eq!(state.acknowledgements, vec!["evt-1"]);
        assert_eq!(state.disconnect_calls, 1);
        assert_eq!(sink.accepted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            Vec::new(),
        ));
        let runner = IngressRunner::new(
            transport.clone(),
            Arc::new(CollectingSink::default()),
            RetryPolicy::immediate(2),
        );

        assert_eq!(runner.start().await, IngressExit::RetriesExhausted);
        assert_eq!(transport.state.lock().await.connect_attempts, 3);
    }

    #[tokio::test]
    async fn connections_that_deliver_reset_the_retry_budget() {
        let transport = Arc::new(ScriptedTransport::with_script(
            Vec::new(),
            vec![
                Ok(Some(direct("evt-1", Some("one")))),
                Err(TransportError::Receive("dropped".to_owned())),
                Ok(Some(direct("evt-2", Some("two")))),
                Err(TransportError::Receive("dropped again".to_owned())),
                Ok(Some(direct("evt-3", Some("three")))),
                Ok(None),
            ],
        ));
        let sink = Arc::new(CollectingSink::default());
        let runner = IngressRunner::new(transport.clone(), sink.clone(), RetryPolicy::immediate(1));

        assert_eq!(runner.start().await, IngressExit::StreamClosed);

        assert_eq!(transport.state.lock().await.connect_attempts, 3);
        assert_eq!(sink.accepted.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn malformed_events_are_acknowledged_and_skipped() {
        let transport = Arc::new(ScriptedTransport::with_script(
            Vec::new(),
            vec![
                Ok(Some(direct("evt-1", None))),
                Ok(Some(direct("evt-2", Some("hello")))),
                Ok(None),
            ],
        ));
        let sink = Arc::new(CollectingSink::default());
        let runner = IngressRunner::new(transport.clone(), sink.clone(), RetryPolicy::immediate(0));

        assert_eq!(runner.start().await, IngressExit::StreamClosed);

        let accepted = sink.accepted.lock().await;
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].text(), "hello");
        assert_eq!(transport.state.lock().await.acknowledgements, vec!["evt-1", "evt-2"]);
    }

    #[tokio::test]
    async fn cancelled_runner_stops_before_connecting() {
        let transport = Arc::new(ScriptedTransport::default());
        let shutdown = tokio_util::sync::CancellationToken::new();
        shutdown.cancel();
        let runner = IngressRunner::new(
            transport.clone(),
            Arc::new(CollectingSink::default()),
            RetryPolicy::immediate(0),
        )
        .with_shutdown(shutdown);

        assert_eq!(runner.start().await, IngressExit::Shutdown);
    }
}
