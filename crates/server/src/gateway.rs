use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use switchboard_agent::AgentRuntime;
use switchboard_channels::{ChannelRouter, Claim, InboundSink, IngestOutcome, IngestReceipt};
use switchboard_core::domain::channel::{
    ChannelIdentity, ChannelType, ConversationKey, InboundEnvelope, OutboundEnvelope,
};
use switchboard_core::domain::session::{HistoryRole, SessionId};
use switchboard_core::errors::GatewayError;
use switchboard_core::multiplexer::{EventType, StreamMultiplexer};
use switchboard_core::session::{InvocationPermit, SessionRegistry};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LANE_IDLE: Duration = Duration::from_secs(30);

type LaneKey = (ChannelType, ConversationKey);

struct Lane {
    id: u64,
    sender: mpsc::UnboundedSender<InboundEnvelope>,
}

struct Admitted {
    envelope: InboundEnvelope,
    session_id: SessionId,
    permit: InvocationPermit,
}

struct GatewayInner {
    sessions: Arc<SessionRegistry>,
    router: Arc<ChannelRouter>,
    runtime: AgentRuntime,
    events: StreamMultiplexer,
    lanes: Mutex<HashMap<LaneKey, Lane>>,
    next_lane: AtomicU64,
    lane_idle: Duration,
}

/// Inbound message pipeline: de-duplicate, resolve the session, run the
/// agent, route the reply back out.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        router: Arc<ChannelRouter>,
        runtime: AgentRuntime,
        events: StreamMultiplexer,
    ) -> Self {
        Self::with_lane_idle(sessions, router, runtime, events, LANE_IDLE)
    }

    /// `lane_idle` is how long a conversation's ordering lane lingers with no
    /// traffic before its worker exits.
    pub fn with_lane_idle(
        sessions: Arc<SessionRegistry>,
        router: Arc<ChannelRouter>,
        runtime: AgentRuntime,
        events: StreamMultiplexer,
        lane_idle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                sessions,
                router,
                runtime,
                events,
                lanes: Mutex::new(HashMap::new()),
                next_lane: AtomicU64::new(1),
                lane_idle,
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.inner.router
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.inner.runtime
    }

    pub fn events(&self) -> &StreamMultiplexer {
        &self.inner.events
    }

    /// Processes one message to completion and returns its outcome. A
    /// replayed message id returns the first outcome without invoking the
    /// agent again.
    pub async fn handle_inbound(&self, envelope: InboundEnvelope) -> IngestReceipt {
        let inner = self.inner.clone();
        self.inner
            .router
            .ingest(envelope, |envelope| async move {
                match inner.admit(envelope).await {
                    Ok(admitted) => inner.respond(admitted).await,
                    Err(outcome) => outcome,
                }
            })
            .await
    }

    /// Queues a message on its conversation lane and returns immediately.
    /// Messages of one conversation are admitted in submission order.
    pub fn submit(&self, envelope: InboundEnvelope) {
        let key: LaneKey = (envelope.channel_type, envelope.identity.conversation_key());
        let mut lanes = self.inner.lock_lanes();

        let envelope = match lanes.get(&key) {
            Some(lane) => match lane.sender.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => envelope,
        };

        let lane_id = self.inner.next_lane.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(envelope);
        lanes.insert(key.clone(), Lane { id: lane_id, sender });
        drop(lanes);

        debug!(
            event_name = "gateway.lane.opened",
            channel = %key.0,
            conversation_key = %key.1,
            lane_id,
            "conversation lane opened"
        );
        tokio::spawn(run_lane(self.inner.clone(), key, lane_id, receiver));
    }

    /// Cancels the session's in-flight invocation. Tools it started are
    /// cancelled and whatever output had streamed goes out flagged partial.
    pub async fn stop(&self, session_id: &SessionId) -> Result<bool, GatewayError> {
        self.inner.sessions.cancel_invocation(session_id).await
    }

    pub async fn reset(&self, identity: &ChannelIdentity) -> Option<SessionId> {
        self.inner.sessions.reset(identity).await
    }

    pub fn lane_count(&self) -> usize {
        self.inner.lock_lanes().len()
    }

    /// Drops every lane sender; workers finish what is queued and exit.
    pub fn close_lanes(&self) -> usize {
        let mut lanes = self.inner.lock_lanes();
        let closed = lanes.len();
        lanes.clear();
        closed
    }
}

#[async_trait]
impl InboundSink for Gateway {
    async fn accept(&self, envelope: InboundEnvelope) {
        self.submit(envelope);
    }
}

async fn run_lane(
    inner: Arc<GatewayInner>,
    key: LaneKey,
    lane_id: u64,
    mut receiver: mpsc::UnboundedReceiver<InboundEnvelope>,
) {
    loop {
        tokio::select! {
            envelope = receiver.recv() => match envelope {
                Some(envelope) => inner.clone().accept_ordered(envelope).await,
                None => break,
            },
            _ = tokio::time::sleep(inner.lane_idle) => {
                inner.retire_lane(&key, lane_id);
                break;
            }
        }
    }
    while let Ok(envelope) = receiver.try_recv() {
        inner.clone().accept_ordered(envelope).await;
    }
    debug!(
        event_name = "gateway.lane.closed",
        channel = %key.0,
        conversation_key = %key.1,
        lane_id,
        "conversation lane closed"
    );
}

/// A session expired mid-pipeline is expected; anything else is logged.
fn session_bookkeeping(session_id: &SessionId, operation: &'static str, result: Result<(), GatewayError>) {
    match result {
        Ok(()) => {}
        Err(GatewayError::SessionNotFound(_)) => debug!(
            event_name = "gateway.session.gone",
            session_id = %session_id,
            operation,
            "session expired before bookkeeping"
        ),
        Err(error) => warn!(
            event_name = "gateway.session.bookkeeping_failed",
            session_id = %session_id,
            operation,
            error = %error,
            error_class = error.error_class(),
            "session bookkeeping failed"
        ),
    }
}

impl GatewayInner {
    /// Admission happens on the lane, so sessions see messages in arrival
    /// order; the agent run itself is spawned.
    async fn accept_ordered(self: Arc<Self>, envelope: InboundEnvelope) {
        match self.router.claim(&envelope) {
            Claim::First(ticket) => match self.admit(envelope).await {
                Ok(admitted) => {
                    let inner = self.clone();
                    tokio::spawn(async move {
                        let outcome = inner.respond(admitted).await;
                        ticket.complete(outcome);
                    });
                }
                Err(outcome) => ticket.complete(outcome),
            },
            Claim::Duplicate(_) => {
                info!(
                    event_name = "gateway.message.duplicate",
                    channel = %envelope.channel_type,
                    message_id = %envelope.message_id.0,
                    "duplicate inbound message dropped"
                );
            }
        }
    }

    async fn admit(&self, envelope: InboundEnvelope) -> Result<Admitted, IngestOutcome> {
        let session = self.sessions.resolve(&envelope.identity).await;
        session_bookkeeping(&session.id, "touch", self.sessions.touch(&session.id).await);

        self.events.emit(
            EventType::MessageReceived,
            &session.id,
            json!({
                "messageId": envelope.message_id.0,
                "channel": envelope.channel_type,
                "senderId": envelope.sender_id,
                "text": envelope.text(),
            }),
        );
        info!(
            event_name = "gateway.message.received",
            session_id = %session.id,
            channel = %envelope.channel_type,
            message_id = %envelope.message_id.0,
            "inbound message accepted"
        );

        match self.sessions.begin_invocation(&session.id).await {
            Ok(permit) => Ok(Admitted { envelope, session_id: session.id, permit }),
            Err(error) => {
                self.notify(&envelope, &error).await;
                Err(IngestOutcome::failed(Some(session.id), error))
            }
        }
    }

    async fn respond(&self, admitted: Admitted) -> IngestOutcome {
        let Admitted { envelope, session_id, permit } = admitted;
        let text = envelope.text();
        let history = self.sessions.history(&session_id).await.unwrap_or_default();
        session_bookkeeping(
            &session_id,
            "append_history",
            self.sessions.append_history(&session_id, HistoryRole::User, text.clone()).await,
        );

        let result = self.runtime.run(&session_id, &text, history, permit.token()).await;
        let outcome = match result {
            Ok(outcome) => {
                if !outcome.text.is_empty() {
                    let appended = self
                        .sessions
                        .append_history(&session_id, HistoryRole::Assistant, outcome.text.clone())
                        .await;
                    session_bookkeeping(&session_id, "append_history", appended);
                }
                let partial = outcome.is_partial();
                let error = self.reply(&envelope, &outcome.text, partial).await.err();
                IngestOutcome {
                    session_id: Some(session_id.clone()),
                    reply: Some(outcome.text),
                    partial,
                    error,
                }
            }
            Err(error @ GatewayError::InvocationAborted { .. }) => {
                let partial_output = match &error {
                    GatewayError::InvocationAborted { partial_output, .. } => partial_output.clone(),
                    _ => String::new(),
                };
                if partial_output.is_empty() {
                    self.notify(&envelope, &error).await;
                } else {
                    let _ = self.reply(&envelope, &partial_output, true).await;
                }
                IngestOutcome {
                    session_id: Some(session_id.clone()),
                    reply: (!partial_output.is_empty()).then_some(partial_output),
                    partial: true,
                    error: Some(error),
                }
            }
            Err(error) => {
                self.notify(&envelope, &error).await;
                IngestOutcome::failed(Some(session_id.clone()), error)
            }
        };

        drop(permit);
        session_bookkeeping(&session_id, "touch", self.sessions.touch(&session_id).await);
        outcome
    }

    async fn reply(&self, inbound: &InboundEnvelope, text: &str, partial: bool) -> Result<(), GatewayError> {
        if text.is_empty() {
            return Ok(());
        }
        let mut outbound = OutboundEnvelope::text(inbound.identity.clone(), text)
            .replying_to(inbound.message_id.clone());
        if partial {
            outbound = outbound.flagged_partial();
        }

        match self.router.deliver(outbound).await {
            Ok(_) => Ok(()),
            Err(error) => {
                warn!(
                    event_name = "gateway.reply.failed",
                    channel = %inbound.channel_type,
                    message_id = %inbound.message_id.0,
                    error_class = error.error_class(),
                    error = %error,
                    "reply could not be delivered"
                );
                if matches!(error, GatewayError::TransientChannel { .. }) {
                    self.notify(inbound, &error).await;
                }
                Err(error)
            }
        }
    }

    /// Best effort; a notice that cannot be sent is only logged.
    async fn notify(&self, inbound: &InboundEnvelope, error: &GatewayError) {
        let Some(notice) = error.user_message() else {
            return;
        };
        let outbound = OutboundEnvelope::text(inbound.identity.clone(), notice)
            .replying_to(inbound.message_id.clone());
        if let Err(send_error) = self.router.dispatch(outbound).await {
            warn!(
                event_name = "gateway.notice.failed",
                channel = %inbound.channel_type,
                error_class = error.error_class(),
                error = %send_error,
                "conversation notice could not be sent"
            );
        }
    }

    fn retire_lane(&self, key: &LaneKey, lane_id: u64) {
        let mut lanes = self.lock_lanes();
        if lanes.get(key).is_some_and(|lane| lane.id == lane_id) {
            lanes.remove(key);
        }
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<LaneKey, Lane>> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
