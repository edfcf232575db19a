use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::session::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.expired")]
    SessionExpired,
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "tool.invoked")]
    ToolInvoked,
    #[serde(rename = "tool.completed")]
    ToolCompleted,
    #[serde(rename = "stream.token")]
    StreamToken,
    #[serde(rename = "stream.error")]
    StreamError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionExpired => "session.expired",
            Self::MessageReceived => "message.received",
            Self::ToolInvoked => "tool.invoked",
            Self::ToolCompleted => "tool.completed",
            Self::StreamToken => "stream.token",
            Self::StreamError => "stream.error",
        }
    }
}

/// One control-plane event as serialized onto the observer stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: SessionId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ControlEvent {
    pub fn new(event_type: EventType, session_id: SessionId, payload: Value) -> Self {
        Self { event_type, session_id, payload, timestamp: Utc::now() }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The subscriber fell behind and its buffer filled up.
    Overflow,
    /// The multiplexer was shut down.
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overflow => "subscriber_overflow",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("subscription closed: {}", .reason.as_str())]
pub struct SubscriptionClosed {
    pub reason: DisconnectReason,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub disconnected: usize,
}

struct Subscriber {
    sender: mpsc::Sender<ControlEvent>,
    filter: Option<SessionId>,
    reason: Arc<OnceLock<DisconnectReason>>,
}

struct Inner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Non-blocking fan-out of control-plane events. Each subscriber owns a
/// bounded buffer; a full buffer disconnects that subscriber only.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl StreamMultiplexer {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn subscribe(&self, filter: Option<SessionId>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let reason = Arc::new(OnceLock::new());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.inner.subscribers)
            .insert(id, Subscriber { sender, filter: filter.clone(), reason: reason.clone() });

        tracing::debug!(
            event_name = "events.subscriber.attached",
            subscriber_id = id,
            session_filter = filter.as_ref().map(|session| session.0.as_str()),
            "event subscriber attached"
        );
        Subscription { id, receiver, reason, multiplexer: self.clone() }
    }

    /// Never blocks; with zero subscribers this is a no-op.
    pub fn publish(&self, event: ControlEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let mut subscribers = lock_or_recover(&self.inner.subscribers);
        if subscribers.is_empty() {
            return report;
        }

        let mut overflowed = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            if subscriber.filter.as_ref().is_some_and(|filter| filter != &event.session_id) {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let _ = subscriber.reason.set(DisconnectReason::Overflow);
                    overflowed.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => overflowed.push(*id),
            }
        }

        for id in overflowed {
            if subscribers.remove(&id).is_some() {
                report.disconnected += 1;
                tracing::warn!(
                    event_name = "events.subscriber.disconnected",
                    subscriber_id = id,
                    event_type = event.event_type.as_str(),
                    session_id = %event.session_id,
                    "event subscriber disconnected"
                );
            }
        }
        report
    }

    pub fn emit(&self, event_type: EventType, session_id: &SessionId, payload: Value) {
        self.publish(ControlEvent::new(event_type, session_id.clone(), payload));
    }

    pub fn subscriber_count(&self) -> usize {
        lock_or_recover(&self.inner.subscribers).len()
    }

    /// Drops every subscriber; their streams end with `DisconnectReason::Shutdown`.
    pub fn close_all(&self) {
        let mut subscribers = lock_or_recover(&self.inner.subscribers);
        for subscriber in subscribers.values() {
            let _ = subscriber.reason.set(DisconnectReason::Shutdown);
        }
        subscribers.clear();
    }

    fn detach(&self, id: u64) {
        lock_or_recover(&self.inner.subscribers).remove(&id);
    }
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<ControlEvent>,
    reason: Arc<OnceLock<DisconnectReason>>,
    multiplexer: StreamMultiplexer,
}

impl Subscription {
    /// Buffered events are drained before the disconnect is reported.
    pub async fn recv(&mut self) -> Result<ControlEvent, SubscriptionClosed> {
        match self.receiver.recv().await {
            Some(event) => Ok(event),
            None => Err(SubscriptionClosed {
                reason: self.reason.get().copied().unwrap_or(DisconnectReason::Shutdown),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.multiplexer.detach(self.id);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ControlEvent, DisconnectReason, EventType, StreamMultiplexer};
    use crate::domain::session::SessionId;

    fn session(id: &str) -> SessionId {
        SessionId(id.to_owned())
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let multiplexer = StreamMultiplexer::new(4);
        let report = multiplexer.publish(ControlEvent::new(
            EventType::StreamToken,
            session("ses-1"),
            json!({"text": "Hello"}),
        ));

        assert_eq!(report.delivered, 0);
        assert_eq!(report.disconnected, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_without_affecting_others() {
        let multiplexer = StreamMultiplexer::new(2);
        let mut slow = multiplexer.subscribe(None);
        let mut fast = multiplexer.subscribe(None);

        for index in 0..2 {
            multiplexer.emit(EventType::StreamToken, &session("ses-1"), json!({ "index": index }));
            let received = fast.recv().await;
            assert!(received.is_ok());
        }
        let report = multiplexer.publish(ControlEvent::new(
            EventType::StreamToken,
            session("ses-1"),
            json!({"index": 2}),
        ));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.disconnected, 1);
        assert_eq!(multiplexer.subscriber_count(), 1);
        assert!(fast.recv().await.is_ok());

        assert!(slow.recv().await.is_ok());
        assert!(slow.recv().await.is_ok());
        let closed = slow.recv().await;
        assert_eq!(closed.map_err(|closed| closed.reason), Err(DisconnectReason::Overflow));
    }

    #[tokio::test]
    async fn session_filter_only_delivers_matching_events() {
        let multiplexer = StreamMultiplexer::new(8);
        let mut filtered = multiplexer.subscribe(Some(session("ses-2")));

        multiplexer.emit(EventType::MessageReceived, &session("ses-1"), json!({}));
        multiplexer.emit(EventType::MessageReceived, &session("ses-2"), json!({"text": "hi"}));

        let event = filtered.recv().await.map_err(|closed| closed.to_string());
        assert_eq!(event.map(|event| event.session_id), Ok(session("ses-2")));
    }

    #[test]
    fn frames_use_dotted_type_names_and_camel_case_fields() {
        let event = ControlEvent::new(EventType::SessionCreated, session("ses-1"), json!({}));
        let frame = event.to_frame().unwrap_or_default();

        assert!(frame.contains("\"type\":\"session.created\""));
        assert!(frame.contains("\"sessionId\":\"ses-1\""));
    }

    #[test]
    fn dropping_a_subscription_detaches_it() {
        let multiplexer = StreamMultiplexer::new(4);
        let subscription = multiplexer.subscribe(None);
        assert_eq!(multiplexer.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(multiplexer.subscriber_count(), 0);
    }
}
