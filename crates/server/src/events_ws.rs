use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use switchboard_core::domain::session::SessionId;
use switchboard_core::multiplexer::{DisconnectReason, StreamMultiplexer};
use tracing::{info, warn};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub session_id: Option<String>,
}

impl EventsQuery {
    fn filter(self) -> Option<SessionId> {
        self.session_id.filter(|id| !id.trim().is_empty()).map(SessionId)
    }
}

/// `GET /v1/events`: control-plane events as JSON text frames, optionally
/// narrowed to one session with `?session_id=`.
pub fn router(events: StreamMultiplexer) -> Router {
    Router::new().route("/v1/events", get(subscribe)).with_state(events)
}

async fn subscribe(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(events): State<StreamMultiplexer>,
) -> impl IntoResponse {
    let filter = query.filter();
    ws.on_upgrade(move |socket| stream_events(socket, events, filter))
}

async fn stream_events(mut socket: WebSocket, events: StreamMultiplexer, filter: Option<SessionId>) {
    let mut subscription = events.subscribe(filter.clone());
    let subscriber_id = subscription.id();
    info!(
        event_name = "events.subscriber.connected",
        subscriber_id,
        session_filter = filter.as_ref().map(|id| id.0.as_str()).unwrap_or("*"),
        "event subscriber connected"
    );

    let mut close_reason = "client_closed";
    loop {
        tokio::select! {
            received = subscription.recv() => match received {
                Ok(event) => {
                    let frame = match event.to_frame() {
                        Ok(frame) => frame,
                        Err(error) => {
                            warn!(
                                event_name = "events.frame.encode_failed",
                                subscriber_id,
                                error = %error,
                                "event could not be encoded"
                            );
                            continue;
                        }
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        close_reason = "send_failed";
                        break;
                    }
                }
                Err(closed) => {
                    close_reason = closed.reason.as_str();
                    let _ = socket.send(Message::Close(Some(close_frame(closed.reason)))).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(
        event_name = "events.subscriber.disconnected",
        subscriber_id,
        reason = close_reason,
        "event subscriber disconnected"
    );
}

/// Close frame sent when the multiplexer drops a subscriber.
pub fn close_frame(reason: DisconnectReason) -> CloseFrame {
    let code = match reason {
        DisconnectReason::Overflow => close_code::AGAIN,
        DisconnectReason::Shutdown => close_code::AWAY,
    };
    CloseFrame { code, reason: reason.as_str().into() }
}
