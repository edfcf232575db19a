use async_trait::async_trait;
use serde_json::Value;
use switchboard_core::auth::ProfileLease;
use switchboard_core::domain::session::{HistoryEntry, HistoryRole, SessionId};
use switchboard_core::domain::tool::CorrelationId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::ToolResult;

/// One item of an agent response stream.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationEvent {
    Token(String),
    ToolCall { correlation_id: CorrelationId, tool_name: String, args: Value },
    Completion,
    /// `provider_failure` marks errors caused by the model provider (rate
    /// limit, outage, bad credential) as opposed to the runtime itself.
    Error { message: String, provider_failure: bool },
}

#[derive(Clone, Debug)]
pub struct InvocationRequest {
    pub session_id: SessionId,
    pub profile: ProfileLease,
    pub history: Vec<HistoryEntry>,
    pub message: String,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("provider refused the invocation: {0}")]
    Provider(String),
    #[error("invocation runtime unavailable: {0}")]
    Unavailable(String),
}

impl InvocationError {
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

/// Starts agent invocations. Implementations stream their output through a
/// `TokenSink` and read tool results back from it.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<TokenStream, InvocationError>;
}

/// Consumer half of an invocation. The event buffer is bounded, so a slow
/// consumer holds the producer back.
pub struct TokenStream {
    events: mpsc::Receiver<InvocationEvent>,
    results: mpsc::UnboundedSender<ToolResult>,
}

/// Producer half of an invocation.
pub struct TokenSink {
    events: mpsc::Sender<InvocationEvent>,
    results: mpsc::UnboundedReceiver<ToolResult>,
    cancel: CancellationToken,
}

pub fn token_stream(buffer: usize, cancel: CancellationToken) -> (TokenSink, TokenStream) {
    let (event_sender, event_receiver) = mpsc::channel(buffer.max(1));
    let (result_sender, result_receiver) = mpsc::unbounded_channel();
    (
        TokenSink { events: event_sender, results: result_receiver, cancel },
        TokenStream { events: event_receiver, results: result_sender },
    )
}

impl TokenStream {
    pub async fn next(&mut self) -> Option<InvocationEvent> {
        self.events.recv().await
    }

    /// Hands a tool result back to the producer; `false` once it has gone away.
    pub fn inject(&self, result: ToolResult) -> bool {
        self.results.send(result).is_ok()
    }
}

impl TokenSink {
    /// Waits for buffer space. Returns `false` when the invocation was
    /// cancelled or the consumer dropped the stream.
    pub async fn emit(&self, event: InvocationEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    pub async fn tool_result(&mut self) -> Option<ToolResult> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.results.recv() => result,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Streams the latest user message back word by word. Used for wiring a
/// gateway without a model behind it.
#[derive(Clone, Debug)]
pub struct EchoInvoker {
    buffer: usize,
}

impl EchoInvoker {
    pub fn new(buffer: usize) -> Self {
        Self { buffer }
    }
}

impl Default for EchoInvoker {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<TokenStream, InvocationError> {
        let (sink, stream) = token_stream(self.buffer, request.cancel.clone());
        let text = if request.message.trim().is_empty() {
            request
                .history
                .iter()
                .rev()
                .find(|entry| entry.role == HistoryRole::User)
                .map(|entry| entry.text.clone())
                .unwrap_or_default()
        } else {
            request.message
        };

        tokio::spawn(async move {
            let mut first = true;
            for word in text.split_whitespace() {
                let chunk = if first { word.to_owned() } else { format!(" {word}") };
                first = false;
                if !sink.emit(InvocationEvent::Token(chunk)).await {
                    return;
                }
            }
            let _ = sink.emit(InvocationEvent::Completion).await;
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use switchboard_core::auth::ProfileLease;
    use switchboard_core::domain::profile::ProfileId;
    use switchboard_core::domain::session::SessionId;
    use tokio_util::sync::CancellationToken;

    use super::{token_stream, AgentInvoker, EchoInvoker, InvocationEvent, InvocationRequest};

    fn request(message: &str, cancel: CancellationToken) -> InvocationRequest {
        InvocationRequest {
            session_id: SessionId("ses-1".to_owned()),
            profile: ProfileLease {
                id: ProfileId("p1".to_owned()),
                provider_id: "test".to_owned(),
                credential_ref: "env:TEST".to_owned(),
                api_key: None,
            },
            history: Vec::new(),
            message: message.to_owned(),
            cancel,
        }
    }

    #[tokio::test]
    async fn echo_invoker_streams_words_then_completes() {
        let stream = EchoInvoker::default().invoke(request("hello there", CancellationToken::new())).await;
        let Ok(mut stream) = stream else {
            panic!("echo invoker should always start");
        };

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                InvocationEvent::Token("hello".to_owned()),
                InvocationEvent::Token(" there".to_owned()),
                InvocationEvent::Completion,
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_sink_stops_emitting() {
        let cancel = CancellationToken::new();
        let (sink, mut stream) = token_stream(1, cancel.clone());

        assert!(sink.emit(InvocationEvent::Token("a".to_owned())).await);
        cancel.cancel();
        assert!(!sink.emit(InvocationEvent::Token("b".to_owned())).await);
        drop(sink);

        assert_eq!(stream.next().await, Some(InvocationEvent::Token("a".to_owned())));
        assert_eq!(stream.next().await, None);
    }
}
