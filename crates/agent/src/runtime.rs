use std::sync::Arc;

use serde_json::json;
use switchboard_core::auth::AuthProfileFailoverManager;
use switchboard_core::domain::profile::ProfileId;
use switchboard_core::domain::session::{HistoryEntry, SessionId};
use switchboard_core::errors::GatewayError;
use switchboard_core::multiplexer::{EventType, StreamMultiplexer};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{ToolExecutionCoordinator, ToolResult};
use crate::invocation::{AgentInvoker, InvocationEvent, InvocationRequest, TokenStream};

/// What one invocation produced.
#[derive(Clone, Debug, PartialEq)]
pub struct InvocationOutcome {
    pub text: String,
    pub profile_id: ProfileId,
    pub tool_results: Vec<ToolResult>,
    /// Set when the agent reported an error after output had streamed.
    pub failure: Option<String>,
    pub attempts: u32,
}

impl InvocationOutcome {
    pub fn is_partial(&self) -> bool {
        self.failure.is_some()
    }
}

enum Attempt {
    Finished(InvocationOutcome),
    /// The provider failed before any output; another profile may be tried.
    ProviderFailed(String),
}

/// Drives one agent invocation: picks a profile, streams tokens out, routes
/// tool calls through the coordinator and feeds their results back.
pub struct AgentRuntime {
    invoker: Arc<dyn AgentInvoker>,
    profiles: Arc<AuthProfileFailoverManager>,
    coordinator: Arc<ToolExecutionCoordinator>,
    events: StreamMultiplexer,
    max_failover_attempts: u32,
}

impl AgentRuntime {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        profiles: Arc<AuthProfileFailoverManager>,
        coordinator: Arc<ToolExecutionCoordinator>,
        events: StreamMultiplexer,
        max_failover_attempts: u32,
    ) -> Self {
        Self { invoker, profiles, coordinator, events, max_failover_attempts }
    }

    pub fn profiles(&self) -> &Arc<AuthProfileFailoverManager> {
        &self.profiles
    }

    pub fn coordinator(&self) -> &Arc<ToolExecutionCoordinator> {
        &self.coordinator
    }

    /// A provider failure before any output is reported against the profile
    /// and retried on the next selectable one, at most
    /// `max_failover_attempts` times. Cancellation ends the run with
    /// `InvocationAborted` carrying whatever text had streamed.
    pub async fn run(
        &self,
        session_id: &SessionId,
        message: &str,
        history: Vec<HistoryEntry>,
        cancel: CancellationToken,
    ) -> Result<InvocationOutcome, GatewayError> {
        let mut attempt = 0;
        loop {
            let lease = match self.profiles.select().await {
                Ok(lease) => lease,
                Err(error) => {
                    self.publish_error(session_id, &error.to_string(), error.error_class());
                    return Err(error);
                }
            };
            let profile_id = lease.id.clone();
            attempt += 1;
            tracing::info!(
                event_name = "agent.invocation.started",
                session_id = %session_id,
                profile_id = %profile_id,
                attempt,
                "agent invocation started"
            );

            let request = InvocationRequest {
                session_id: session_id.clone(),
                profile: lease,
                history: history.clone(),
                message: message.to_owned(),
                cancel: cancel.clone(),
            };
            let result = match self.invoker.invoke(request).await {
                Ok(stream) => self.drive(session_id, &profile_id, stream, &cancel, attempt).await?,
                Err(error) if error.is_provider_failure() => Attempt::ProviderFailed(error.to_string()),
                Err(error) => {
                    self.publish_error(session_id, &error.to_string(), "invocation_unavailable");
                    Attempt::Finished(InvocationOutcome {
                        text: String::new(),
                        profile_id: profile_id.clone(),
                        tool_results: Vec::new(),
                        failure: Some(error.to_string()),
                        attempts: attempt,
                    })
                }
            };

            match result {
                Attempt::Finished(outcome) => {
                    if outcome.failure.is_none() {
                        self.profiles.report_success(&profile_id).await;
                    }
                    tracing::info!(
                        event_name = "agent.invocation.finished",
                        session_id = %session_id,
                        profile_id = %profile_id,
                        attempts = outcome.attempts,
                        partial = outcome.is_partial(),
                        "agent invocation finished"
                    );
                    return Ok(outcome);
                }
                Attempt::ProviderFailed(message) => {
                    self.profiles.report_failure(&profile_id).await;
                    tracing::warn!(
                        event_name = "agent.invocation.provider_failed",
                        session_id = %session_id,
                        profile_id = %profile_id,
                        attempt,
                        error = %message,
                        "provider failed before output"
                    );
                    if attempt > self.max_failover_attempts {
                        let error = GatewayError::NoAvailableProfile;
                        self.publish_error(session_id, &message, error.error_class());
                        return Err(error);
                    }
                }
            }
        }
    }

    async fn drive(
        &self,
        session_id: &SessionId,
        profile_id: &ProfileId,
        mut stream: TokenStream,
        cancel: &CancellationToken,
        attempts: u32,
    ) -> Result<Attempt, GatewayError> {
        let mut batch = self.coordinator.open_batch(session_id, cancel.clone());
        let mut text = String::new();
        let mut produced = false;
        let mut tool_results = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(
                        event_name = "agent.invocation.aborted",
                        session_id = %session_id,
                        partial_chars = text.len(),
                        "agent invocation aborted"
                    );
                    let error = GatewayError::InvocationAborted {
                        session_id: session_id.clone(),
                        partial_output: text,
                    };
                    self.publish_error(session_id, &error.to_string(), error.error_class());
                    return Err(error);
                }
                result = batch.next_result(), if batch.outstanding() > 0 => {
                    if let Some(result) = result {
                        self.record_progress(session_id).await;
                        stream.inject(result.clone());
                        tool_results.push(result);
                    }
                }
                event = stream.next() => match event {
                    Some(InvocationEvent::Token(chunk)) => {
                        produced = true;
                        self.record_progress(session_id).await;
                        self.events.emit(
                            EventType::StreamToken,
                            session_id,
                            json!({ "text": chunk, "profileId": profile_id }),
                        );
                        text.push_str(&chunk);
                    }
                    Some(InvocationEvent::ToolCall { correlation_id, tool_name, args }) => {
                        produced = true;
                        self.record_progress(session_id).await;
                        if let Err(error) = batch.submit(tool_name, correlation_id, args).await {
                            self.publish_error(session_id, &error.to_string(), error.error_class());
                        }
                    }
                    Some(InvocationEvent::Error { message, provider_failure }) => {
                        if provider_failure && !produced {
                            return Ok(Attempt::ProviderFailed(message));
                        }
                        if provider_failure {
                            self.profiles.report_failure(profile_id).await;
                        }
                        self.publish_error(session_id, &message, "invocation_failed");
                        return Ok(Attempt::Finished(InvocationOutcome {
                            text,
                            profile_id: profile_id.clone(),
                            tool_results,
                            failure: Some(message),
                            attempts,
                        }));
                    }
                    Some(InvocationEvent::Completion) | None => {
                        return Ok(Attempt::Finished(InvocationOutcome {
                            text,
                            profile_id: profile_id.clone(),
                            tool_results,
                            failure: None,
                            attempts,
                        }));
                    }
                },
            }
        }
    }

    /// Keeps the session from looking idle while the invocation advances.
    async fn record_progress(&self, session_id: &SessionId) {
        if let Err(error) = self.coordinator.sessions().record_progress(session_id).await {
            tracing::debug!(
                event_name = "agent.invocation.progress_dropped",
                session_id = %session_id,
                error = %error,
                "session gone while invocation in flight"
            );
        }
    }

    fn publish_error(&self, session_id: &SessionId, message: &str, class: &str) {
        self.events.emit(
            EventType::StreamError,
            session_id,
            json!({ "error": class, "message": message }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use switchboard_core::auth::{AuthProfileFailoverManager, ExponentialBackoff, FailoverPolicy};
    use switchboard_core::clock::{ManualClock, SharedClock};
    use switchboard_core::config::{BusyPolicy, ProfileConfig, ToolsConfig};
    use switchboard_core::domain::channel::{ChannelIdentity, ChannelType};
    use switchboard_core::domain::profile::{ProfileId, ProfileStatus};
    use switchboard_core::domain::session::SessionId;
    use switchboard_core::domain::tool::{CorrelationId, ToolAccess};
    use switchboard_core::errors::GatewayError;
    use switchboard_core::multiplexer::StreamMultiplexer;
    use switchboard_core::session::{RegistrySettings, SessionRegistry};
    use tokio_util::sync::CancellationToken;

    use super::AgentRuntime;
    use crate::coordinator::ToolExecutionCoordinator;
    use crate::invocation::{
        token_stream, AgentInvoker, InvocationError, InvocationEvent, InvocationRequest, TokenStream,
    };
    use crate::tools::{Tool, ToolDescriptor, ToolError, ToolRegistry};

    enum Script {
        Refuse,
        Stream(Vec<InvocationEvent>),
        /// Emits one token then waits for cancellation.
        Hang,
        /// Emits a tool call and echoes the injected result as a token.
        CallTool,
    }

    #[derive(Default)]
    struct ScriptedInvoker {
        scripts: Mutex<VecDeque<Script>>,
        profiles_seen: Mutex<Vec<String>>,
    }

    impl ScriptedInvoker {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self { scripts: Mutex::new(scripts.into()), ..Self::default() })
        }

        fn profiles_seen(&self) -> Vec<String> {
            self.profiles_seen.lock().map(|seen| seen.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedInvoker {
        async fn invoke(&self, request: InvocationRequest) -> Result<TokenStream, InvocationError> {
            if let Ok(mut seen) = self.profiles_seen.lock() {
                seen.push(request.profile.id.0.clone());
            }
            let script = self.scripts.lock().ok().and_then(|mut scripts| scripts.pop_front());
            let (mut sink, stream) = token_stream(8, request.cancel.clone());
            match script.unwrap_or(Script::Stream(vec![InvocationEvent::Completion])) {
                Script::Refuse => return Err(InvocationError::Provider("429".to_owned())),
                Script::Stream(events) => {
                    tokio::spawn(async move {
                        for event in events {
                            if !sink.emit(event).await {
                                return;
                            }
                        }
                    });
                }
                Script::Hang => {
                    tokio::spawn(async move {
                        sink.emit(InvocationEvent::Token("Hel".to_owned())).await;
                        let _ = sink.tool_result().await;
                    });
                }
                Script::CallTool => {
                    tokio::spawn(async move {
                        let call = InvocationEvent::ToolCall {
                            correlation_id: CorrelationId("c1".to_owned()),
                            tool_name: "clock".to_owned(),
                            args: json!({}),
                        };
                        if !sink.emit(call).await {
                            return;
                        }
                        if let Some(result) = sink.tool_result().await {
                            let text = result.output["now"].as_str().unwrap_or("?").to_owned();
                            sink.emit(InvocationEvent::Token(text)).await;
                        }
                        sink.emit(InvocationEvent::Completion).await;
                    });
                }
            }
            Ok(stream)
        }
    }

    struct ClockTool;

    #[async_trait]
    impl Tool for ClockTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("clock", ToolAccess::ReadOnly, json!({ "type": "object" }))
        }

        async fn execute(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
            Ok(json!({ "now": "noon" }))
        }
    }

    fn profile(id: &str, priority: u32) -> ProfileConfig {
        ProfileConfig {
            id: id.to_owned(),
            provider: "test".to_owned(),
            credential_ref: format!("env:{id}"),
            api_key: None,
            priority,
        }
    }

    async fn runtime(invoker: Arc<ScriptedInvoker>, max_failover: u32) -> (AgentRuntime, SessionId) {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let events = StreamMultiplexer::new(64);
        let sessions = Arc::new(SessionRegistry::new(
            RegistrySettings {
                idle_timeout: Duration::from_secs(60),
                busy_policy: BusyPolicy::Queue,
                max_queued: 4,
                history_limit: 10,
            },
            events.clone(),
            clock.clone(),
        ));
        let mut tools = ToolRegistry::new();
        assert!(tools.register(ClockTool).is_ok());
        let coordinator = ToolExecutionCoordinator::attach(
            Arc::new(tools),
            sessions.clone(),
            events.clone(),
            &ToolsConfig { default_timeout_ms: 1_000 },
        );
        let profiles = Arc::new(AuthProfileFailoverManager::new(
            &[profile("p1", 1), profile("p2", 2)],
            FailoverPolicy { max_failures: 3, wait_for_cooldown: false, max_wait: Duration::ZERO },
            Arc::new(ExponentialBackoff::new(Duration::from_secs(1), 2, Duration::from_secs(60))),
            clock,
        ));
        let session = sessions.resolve(&ChannelIdentity::direct(ChannelType::Telegram, "u1")).await;
        (AgentRuntime::new(invoker, profiles, coordinator, events, max_failover), session.id)
    }

    #[tokio::test]
    async fn streams_tokens_and_reports_success() {
        let invoker = ScriptedInvoker::new(vec![Script::Stream(vec![
            InvocationEvent::Token("Hel".to_owned()),
            InvocationEvent::Token("lo".to_owned()),
            InvocationEvent::Completion,
        ])]);
        let (runtime, session) = runtime(invoker, 1).await;

        let outcome = runtime.run(&session, "hi", Vec::new(), CancellationToken::new()).await;

        assert!(outcome.as_ref().is_ok_and(|outcome| outcome.text == "Hello"
            && outcome.profile_id == ProfileId("p1".to_owned())
            && !outcome.is_partial()));
    }

    #[tokio::test]
    async fn provider_failure_before_output_fails_over_to_next_profile() {
        let invoker = ScriptedInvoker::new(vec![
            Script::Stream(vec![InvocationEvent::Error {
                message: "rate limited".to_owned(),
                provider_failure: true,
            }]),
            Script::Stream(vec![InvocationEvent::Token("ok".to_owned()), InvocationEvent::Completion]),
        ]);
        let (runtime, session) = runtime(invoker.clone(), 1).await;

        let outcome = runtime.run(&session, "hi", Vec::new(), CancellationToken::new()).await;

        assert_eq!(outcome.map(|outcome| (outcome.profile_id.0, outcome.attempts)), Ok(("p2".to_owned(), 2)));
        assert_eq!(invoker.profiles_seen(), vec!["p1", "p2"]);
        let p1 = runtime.profiles().profile(&ProfileId("p1".to_owned())).await;
        assert_eq!(p1.map(|profile| profile.status), Some(ProfileStatus::Cooling));
    }

    #[tokio::test]
    async fn exhausted_failover_surfaces_no_available_profile() {
        let invoker = ScriptedInvoker::new(vec![Script::Refuse, Script::Refuse]);
        let (runtime, session) = runtime(invoker, 1).await;

        let outcome = runtime.run(&session, "hi", Vec::new(), CancellationToken::new()).await;

        assert_eq!(outcome, Err(GatewayError::NoAvailableProfile));
    }

    #[tokio::test]
    async fn error_after_output_is_not_retried() {
        let invoker = ScriptedInvoker::new(vec![Script::Stream(vec![
            InvocationEvent::Token("Hel".to_owned()),
            InvocationEvent::Error { message: "upstream reset".to_owned(), provider_failure: true },
        ])]);
        let (runtime, session) = runtime(invoker.clone(), 2).await;

        let outcome = runtime.run(&session, "hi", Vec::new(), CancellationToken::new()).await;

        assert!(outcome.is_ok_and(|outcome| outcome.text == "Hel" && outcome.is_partial()));
        assert_eq!(invoker.profiles_seen(), vec!["p1"]);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_into_the_stream() {
        let invoker = ScriptedInvoker::new(vec![Script::CallTool]);
        let (runtime, session) = runtime(invoker, 0).await;

        let outcome = runtime.run(&session, "what time is it", Vec::new(), CancellationToken::new()).await;

        assert!(outcome.is_ok_and(|outcome| outcome.text == "noon"
            && outcome.tool_results.len() == 1
            && outcome.tool_results[0].correlation_id == CorrelationId("c1".to_owned())));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_output() {
        let invoker = ScriptedInvoker::new(vec![Script::Hang]);
        let (runtime, session) = runtime(invoker, 0).await;
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        let outcome = runtime.run(&session, "hi", Vec::new(), cancel).await;

        assert!(matches!(
            outcome,
            Err(GatewayError::InvocationAborted { ref partial_output, .. }) if partial_output == "Hel"
        ));
    }
}
