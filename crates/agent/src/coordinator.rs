use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use switchboard_core::config::ToolsConfig;
use switchboard_core::domain::session::SessionId;
use switchboard_core::domain::tool::{
    CorrelationId, ToolAccess, ToolCallRequest, ToolCallStatus, ToolInvocationRecord,
};
use switchboard_core::errors::GatewayError;
use switchboard_core::multiplexer::{EventType, StreamMultiplexer};
use switchboard_core::session::{SessionExpiryListener, SessionRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tools::{RegisteredTool, ToolError, ToolRegistry};

/// How long an abandoned tool task may run after its token is cancelled.
const ABANDON_GRACE: Duration = Duration::from_secs(1);

/// The single result an invocation receives for one correlation id.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub correlation_id: CorrelationId,
    pub tool_name: String,
    pub status: ToolCallStatus,
    /// Tool output for `Done`; a synthetic `{"error": ...}` object otherwise.
    pub output: Value,
}

impl ToolResult {
    fn synthetic(
        correlation_id: CorrelationId,
        tool_name: String,
        status: ToolCallStatus,
        message: String,
    ) -> Self {
        Self { correlation_id, tool_name, status, output: json!({ "error": message }) }
    }

    pub fn is_error(&self) -> bool {
        self.status != ToolCallStatus::Done
    }
}

/// Releases results strictly in submission order, each sequence number once.
#[derive(Debug, Default)]
pub struct ResultSequencer {
    next: u64,
    ready: BTreeMap<u64, ToolResult>,
}

impl ResultSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` for a sequence number already released or buffered.
    pub fn insert(&mut self, sequence: u64, result: ToolResult) -> bool {
        if sequence < self.next || self.ready.contains_key(&sequence) {
            return false;
        }
        self.ready.insert(sequence, result);
        true
    }

    pub fn pop_ready(&mut self) -> Option<ToolResult> {
        let result = self.ready.remove(&self.next)?;
        self.next += 1;
        Some(result)
    }

    pub fn released(&self) -> u64 {
        self.next
    }
}

struct PreparedCall {
    session_id: SessionId,
    request: ToolCallRequest,
    sequence: u64,
    registered: Arc<RegisteredTool>,
    timeout: Duration,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<(u64, ToolResult)>,
}

#[derive(Default)]
struct SessionTools {
    records: HashMap<CorrelationId, ToolInvocationRecord>,
    mutating_lane: Option<mpsc::UnboundedSender<PreparedCall>>,
}

/// Validates, schedules and sequences tool calls issued during an invocation.
/// Mutating calls run one at a time per session in submission order; read-only
/// calls run immediately and concurrently.
pub struct ToolExecutionCoordinator {
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionRegistry>,
    events: StreamMultiplexer,
    default_timeout: Duration,
    table: Mutex<HashMap<SessionId, SessionTools>>,
}

impl ToolExecutionCoordinator {
    pub fn new(
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionRegistry>,
        events: StreamMultiplexer,
        config: &ToolsConfig,
    ) -> Self {
        Self {
            tools,
            sessions,
            events,
            default_timeout: config.default_timeout(),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the coordinator and subscribes it to session expiry.
    pub fn attach(
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionRegistry>,
        events: StreamMultiplexer,
        config: &ToolsConfig,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self::new(tools, sessions.clone(), events, config));
        let listener: Arc<dyn SessionExpiryListener> = coordinator.clone();
        sessions.register_expiry_listener(Arc::downgrade(&listener));
        coordinator
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Starts a batch bound to one invocation; `cancel` is the invocation token.
    pub fn open_batch(self: &Arc<Self>, session_id: &SessionId, cancel: CancellationToken) -> ToolBatch {
        let (results, receiver) = mpsc::unbounded_channel();
        ToolBatch {
            coordinator: self.clone(),
            session_id: session_id.clone(),
            cancel,
            results,
            receiver,
            sequencer: ResultSequencer::new(),
            submitted: Vec::new(),
        }
    }

    pub fn records(&self, session_id: &SessionId) -> Vec<ToolInvocationRecord> {
        let table = self.lock_table();
        let mut records: Vec<ToolInvocationRecord> = table
            .get(session_id)
            .map(|tools| tools.records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|left, right| left.correlation_id.cmp(&right.correlation_id));
        records
    }

    pub fn record(&self, session_id: &SessionId, correlation_id: &CorrelationId) -> Option<ToolInvocationRecord> {
        self.lock_table()
            .get(session_id)
            .and_then(|tools| tools.records.get(correlation_id).cloned())
    }

    async fn submit(
        self: &Arc<Self>,
        request: ToolCallRequest,
        sequence: u64,
        cancel: CancellationToken,
        results: mpsc::UnboundedSender<(u64, ToolResult)>,
    ) -> Result<(), GatewayError> {
        let session_id = request.session_id.clone();
        let registered = match self.tools.admit(&request) {
            Ok(registered) => registered,
            Err(error) => {
                tracing::warn!(
                    event_name = "tool.call.rejected",
                    session_id = %session_id,
                    correlation_id = %request.correlation_id,
                    tool_name = %request.tool_name,
                    error = %error,
                    "tool call rejected before execution"
                );
                return Err(error);
            }
        };

        self.sessions.add_pending_tool_call(&session_id, &request.correlation_id).await?;
        {
            let mut table = self.lock_table();
            let tools = table.entry(session_id.clone()).or_default();
            tools.records.insert(request.correlation_id.clone(), ToolInvocationRecord::pending(&request));
        }

        let access = registered.descriptor.access;
        self.events.emit(
            EventType::ToolInvoked,
            &session_id,
            json!({
                "correlationId": request.correlation_id,
                "toolName": request.tool_name,
                "access": access,
            }),
        );
        tracing::info!(
            event_name = "tool.call.invoked",
            session_id = %session_id,
            correlation_id = %request.correlation_id,
            tool_name = %request.tool_name,
            access = ?access,
            "tool call accepted"
        );

        let timeout = registered.descriptor.timeout.unwrap_or(self.default_timeout);
        let call = PreparedCall {
            session_id,
            request,
            sequence,
            registered,
            timeout,
            cancel: cancel.child_token(),
            results,
        };

        match access {
            ToolAccess::ReadOnly => {
                let coordinator = self.clone();
                tokio::spawn(async move { coordinator.run(call).await });
            }
            ToolAccess::Mutating => self.enqueue_mutating(call),
        }
        Ok(())
    }

    fn enqueue_mutating(self: &Arc<Self>, call: PreparedCall) {
        let mut table = self.lock_table();
        let tools = table.entry(call.session_id.clone()).or_default();
        let lane = match &tools.mutating_lane {
            Some(lane) if !lane.is_closed() => lane.clone(),
            _ => {
                let (sender, mut receiver) = mpsc::unbounded_channel::<PreparedCall>();
                let coordinator = self.clone();
                tokio::spawn(async move {
                    while let Some(call) = receiver.recv().await {
                        coordinator.run(call).await;
                    }
                });
                tools.mutating_lane = Some(sender.clone());
                sender
            }
        };
        if let Err(mpsc::error::SendError(call)) = lane.send(call) {
            drop(table);
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run(call).await });
        }
    }

    async fn run(&self, call: PreparedCall) {
        let PreparedCall { session_id, request, sequence, registered, timeout, cancel, results } = call;
        let correlation_id = request.correlation_id.clone();
        let tool_name = request.tool_name.clone();

        let started = !cancel.is_cancelled()
            && self.update_record(&session_id, &correlation_id, ToolCallStatus::Running, None);

        let result = if !started {
            ToolResult::synthetic(
                correlation_id.clone(),
                tool_name.clone(),
                ToolCallStatus::Cancelled,
                format!("tool '{tool_name}' cancelled before execution"),
            )
        } else {
            // Own task, so a panicking tool yields a result instead of taking
            // down the caller or the mutating lane.
            let tool = registered.tool.clone();
            let tool_cancel = cancel.clone();
            let mut execution =
                tokio::spawn(async move { tool.execute(request.args, tool_cancel).await });
            let result = tokio::select! {
                _ = cancel.cancelled() => ToolResult::synthetic(
                    correlation_id.clone(),
                    tool_name.clone(),
                    ToolCallStatus::Cancelled,
                    format!("tool '{tool_name}' cancelled"),
                ),
                outcome = tokio::time::timeout(timeout, &mut execution) => match outcome {
                    Ok(Ok(Ok(output))) => ToolResult {
                        correlation_id: correlation_id.clone(),
                        tool_name: tool_name.clone(),
                        status: ToolCallStatus::Done,
                        output,
                    },
                    Ok(Ok(Err(ToolError::Failed(message)))) => ToolResult::synthetic(
                        correlation_id.clone(),
                        tool_name.clone(),
                        ToolCallStatus::Failed,
                        message,
                    ),
                    Ok(Ok(Err(ToolError::Cancelled))) => ToolResult::synthetic(
                        correlation_id.clone(),
                        tool_name.clone(),
                        ToolCallStatus::Cancelled,
                        format!("tool '{tool_name}' cancelled"),
                    ),
                    Ok(Err(join_error)) => {
                        tracing::error!(
                            event_name = "tool.call.panicked",
                            session_id = %session_id,
                            correlation_id = %correlation_id,
                            tool_name = %tool_name,
                            error = %join_error,
                            "tool call panicked"
                        );
                        ToolResult::synthetic(
                            correlation_id.clone(),
                            tool_name.clone(),
                            ToolCallStatus::Failed,
                            format!("tool '{tool_name}' panicked"),
                        )
                    }
                    Err(_) => {
                        let error = GatewayError::ToolTimeout {
                            correlation_id: correlation_id.clone(),
                            tool_name: tool_name.clone(),
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        };
                        tracing::warn!(
                            event_name = "tool.call.timed_out",
                            session_id = %session_id,
                            correlation_id = %correlation_id,
                            tool_name = %tool_name,
                            "tool call timed out"
                        );
                        ToolResult::synthetic(
                            correlation_id.clone(),
                            tool_name.clone(),
                            ToolCallStatus::TimedOut,
                            error.to_string(),
                        )
                    }
                },
            };
            if !execution.is_finished() {
                cancel.cancel();
                tokio::spawn(async move {
                    if tokio::time::timeout(ABANDON_GRACE, &mut execution).await.is_err() {
                        execution.abort();
                    }
                });
            }
            result
        };

        let result = self.finish(&session_id, result).await;
        if results.send((sequence, result)).is_err() {
            self.discard(&session_id, &correlation_id);
        }
    }

    /// Applies the final status. A record already cancelled by expiry keeps
    /// `Cancelled`, and the delivered result says so.
    async fn finish(&self, session_id: &SessionId, mut result: ToolResult) -> ToolResult {
        let applied = self.update_record(
            session_id,
            &result.correlation_id,
            result.status,
            Some(result.output.clone()),
        );
        if !applied {
            if let Some(record) = self.record(session_id, &result.correlation_id) {
                if record.status.is_terminal() && record.status != result.status {
                    result = ToolResult::synthetic(
                        result.correlation_id,
                        result.tool_name,
                        record.status,
                        format!("tool call {}", record.status.as_str()),
                    );
                }
            } else {
                result = ToolResult::synthetic(
                    result.correlation_id,
                    result.tool_name,
                    ToolCallStatus::Cancelled,
                    "session expired".to_owned(),
                );
            }
        }

        self.sessions.remove_pending_tool_call(session_id, &result.correlation_id).await;
        self.events.emit(
            EventType::ToolCompleted,
            session_id,
            json!({
                "correlationId": result.correlation_id,
                "toolName": result.tool_name,
                "status": result.status,
            }),
        );
        tracing::info!(
            event_name = "tool.call.completed",
            session_id = %session_id,
            correlation_id = %result.correlation_id,
            tool_name = %result.tool_name,
            status = result.status.as_str(),
            "tool call finished"
        );
        result
    }

    fn update_record(
        &self,
        session_id: &SessionId,
        correlation_id: &CorrelationId,
        status: ToolCallStatus,
        output: Option<Value>,
    ) -> bool {
        let mut table = self.lock_table();
        let Some(record) = table
            .get_mut(session_id)
            .and_then(|tools| tools.records.get_mut(correlation_id))
        else {
            return false;
        };
        if !record.transition_to(status) {
            return false;
        }
        if output.is_some() {
            record.result = output;
        }
        true
    }

    fn discard(&self, session_id: &SessionId, correlation_id: &CorrelationId) {
        if let Some(tools) = self.lock_table().get_mut(session_id) {
            tools.records.remove(correlation_id);
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<SessionId, SessionTools>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionExpiryListener for ToolExecutionCoordinator {
    async fn session_expired(&self, session_id: &SessionId, pending: &[CorrelationId]) {
        let Some(mut tools) = self.lock_table().remove(session_id) else {
            return;
        };
        let mut cancelled = 0_usize;
        for record in tools.records.values_mut() {
            if record.transition_to(ToolCallStatus::Cancelled) {
                record.result = Some(json!({ "error": "session expired" }));
                cancelled += 1;
            }
        }
        tools.mutating_lane.take();
        tracing::info!(
            event_name = "tool.session.cancelled",
            session_id = %session_id,
            cancelled,
            pending = pending.len(),
            "pending tool calls cancelled on session expiry"
        );
    }
}

/// Tool calls of one invocation. Results come back through `next_result` in
/// the order the calls were submitted.
pub struct ToolBatch {
    coordinator: Arc<ToolExecutionCoordinator>,
    session_id: SessionId,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<(u64, ToolResult)>,
    receiver: mpsc::UnboundedReceiver<(u64, ToolResult)>,
    sequencer: ResultSequencer,
    submitted: Vec<CorrelationId>,
}

impl ToolBatch {
    /// Schedules the call. A rejected call still occupies its slot in the
    /// result order with a synthetic `Failed` result, and the rejection is
    /// returned. A repeated correlation id is refused without a slot.
    pub async fn submit(
        &mut self,
        tool_name: impl Into<String>,
        correlation_id: CorrelationId,
        args: Value,
    ) -> Result<(), GatewayError> {
        if self.submitted.contains(&correlation_id) {
            return Err(GatewayError::DuplicateToolCall {
                session_id: self.session_id.clone(),
                correlation_id,
            });
        }
        let request = ToolCallRequest {
            session_id: self.session_id.clone(),
            correlation_id: correlation_id.clone(),
            tool_name: tool_name.into(),
            args,
        };
        let tool_name = request.tool_name.clone();
        let sequence = self.submitted.len() as u64;

        match self
            .coordinator
            .submit(request, sequence, self.cancel.clone(), self.results.clone())
            .await
        {
            Ok(()) => {
                self.submitted.push(correlation_id);
                Ok(())
            }
            Err(error @ GatewayError::ToolSchemaViolation { .. }) => {
                self.submitted.push(correlation_id.clone());
                self.sequencer.insert(
                    sequence,
                    ToolResult::synthetic(correlation_id, tool_name, ToolCallStatus::Failed, error.to_string()),
                );
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Next result in submission order; `None` once every submitted call has
    /// been delivered.
    pub async fn next_result(&mut self) -> Option<ToolResult> {
        loop {
            if let Some(result) = self.sequencer.pop_ready() {
                self.coordinator.discard(&self.session_id, &result.correlation_id);
                return Some(result);
            }
            if self.sequencer.released() >= self.submitted.len() as u64 {
                return None;
            }
            let (sequence, result) = self.receiver.recv().await?;
            self.sequencer.insert(sequence, result);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.submitted.len().saturating_sub(self.sequencer.released() as usize)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for ToolBatch {
    fn drop(&mut self) {
        let mut table = self.coordinator.lock_table();
        if let Some(tools) = table.get_mut(&self.session_id) {
            for correlation_id in &self.submitted {
                if tools.records.get(correlation_id).is_some_and(|record| record.status.is_terminal()) {
                    tools.records.remove(correlation_id);
                }
            }
        }
    }
}
