use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::session::SessionId;

/// Identifier the agent attaches to a tool call; unique within a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::TimedOut | Self::Cancelled)
    }

    /// Terminal states never move again; `Cancelled` wins over a late completion.
    pub fn can_transition_to(&self, next: ToolCallStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            Self::Done | Self::Failed | Self::TimedOut | Self::Cancelled => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccess {
    ReadOnly,
    Mutating,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub session_id: SessionId,
    pub correlation_id: CorrelationId,
    pub tool_name: String,
    pub args: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub correlation_id: CorrelationId,
    pub tool_name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    /// Result payload once terminal; synthetic error objects for timeouts and cancellations.
    pub result: Option<Value>,
}

impl ToolInvocationRecord {
    pub fn pending(request: &ToolCallRequest) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            tool_name: request.tool_name.clone(),
            args: request.args.clone(),
            status: ToolCallStatus::Pending,
            result: None,
        }
    }

    /// Applies `next` if legal and reports whether the record changed.
    pub fn transition_to(&mut self, next: ToolCallStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CorrelationId, ToolCallRequest, ToolCallStatus, ToolInvocationRecord};
    use crate::domain::session::SessionId;

    fn record() -> ToolInvocationRecord {
        ToolInvocationRecord::pending(&ToolCallRequest {
            session_id: SessionId("ses-1".to_owned()),
            correlation_id: CorrelationId("call-1".to_owned()),
            tool_name: "lookup".to_owned(),
            args: json!({"q": "weather"}),
        })
    }

    #[test]
    fn allows_pending_running_done_lifecycle() {
        let mut record = record();
        assert!(record.transition_to(ToolCallStatus::Running));
        assert!(record.transition_to(ToolCallStatus::Done));
        assert_eq!(record.status, ToolCallStatus::Done);
    }

    #[test]
    fn cancelled_record_never_becomes_done() {
        let mut record = record();
        assert!(record.transition_to(ToolCallStatus::Running));
        assert!(record.transition_to(ToolCallStatus::Cancelled));
        assert!(!record.transition_to(ToolCallStatus::Done));
        assert_eq!(record.status, ToolCallStatus::Cancelled);
    }

    #[test]
    fn running_cannot_return_to_pending() {
        let mut record = record();
        assert!(record.transition_to(ToolCallStatus::Running));
        assert!(!record.transition_to(ToolCallStatus::Pending));
    }
}
