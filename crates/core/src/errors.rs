use thiserror::Error;

use crate::domain::channel::ChannelType;
use crate::domain::session::SessionId;
use crate::domain::tool::CorrelationId;

/// Control-plane failures. None of these is fatal to the process; each is
/// scoped to one session, one send or one tool call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("transient failure on channel {channel} after {attempts} attempt(s): {message}")]
    TransientChannel { channel: ChannelType, message: String, attempts: u32 },
    #[error("no auth profile is available")]
    NoAvailableProfile,
    #[error("tool `{tool_name}` ({correlation_id}) timed out after {timeout_ms}ms")]
    ToolTimeout { correlation_id: CorrelationId, tool_name: String, timeout_ms: u64 },
    #[error("tool call `{tool_name}` ({correlation_id}) rejected: {reason}")]
    ToolSchemaViolation { correlation_id: CorrelationId, tool_name: String, reason: String },
    #[error("correlation id {correlation_id} was already used in session {session_id}")]
    DuplicateToolCall { session_id: SessionId, correlation_id: CorrelationId },
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {session_id} already has an invocation in flight")]
    SessionBusy { session_id: SessionId },
    #[error("invocation for session {session_id} was aborted")]
    InvocationAborted { session_id: SessionId, partial_output: String },
    #[error("channel {channel} is saturated ({queued} send(s) queued)")]
    ChannelBackpressure { channel: ChannelType, queued: usize },
    #[error("no adapter is registered for channel {0}")]
    UnknownChannel(ChannelType),
}

impl GatewayError {
    /// Notice that may be shown in the conversation. `None` means the error
    /// is handled silently or is not conversation-facing.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::TransientChannel { .. } => {
                Some("A reply could not be delivered. Please resend your message.")
            }
            Self::NoAvailableProfile => {
                Some("The assistant is temporarily unavailable. Please try again shortly.")
            }
            Self::SessionBusy { .. } => {
                Some("Still working on your previous message. Please wait for the reply.")
            }
            Self::InvocationAborted { .. } => Some("The response was stopped before it finished."),
            Self::ToolTimeout { .. }
            | Self::ToolSchemaViolation { .. }
            | Self::DuplicateToolCall { .. }
            | Self::SessionNotFound(_)
            | Self::ChannelBackpressure { .. }
            | Self::UnknownChannel(_) => None,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::TransientChannel { .. } => "transient_channel",
            Self::NoAvailableProfile => "no_available_profile",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::ToolSchemaViolation { .. } => "tool_schema_violation",
            Self::DuplicateToolCall { .. } => "duplicate_tool_call",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionBusy { .. } => "session_busy",
            Self::InvocationAborted { .. } => "invocation_aborted",
            Self::ChannelBackpressure { .. } => "channel_backpressure",
            Self::UnknownChannel(_) => "unknown_channel",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientChannel { .. } | Self::ChannelBackpressure { .. })
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::channel::ChannelType;
    use crate::domain::session::SessionId;
    use crate::domain::tool::CorrelationId;
    use crate::errors::GatewayError;

    #[test]
    fn no_available_profile_has_user_safe_message() {
        assert_eq!(
            GatewayError::NoAvailableProfile.user_message(),
            Some("The assistant is temporarily unavailable. Please try again shortly.")
        );
        assert_eq!(GatewayError::NoAvailableProfile.error_class(), "no_available_profile");
    }

    #[test]
    fn schema_violation_is_not_conversation_facing() {
        let error = GatewayError::ToolSchemaViolation {
            correlation_id: CorrelationId("call-9".to_owned()),
            tool_name: "shell".to_owned(),
            reason: "unknown tool".to_owned(),
        };

        assert_eq!(error.user_message(), None);
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("call-9"));
    }

    #[test]
    fn backpressure_is_retryable_and_names_the_channel() {
        let error = GatewayError::ChannelBackpressure { channel: ChannelType::Discord, queued: 4 };

        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "channel discord is saturated (4 send(s) queued)");
    }

    #[test]
    fn aborted_invocation_keeps_partial_output_out_of_display() {
        let error = GatewayError::InvocationAborted {
            session_id: SessionId("ses-1".to_owned()),
            partial_output: "Hel".to_owned(),
        };

        assert_eq!(error.to_string(), "invocation for session ses-1 was aborted");
        assert_eq!(error.error_class(), "invocation_aborted");
    }
}
