use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::{validator_for, Validator};
use serde_json::Value;
use switchboard_core::domain::tool::{ToolAccess, ToolCallRequest};
use switchboard_core::errors::GatewayError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub access: ToolAccess,
    /// JSON schema the call arguments must satisfy.
    pub parameters: Value,
    /// Overrides the coordinator's default timeout.
    pub timeout: Option<Duration>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, access: ToolAccess, parameters: Value) -> Self {
        Self { name: name.into(), access, parameters, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool failed: {0}")]
    Failed(String),
    #[error("tool observed cancellation")]
    Cancelled,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Long-running tools should watch `cancel` and return early.
    async fn execute(&self, args: Value, cancel: CancellationToken) -> Result<Value, ToolError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("tool name must not be empty")]
    EmptyName,
    #[error("tool '{tool}' has an invalid parameter schema: {reason}")]
    InvalidSchema { tool: String, reason: String },
}

pub(crate) struct RegisteredTool {
    pub(crate) descriptor: ToolDescriptor,
    pub(crate) tool: Arc<dyn Tool>,
    validator: Validator,
}

/// Named tools with their argument validators compiled at registration time.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T) -> Result<(), RegistrationError>
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistrationError> {
        let descriptor = tool.descriptor();
        if descriptor.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let validator = validator_for(&descriptor.parameters).map_err(|error| {
            RegistrationError::InvalidSchema {
                tool: descriptor.name.clone(),
                reason: error.to_string(),
            }
        })?;
        tracing::debug!(
            event_name = "tool.registry.registered",
            tool_name = %descriptor.name,
            access = ?descriptor.access,
            "tool registered"
        );
        self.tools.insert(
            descriptor.name.clone(),
            Arc::new(RegisteredTool { descriptor, tool, validator }),
        );
        Ok(())
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|registered| &registered.descriptor)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolves the tool and checks the arguments against its schema.
    pub(crate) fn admit(&self, request: &ToolCallRequest) -> Result<Arc<RegisteredTool>, GatewayError> {
        let violation = |reason: String| GatewayError::ToolSchemaViolation {
            correlation_id: request.correlation_id.clone(),
            tool_name: request.tool_name.clone(),
            reason,
        };

        let registered = self
            .tools
            .get(&request.tool_name)
            .cloned()
            .ok_or_else(|| violation(format!("tool '{}' is not registered", request.tool_name)))?;

        let first_error = registered
            .validator
            .iter_errors(&request.args)
            .next()
            .map(|error| error.to_string());
        match first_error {
            Some(reason) => Err(violation(format!("invalid arguments: {reason}"))),
            None => Ok(registered),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use switchboard_core::domain::session::SessionId;
    use switchboard_core::domain::tool::{CorrelationId, ToolAccess, ToolCallRequest};
    use switchboard_core::errors::GatewayError;
    use tokio_util::sync::CancellationToken;

    use super::{RegistrationError, Tool, ToolDescriptor, ToolError, ToolRegistry};

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "lookup",
                ToolAccess::ReadOnly,
                json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
            )
        }

        async fn execute(&self, args: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
            Ok(json!({ "echo": args["query"] }))
        }
    }

    struct BrokenSchema;

    #[async_trait]
    impl Tool for BrokenSchema {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("broken", ToolAccess::Mutating, json!({ "type": 12 }))
        }

        async fn execute(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn request(tool_name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            session_id: SessionId("ses-1".to_owned()),
            correlation_id: CorrelationId("call-1".to_owned()),
            tool_name: tool_name.to_owned(),
            args,
        }
    }

    #[test]
    fn admits_calls_matching_the_schema() {
        let mut registry = ToolRegistry::new();
        assert_eq!(registry.register(Lookup), Ok(()));

        assert!(registry.admit(&request("lookup", json!({ "query": "weather" }))).is_ok());
        assert_eq!(registry.names(), vec!["lookup".to_owned()]);
    }

    #[test]
    fn rejects_unknown_tools_and_invalid_arguments() {
        let mut registry = ToolRegistry::new();
        assert_eq!(registry.register(Lookup), Ok(()));

        assert!(matches!(
            registry.admit(&request("missing", json!({}))),
            Err(GatewayError::ToolSchemaViolation { .. })
        ));
        assert!(matches!(
            registry.admit(&request("lookup", json!({ "query": 7 }))),
            Err(GatewayError::ToolSchemaViolation { ref tool_name, .. }) if tool_name == "lookup"
        ));

        let reason = match registry.admit(&request("lookup", json!({}))) {
            Err(GatewayError::ToolSchemaViolation { reason, .. }) => reason,
            _ => String::new(),
        };
        assert!(reason.starts_with("invalid arguments:"), "unexpected reason: {reason}");
        assert!(reason.contains("query"));
    }

    #[test]
    fn refuses_tools_with_invalid_schemas() {
        let mut registry = ToolRegistry::new();

        assert!(matches!(
            registry.register(BrokenSchema),
            Err(RegistrationError::InvalidSchema { ref tool, .. }) if tool == "broken"
        ));
        assert!(registry.is_empty());
    }
}
