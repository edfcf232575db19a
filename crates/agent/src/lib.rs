//! Agent side of the gateway.
//!
//! - `tools`: the tool contract and a registry that validates call arguments
//!   against each tool's JSON schema.
//! - `coordinator`: schedules tool calls issued mid-response and hands their
//!   results back in request order.
//! - `invocation`: the model-invocation contract and its bounded token stream.
//! - `runtime`: runs one invocation end to end, failing over between auth
//!   profiles when the provider refuses before any output.

pub mod coordinator;
pub mod invocation;
pub mod runtime;
pub mod tools;

pub use coordinator::{ResultSequencer, ToolBatch, ToolExecutionCoordinator, ToolResult};
pub use invocation::{
    token_stream, AgentInvoker, EchoInvoker, InvocationError, InvocationEvent, InvocationRequest,
    TokenSink, TokenStream,
};
pub use runtime::{AgentRuntime, InvocationOutcome};
pub use tools::{RegistrationError, Tool, ToolDescriptor, ToolError, ToolRegistry};
