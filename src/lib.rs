//! Vendor-neutral workflow primitives. Workflow code is written against the traits in [model]
//! and runs on any durable-execution runtime that implements [host::HostRuntime]. The adapters
//! in [adapter] and the [engine::HostWorkflowEngine] facade bridge the two, and [local] provides
//! a deterministic in-process host for running and testing workflows.

pub mod adapter;
pub mod engine;
pub mod errors;
pub mod host;
pub mod local;
pub mod model;
pub mod payload;
pub(crate) mod retry_logic;
pub mod telemetry;

pub use engine::HostWorkflowEngine;
pub use errors::{ConversionError, HostError, TimeoutKind, WorkflowError};
pub use model::{
    ActivityDefinition, ActivityOptions, ActivityOptionsBuilder, ActivityRef, CancelHandle,
    Channel, ChildWfFuture, ChildWorkflowOptions, ChildWorkflowOptionsBuilder, Context,
    NamedChannel, NamedWorkflow, ReceiveChannel, RetryPolicy, RetryPolicyBuilder, SendChannel,
    WfFuture, WorkflowDescriptor, WorkflowEngine, WorkflowExecution, WorkflowInfo,
};
pub use payload::{AsJsonPayloadExt, FromJsonPayloadExt, Payload};
pub use telemetry::{telemetry_init, KeyValLogger, TelemetryOptions, TelemetryOptionsBuilder};
