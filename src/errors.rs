use crate::payload::PayloadError;

/// Malformed or contradictory input found while translating options, policies, descriptors or
/// values across the workflow/host boundary
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, displaydoc::Display)]
pub enum ConversionError {
    /// Invalid retry policy: {0}
    InvalidRetryPolicy(String),
    /// Invalid child workflow options: {0}
    InvalidChildWorkflowOptions(String),
    /// Workflow descriptor has an empty name
    EmptyWorkflowName,
    /// Workflow descriptor ({0}) generated an empty workflow id
    EmptyWorkflowId(String),
    /// Failed to encode value: {0}
    Encode(#[from] PayloadError),
}

/// Errors reported by a host runtime. Resolved futures hold one of these, so it must be cheap
/// to clone and return on every `get`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, displaydoc::Display)]
pub enum HostError {
    /// canceled
    Canceled,
    /// deadline exceeded
    DeadlineExceeded,
    /// Activity {activity_type} failed: {message}
    ActivityFailed {
        activity_type: String,
        message: String,
        /// Error type used to match against non-retryable error types
        error_type: Option<String>,
        non_retryable: bool,
    },
    /// Activity {activity_type} timed out ({kind})
    ActivityTimeout {
        activity_type: String,
        kind: TimeoutKind,
    },
    /// Invalid activity options: {0}
    InvalidActivityOptions(String),
    /// Workflow type {0} is not registered
    WorkflowNotRegistered(String),
    /// Workflow execution already started: {workflow_id}
    WorkflowAlreadyStarted { workflow_id: String },
    /// Workflow execution already completed: {workflow_id}
    WorkflowCompleted { workflow_id: String },
    /// Workflow execution timed out: {workflow_id}
    WorkflowTimedOut { workflow_id: String },
    /// Workflow failed: {0}
    WorkflowFailed(String),
    /// Child workflow {workflow_id} failed: {message}
    ChildWorkflowFailed {
        workflow_id: String,
        message: String,
    },
    /// Query handler registration rejected: {0}
    QueryRejected(String),
    /// Unknown query type {query_type}, known types: {known}
    UnknownQuery { query_type: String, known: String },
    /// Query failed: {0}
    QueryFailed(String),
    /// Channel {0} is closed
    ChannelClosed(String),
    /// Failed to decode payload: {0}
    Decode(String),
    /// Failed to encode payload: {0}
    Encode(String),
    /// Workflow is blocked with nothing left to run: {0}
    Deadlock(String),
}

impl HostError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, HostError::Canceled)
    }
}

impl From<PayloadError> for HostError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::Serialize(m) => HostError::Encode(m),
            other => HostError::Decode(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TimeoutKind {
    #[display(fmt = "start to close")]
    StartToClose,
    #[display(fmt = "schedule to close")]
    ScheduleToClose,
}

/// Errors surfaced to workflow code by the abstract primitives and the engine facade
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    /// A host operation failed. `op` names the facade or adapter call that failed.
    #[error("{op}: {source}")]
    Runtime {
        op: &'static str,
        #[source]
        source: HostError,
    },
    /// A context from one workflow execution was handed to a primitive owned by another
    #[error("invalid context: handle belongs to execution {expected} but got a context of {actual}")]
    InvalidContext { expected: String, actual: String },
    #[error("{op}: canceled")]
    Cancelled { op: &'static str },
    /// Application error raised by workflow code
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Wrap a host error with the name of the failing operation. Cancellation is kept apart from
    /// every other failure.
    pub fn from_host(op: &'static str, source: HostError) -> Self {
        match source {
            HostError::Canceled => WorkflowError::Cancelled { op },
            source => WorkflowError::Runtime { op, source },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled { .. })
    }

    /// The host error underneath, if this error came from the host
    pub fn host_error(&self) -> Option<&HostError> {
        match self {
            WorkflowError::Runtime { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Encoding failures are conversion errors. Decoding failures read like a failed host decode.
impl From<PayloadError> for WorkflowError {
    fn from(e: PayloadError) -> Self {
        match e {
            e @ PayloadError::Serialize(_) => WorkflowError::Conversion(e.into()),
            e => WorkflowError::from_host("decode", e.into()),
        }
    }
}
