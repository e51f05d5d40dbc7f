use crate::{
    model::WorkflowExecution,
    payload::{FromJsonPayloadExt, Payload},
};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Information about the running activity attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityInfo {
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    /// Starts at 1
    pub attempt: u32,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: String,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
}

/// Handed to every activity invocation
#[derive(Clone)]
pub struct ActivityContext {
    info: ActivityInfo,
    cancellation_token: CancellationToken,
}

impl ActivityContext {
    pub(crate) fn new(info: ActivityInfo, cancellation_token: CancellationToken) -> Self {
        Self {
            info,
            cancellation_token,
        }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    /// Canceled when the scheduling workflow context is canceled
    pub fn cancelled(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// Returned as errors from activity functions
#[derive(Debug)]
pub enum ActivityError {
    /// The host may retry the activity according to its retry policy. `error_type` is matched
    /// against the policy's non-retryable error types, falling back to the message. It's also
    /// the error that arbitrary errors are converted into.
    Retryable {
        source: anyhow::Error,
        error_type: Option<String>,
    },
    NonRetryable(anyhow::Error),
    /// The activity gave up because it observed cancellation
    Cancelled,
}

impl ActivityError {
    pub fn retryable_with_type(
        source: impl Into<anyhow::Error>,
        error_type: impl Into<String>,
    ) -> Self {
        ActivityError::Retryable {
            source: source.into(),
            error_type: Some(error_type.into()),
        }
    }

    pub fn non_retryable(source: impl Into<anyhow::Error>) -> Self {
        ActivityError::NonRetryable(source.into())
    }
}

impl<E> From<E> for ActivityError
where
    E: Into<anyhow::Error>,
{
    fn from(source: E) -> Self {
        ActivityError::Retryable {
            source: source.into(),
            error_type: None,
        }
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityError::Retryable { source, .. } => write!(f, "{:#}", source),
            ActivityError::NonRetryable(source) => write!(f, "{:#}", source),
            ActivityError::Cancelled => f.write_str("activity cancelled"),
        }
    }
}

/// Decode argument `index` of an activity invocation. Missing or malformed arguments are not
/// retryable.
pub fn arg<T: DeserializeOwned>(args: &[Payload], index: usize) -> Result<T, ActivityError> {
    let payload = args.get(index).ok_or_else(|| {
        ActivityError::NonRetryable(anyhow::anyhow!("missing activity argument {}", index))
    })?;
    T::from_json_payload(payload).map_err(|e| ActivityError::NonRetryable(e.into()))
}

type BoxActFn =
    Arc<dyn Fn(ActivityContext, Vec<Payload>) -> BoxFuture<'static, Result<Payload, ActivityError>> + Send + Sync>;

/// An activity implementation registered with a [super::LocalHost]
#[derive(Clone)]
pub struct ActivityFunction {
    act_func: BoxActFn,
}

impl ActivityFunction {
    pub fn new<F, Fut, O>(f: F) -> Self
    where
        F: Fn(ActivityContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
        O: Serialize + 'static,
    {
        use crate::payload::AsJsonPayloadExt;
        use futures::FutureExt;

        Self {
            act_func: Arc::new(move |ctx: ActivityContext, args: Vec<Payload>| {
                f(ctx, args)
                    .map(|res| {
                        res.and_then(|o| {
                            o.as_json_payload()
                                .map_err(|e| ActivityError::NonRetryable(e.into()))
                        })
                    })
                    .boxed()
            }),
        }
    }

    pub(crate) fn call(
        &self,
        ctx: ActivityContext,
        args: Vec<Payload>,
    ) -> BoxFuture<'static, Result<Payload, ActivityError>> {
        (self.act_func)(ctx, args)
    }
}

impl<F, Fut, O> From<F> for ActivityFunction
where
    F: Fn(ActivityContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    O: Serialize + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl fmt::Debug for ActivityFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActivityFunction")
    }
}
