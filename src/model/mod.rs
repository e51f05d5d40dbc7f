//! Vendor-neutral primitives that workflow code is written against. Nothing here names a
//! concrete host: implementations live behind [crate::adapter] for any [crate::host::HostRuntime].

mod descriptor;
mod options;

pub use descriptor::{NamedWorkflow, WorkflowDescriptor};
pub(crate) use descriptor::resolve_workflow_id;
pub use options::{
    ActivityOptions, ActivityOptionsBuilder, ChildWorkflowOptions, ChildWorkflowOptionsBuilder,
    RetryPolicy, RetryPolicyBuilder,
};

use crate::{errors::WorkflowError, payload::Payload, telemetry::KeyValLogger};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Value stored in a context's key/value bag
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Deterministic execution context handed to every workflow operation
pub trait Context: Clone + Send + Sync + 'static {
    /// Receive side of a channel that reports closed once this context is canceled
    type Done: ReceiveChannel<Self>;

    fn deadline(&self) -> Option<SystemTime>;
    fn done(&self) -> Self::Done;
    /// `None` while the context is live, then the reason it ended
    fn err(&self) -> Option<WorkflowError>;
    fn value(&self, key: &str) -> Option<ContextValue>;
    fn is_cancelled(&self) -> bool;

    /// [Context::value] downcast to a concrete type
    fn value_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.value(key)?.downcast::<T>().ok()
    }
}

pub trait NamedChannel: Send + Sync {
    fn name(&self) -> &str;
}

#[async_trait]
pub trait SendChannel<C: Context>: NamedChannel {
    /// Blocks until the value is accepted. Fails if the channel is or becomes closed, or if
    /// `ctx` is canceled first.
    async fn send<T>(&self, ctx: &C, value: &T) -> Result<(), WorkflowError>
    where
        T: Serialize + Sync + ?Sized;
    /// Returns true if the value was accepted without blocking
    fn send_async<T>(&self, value: &T) -> bool
    where
        T: Serialize + ?Sized;
    /// Close the channel. Buffered values remain receivable.
    fn close(&self);
}

#[async_trait]
pub trait ReceiveChannel<C: Context>: NamedChannel {
    /// Blocks until a value is available and writes it to `value`. Returns false once the
    /// channel is closed and drained, leaving `value` untouched.
    async fn receive<T>(&self, ctx: &C, value: &mut T) -> Result<bool, WorkflowError>
    where
        T: DeserializeOwned + Send;
    /// Like [ReceiveChannel::receive] but gives up after `timeout`. Returns `(ok, more)`:
    /// `value` is only written when `ok` is true.
    async fn receive_with_timeout<T>(
        &self,
        ctx: &C,
        timeout: Duration,
        value: &mut T,
    ) -> Result<(bool, bool), WorkflowError>
    where
        T: DeserializeOwned + Send;
    /// Returns true if a value was written to `value` without blocking
    fn receive_async<T>(&self, value: &mut T) -> Result<bool, WorkflowError>
    where
        T: DeserializeOwned;
    /// Returns `(ok, more)`, where `more` is false once the channel is closed and drained
    fn receive_async_with_more_flag<T>(&self, value: &mut T) -> Result<(bool, bool), WorkflowError>
    where
        T: DeserializeOwned;
    /// Buffered values plus blocked senders
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both ends of a channel
pub trait Channel<C: Context>: SendChannel<C> + ReceiveChannel<C> {}
impl<C, T> Channel<C> for T
where
    C: Context,
    T: SendChannel<C> + ReceiveChannel<C>,
{
}

/// Single-assignment result of an asynchronous operation
#[async_trait]
pub trait WfFuture<C: Context>: Send + Sync {
    /// Wait for the result and decode it. Calling this again returns the same outcome. Use
    /// [serde::de::IgnoredAny] to wait without decoding.
    async fn get<T>(&self, ctx: &C) -> Result<T, WorkflowError>
    where
        T: DeserializeOwned + Send;
    /// Once true, stays true
    fn is_ready(&self) -> bool;
}

/// Future for a child workflow's result, with access to the child while it runs
pub trait ChildWfFuture<C: Context>: WfFuture<C> {
    type Future: WfFuture<C>;

    /// Resolves with the child's [WorkflowExecution] once it started
    fn child_workflow_execution(&self) -> Self::Future;
    /// Resolves once the signal was delivered to the child
    fn signal_child_workflow<T>(&self, ctx: &C, signal_name: &str, data: &T) -> Self::Future
    where
        T: Serialize + ?Sized;
}

/// Identifies a run of a workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

/// Facts about the running workflow
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInfo {
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: String,
    pub task_queue: String,
    /// Starts at 1 and grows with each retry of the workflow
    pub attempt: u32,
    pub parent: Option<WorkflowExecution>,
    pub memo: BTreeMap<String, Payload>,
    pub cron_schedule: Option<String>,
    pub start_time: SystemTime,
    pub execution_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    pub task_timeout: Option<Duration>,
}

/// A typed activity. Implement this on a marker type and pass it to
/// [WorkflowEngine::execute_activity] through [ActivityRef::of].
pub trait ActivityDefinition {
    type Input: Serialize;
    type Output: DeserializeOwned;

    fn name() -> &'static str;
}

/// Which activity to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRef(String);

impl ActivityRef {
    pub fn of<A: ActivityDefinition>() -> Self {
        Self(A::name().to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActivityRef {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ActivityRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for ActivityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cancels the context it was created with, and every context derived from that one
#[derive(Clone)]
pub struct CancelHandle(Arc<dyn Fn() + Send + Sync>);

impl CancelHandle {
    pub fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(cancel))
    }

    pub fn cancel(&self) {
        (self.0)()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

/// Everything workflow code needs from the host: activities, children, timers, signals, queries
/// and context derivation.
///
/// Implementations hold no per-workflow state and may be shared by any number of executions.
/// The associated types tie each engine to one family of contexts, channels and futures, so
/// mixing handles from different engines does not compile.
#[async_trait]
pub trait WorkflowEngine: Clone + Send + Sync + 'static {
    type Context: Context<Done = Self::ReceiveChannel>;
    type Channel: Channel<Self::Context>;
    type ReceiveChannel: ReceiveChannel<Self::Context>;
    type Future: WfFuture<Self::Context>;
    type ChildFuture: ChildWfFuture<Self::Context, Future = Self::Future>;
    type Logger: KeyValLogger + Clone;

    /// Schedule an activity with the options carried by `ctx`. Returns immediately.
    fn execute_activity(
        &self,
        ctx: &Self::Context,
        activity: impl Into<ActivityRef>,
        args: Vec<Payload>,
    ) -> Self::Future;

    /// Start a child workflow. Fails synchronously when the descriptor or options are invalid
    /// or the host refuses to schedule the child.
    fn execute_child_workflow<D, P>(
        &self,
        ctx: &Self::Context,
        options: &ChildWorkflowOptions,
        descriptor: &D,
        params: &P,
    ) -> Result<Self::ChildFuture, WorkflowError>
    where
        D: WorkflowDescriptor + ?Sized,
        P: Serialize + ?Sized;

    async fn sleep(&self, ctx: &Self::Context, duration: Duration) -> Result<(), WorkflowError>;

    /// Register a read-only handler answering queries of `query_type`. Registering the same
    /// type again replaces the previous handler.
    fn set_query_handler<A, R, F>(
        &self,
        ctx: &Self::Context,
        query_type: &str,
        handler: F,
    ) -> Result<(), WorkflowError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static;

    fn get_signal_channel(&self, ctx: &Self::Context, signal_name: &str) -> Self::ReceiveChannel;

    /// Derive a context whose activity options are `options` layered over those of `ctx`
    fn with_activity_options(&self, ctx: &Self::Context, options: &ActivityOptions)
        -> Self::Context;

    fn get_logger(&self, ctx: &Self::Context) -> Self::Logger;

    fn new_channel(&self, ctx: &Self::Context, name: &str) -> Self::Channel;

    fn new_buffered_channel(&self, ctx: &Self::Context, name: &str, size: usize)
        -> Self::Channel;

    fn with_cancel(&self, ctx: &Self::Context) -> (Self::Context, CancelHandle);

    fn with_value<V>(&self, ctx: &Self::Context, key: &str, value: V) -> Self::Context
    where
        V: Any + Send + Sync;

    fn get_info(&self, ctx: &Self::Context) -> WorkflowInfo;

    /// Current workflow time. Never the wall clock.
    fn now(&self, ctx: &Self::Context) -> SystemTime;
}
