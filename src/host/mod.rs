//! The seam a durable-execution runtime plugs into. A host provides native contexts, channels
//! and futures speaking [Payload]s and [HostError]s; [crate::adapter] lifts them into the typed
//! [crate::model] interfaces.

mod options;

pub use options::{
    NativeActivityOptions, NativeChildWorkflowOptions, NativeRetryPolicy,
};

use crate::{
    errors::HostError,
    model::{ActivityRef, CancelHandle, ContextValue, WorkflowInfo},
    payload::Payload,
    telemetry::KeyValLogger,
};
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Answers a query. Receives the raw query arguments.
pub type QueryHandler = Arc<dyn Fn(&[Payload]) -> Result<Payload, HostError> + Send + Sync>;

/// Host context for one workflow execution
pub trait NativeContext: Clone + Send + Sync + 'static {
    type Channel: NativeChannel<Self>;

    /// Identifies the execution this context belongs to. Channels and futures carry the same id.
    fn execution_id(&self) -> &str;
    fn deadline(&self) -> Option<SystemTime>;
    fn is_cancelled(&self) -> bool;
    fn err(&self) -> Option<HostError>;
    fn value(&self, key: &str) -> Option<ContextValue>;
    /// Channel that is closed once this context is canceled
    fn done(&self) -> Self::Channel;
    fn activity_options(&self) -> &NativeActivityOptions;
}

#[async_trait]
pub trait NativeChannel<C: NativeContext>: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn execution_id(&self) -> &str;
    async fn send(&self, ctx: &C, value: Payload) -> Result<(), HostError>;
    fn send_async(&self, value: Payload) -> bool;
    fn close(&self);
    /// `None` once the channel is closed and drained
    async fn receive(&self, ctx: &C) -> Result<Option<Payload>, HostError>;
    /// The flag is false once the channel is closed and drained
    async fn receive_with_timeout(&self, ctx: &C, timeout: Duration) -> (Option<Payload>, bool);
    fn receive_async(&self) -> Option<Payload>;
    fn receive_async_with_more_flag(&self) -> (Option<Payload>, bool);
    fn len(&self) -> usize;
}

#[async_trait]
pub trait NativeFuture<C: NativeContext>: Clone + Send + Sync + 'static {
    fn execution_id(&self) -> &str;
    /// Resolves with the stored outcome, or fails with [HostError::Canceled] if `ctx` is
    /// canceled while waiting
    async fn get(&self, ctx: &C) -> Result<Payload, HostError>;
    fn is_ready(&self) -> bool;
}

pub trait NativeChildWorkflowFuture<C: NativeContext>: NativeFuture<C> {
    type Future: NativeFuture<C>;

    fn execution(&self) -> Self::Future;
    fn signal(&self, ctx: &C, signal_name: &str, value: Payload) -> Self::Future;
}

/// Operations a host runtime performs on behalf of workflow code
#[async_trait]
pub trait HostRuntime: Clone + Send + Sync + 'static {
    type Context: NativeContext;
    type Future: NativeFuture<Self::Context>;
    type ChildFuture: NativeChildWorkflowFuture<Self::Context, Future = Self::Future>;
    type Logger: KeyValLogger + Clone;

    fn logger(&self, ctx: &Self::Context) -> Self::Logger;
    fn info(&self, ctx: &Self::Context) -> WorkflowInfo;
    fn now(&self, ctx: &Self::Context) -> SystemTime;

    /// Schedule an activity using the options stored in `ctx`
    fn execute_activity(
        &self,
        ctx: &Self::Context,
        activity: &ActivityRef,
        args: Vec<Payload>,
    ) -> Self::Future;
    fn execute_child_workflow(
        &self,
        ctx: &Self::Context,
        options: NativeChildWorkflowOptions,
        input: Payload,
    ) -> Result<Self::ChildFuture, HostError>;
    async fn sleep(&self, ctx: &Self::Context, duration: Duration) -> Result<(), HostError>;
    fn set_query_handler(
        &self,
        ctx: &Self::Context,
        query_type: &str,
        handler: QueryHandler,
    ) -> Result<(), HostError>;
    fn signal_channel(&self, ctx: &Self::Context, signal_name: &str) -> NativeChan<Self>;
    /// A capacity of zero makes an unbuffered channel
    fn new_channel(&self, ctx: &Self::Context, name: &str, capacity: usize) -> NativeChan<Self>;

    fn with_activity_options(
        &self,
        ctx: &Self::Context,
        options: NativeActivityOptions,
    ) -> Self::Context;
    fn with_value(&self, ctx: &Self::Context, key: &str, value: ContextValue) -> Self::Context;
    fn with_cancel(&self, ctx: &Self::Context) -> (Self::Context, CancelHandle);
}

/// Channel type of a host
pub type NativeChan<H> = <<H as HostRuntime>::Context as NativeContext>::Channel;
