//! The [WorkflowEngine] every [HostRuntime] gets for free

use crate::{
    adapter::{
        self, conversions::to_native_child_options, new_child_workflow_future, new_context,
        new_future, new_receive_channel, rejected_future, ChannelAdapter,
        ChildWorkflowFutureAdapter, ContextAdapter, FutureAdapter, ReceiveChannelAdapter,
    },
    errors::{ConversionError, HostError, WorkflowError},
    host::{HostRuntime, NativeActivityOptions, NativeContext, QueryHandler},
    model::{
        resolve_workflow_id, ActivityOptions, ActivityRef, CancelHandle, ChildWorkflowOptions,
        RetryPolicy, WorkflowDescriptor, WorkflowEngine, WorkflowInfo,
    },
    payload::{AsJsonPayloadExt, FromJsonPayloadExt, Payload},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::Any,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Implements the engine facade by converting arguments and forwarding to the host. Holds
/// nothing but the host handle, so one engine can serve every execution of that host.
#[derive(Clone)]
pub struct HostWorkflowEngine<H: HostRuntime> {
    host: H,
}

impl<H: HostRuntime> HostWorkflowEngine<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}

impl<H: HostRuntime> fmt::Debug for HostWorkflowEngine<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostWorkflowEngine")
    }
}

#[async_trait]
impl<H: HostRuntime> WorkflowEngine for HostWorkflowEngine<H> {
    type Context = ContextAdapter<H>;
    type Channel = ChannelAdapter<H>;
    type ReceiveChannel = ReceiveChannelAdapter<H>;
    type Future = FutureAdapter<H>;
    type ChildFuture = ChildWorkflowFutureAdapter<H>;
    type Logger = H::Logger;

    fn execute_activity(
        &self,
        ctx: &Self::Context,
        activity: impl Into<ActivityRef>,
        args: Vec<Payload>,
    ) -> Self::Future {
        let native = ctx.native();
        if let Err(e) = RetryPolicy::from(&native.activity_options().retry_policy).validate() {
            return rejected_future(e);
        }
        new_future(self.host.execute_activity(native, &activity.into(), args))
    }

    fn execute_child_workflow<D, P>(
        &self,
        ctx: &Self::Context,
        options: &ChildWorkflowOptions,
        descriptor: &D,
        params: &P,
    ) -> Result<Self::ChildFuture, WorkflowError>
    where
        D: WorkflowDescriptor + ?Sized,
        P: Serialize + ?Sized,
    {
        options.validate()?;
        let input = params.as_json_payload().map_err(ConversionError::from)?;
        let workflow_id = resolve_workflow_id(descriptor, &input)?;
        let native_opts =
            to_native_child_options(options, workflow_id, descriptor.name().to_string());
        self.host
            .execute_child_workflow(ctx.native(), native_opts, input)
            .map(new_child_workflow_future)
            .map_err(|e| WorkflowError::from_host("execute child workflow", e))
    }

    async fn sleep(&self, ctx: &Self::Context, duration: Duration) -> Result<(), WorkflowError> {
        self.host
            .sleep(ctx.native(), duration)
            .await
            .map_err(|e| WorkflowError::from_host("sleep", e))
    }

    fn set_query_handler<A, R, F>(
        &self,
        ctx: &Self::Context,
        query_type: &str,
        handler: F,
    ) -> Result<(), WorkflowError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        // Queries without arguments decode `A` from null, which suits `()` and `Option`s
        let native_handler: QueryHandler = Arc::new(move |args: &[Payload]| {
            let arg = match args.first() {
                Some(p) => A::from_json_payload(p),
                None => A::from_json_payload(&Payload::null()),
            }
            .map_err(HostError::from)?;
            let out = handler(arg).map_err(|e| HostError::QueryFailed(format!("{:#}", e)))?;
            out.as_json_payload().map_err(HostError::from)
        });
        self.host
            .set_query_handler(ctx.native(), query_type, native_handler)
            .map_err(|e| WorkflowError::from_host("set query handler", e))
    }

    fn get_signal_channel(&self, ctx: &Self::Context, signal_name: &str) -> Self::ReceiveChannel {
        new_receive_channel(self.host.signal_channel(ctx.native(), signal_name))
    }

    fn with_activity_options(
        &self,
        ctx: &Self::Context,
        options: &ActivityOptions,
    ) -> Self::Context {
        new_context(
            self.host
                .with_activity_options(ctx.native(), NativeActivityOptions::from(options)),
        )
    }

    fn get_logger(&self, ctx: &Self::Context) -> Self::Logger {
        self.host.logger(ctx.native())
    }

    fn new_channel(&self, ctx: &Self::Context, name: &str) -> Self::Channel {
        adapter::new_channel(self.host.new_channel(ctx.native(), name, 0))
    }

    fn new_buffered_channel(&self, ctx: &Self::Context, name: &str, size: usize) -> Self::Channel {
        adapter::new_channel(self.host.new_channel(ctx.native(), name, size))
    }

    fn with_cancel(&self, ctx: &Self::Context) -> (Self::Context, CancelHandle) {
        let (native, handle) = self.host.with_cancel(ctx.native());
        (new_context(native), handle)
    }

    fn with_value<V>(&self, ctx: &Self::Context, key: &str, value: V) -> Self::Context
    where
        V: Any + Send + Sync,
    {
        new_context(self.host.with_value(ctx.native(), key, Arc::new(value)))
    }

    fn get_info(&self, ctx: &Self::Context) -> WorkflowInfo {
        self.host.info(ctx.native())
    }

    fn now(&self, ctx: &Self::Context) -> SystemTime {
        self.host.now(ctx.native())
    }
}
