//! Adapters binding the [crate::model] interfaces to the native handles of a [HostRuntime].
//!
//! Every adapter wraps exactly one native handle. Values are encoded to [Payload]s on the way
//! down and decoded on the way up; host errors are wrapped with the name of the operation.

pub mod conversions;

use crate::{
    errors::{ConversionError, WorkflowError},
    host::{HostRuntime, NativeChan, NativeChannel, NativeChildWorkflowFuture, NativeContext, NativeFuture},
    model::{
        ChildWfFuture, Context, ContextValue, NamedChannel, ReceiveChannel, SendChannel, WfFuture,
    },
    payload::{AsJsonPayloadExt, FromJsonPayloadExt, Payload},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    marker::PhantomData,
    time::{Duration, SystemTime},
};

/// Create the workflow-facing context for a native context
pub fn new_context<H: HostRuntime>(native: H::Context) -> ContextAdapter<H> {
    ContextAdapter { native }
}

pub fn new_channel<H: HostRuntime>(native: NativeChan<H>) -> ChannelAdapter<H> {
    ChannelAdapter {
        native,
        _host: PhantomData,
    }
}

pub fn new_receive_channel<H: HostRuntime>(native: NativeChan<H>) -> ReceiveChannelAdapter<H> {
    ReceiveChannelAdapter {
        native,
        _host: PhantomData,
    }
}

pub fn new_future<H: HostRuntime>(native: H::Future) -> FutureAdapter<H> {
    FutureAdapter {
        state: FutureState::Native(native),
        _host: PhantomData,
    }
}

/// A future that is already resolved with a conversion failure
pub(crate) fn rejected_future<H: HostRuntime>(err: ConversionError) -> FutureAdapter<H> {
    FutureAdapter {
        state: FutureState::Rejected(err),
        _host: PhantomData,
    }
}

pub fn new_child_workflow_future<H: HostRuntime>(
    native: H::ChildFuture,
) -> ChildWorkflowFutureAdapter<H> {
    ChildWorkflowFutureAdapter { native }
}

/// Unwrap `ctx` for use with a handle owned by `owner`. A context of another execution means
/// the workflow wired handles together incorrectly, which cannot be recovered from.
fn native_ctx<'a, H: HostRuntime>(owner: &str, ctx: &'a ContextAdapter<H>) -> &'a H::Context {
    let native = ctx.native();
    if native.execution_id() != owner {
        let err = WorkflowError::InvalidContext {
            expected: owner.to_string(),
            actual: native.execution_id().to_string(),
        };
        panic!("{}", err);
    }
    native
}

fn decode_into<T: DeserializeOwned>(
    op: &'static str,
    payload: &Payload,
    value: &mut T,
) -> Result<(), WorkflowError> {
    *value = T::from_json_payload(payload)
        .map_err(|e| WorkflowError::from_host(op, e.into()))?;
    Ok(())
}

pub struct ContextAdapter<H: HostRuntime> {
    native: H::Context,
}

impl<H: HostRuntime> ContextAdapter<H> {
    /// The wrapped native context
    pub fn native(&self) -> &H::Context {
        &self.native
    }
}

impl<H: HostRuntime> Clone for ContextAdapter<H> {
    fn clone(&self) -> Self {
        Self {
            native: self.native.clone(),
        }
    }
}

impl<H: HostRuntime> fmt::Debug for ContextAdapter<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAdapter")
            .field("execution_id", &self.native.execution_id())
            .field("cancelled", &self.native.is_cancelled())
            .finish()
    }
}

impl<H: HostRuntime> Context for ContextAdapter<H> {
    type Done = ReceiveChannelAdapter<H>;

    fn deadline(&self) -> Option<SystemTime> {
        self.native.deadline()
    }

    fn done(&self) -> Self::Done {
        new_receive_channel(self.native.done())
    }

    fn err(&self) -> Option<WorkflowError> {
        self.native
            .err()
            .map(|e| WorkflowError::from_host("context", e))
    }

    fn value(&self, key: &str) -> Option<ContextValue> {
        self.native.value(key)
    }

    fn is_cancelled(&self) -> bool {
        self.native.is_cancelled()
    }
}

/// Both ends of a native channel
pub struct ChannelAdapter<H: HostRuntime> {
    native: NativeChan<H>,
    _host: PhantomData<fn() -> H>,
}

impl<H: HostRuntime> ChannelAdapter<H> {
    pub fn native(&self) -> &NativeChan<H> {
        &self.native
    }

    /// A handle exposing only the receive side of the same channel
    pub fn receiver(&self) -> ReceiveChannelAdapter<H> {
        new_receive_channel(self.native.clone())
    }
}

impl<H: HostRuntime> Clone for ChannelAdapter<H> {
    fn clone(&self) -> Self {
        new_channel(self.native.clone())
    }
}

impl<H: HostRuntime> NamedChannel for ChannelAdapter<H> {
    fn name(&self) -> &str {
        self.native.name()
    }
}

#[async_trait]
impl<H: HostRuntime> SendChannel<ContextAdapter<H>> for ChannelAdapter<H> {
    async fn send<T>(&self, ctx: &ContextAdapter<H>, value: &T) -> Result<(), WorkflowError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let nctx = native_ctx(self.native.execution_id(), ctx);
        let payload = value.as_json_payload().map_err(ConversionError::from)?;
        self.native
            .send(nctx, payload)
            .await
            .map_err(|e| WorkflowError::from_host("send", e))
    }

    fn send_async<T>(&self, value: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        match value.as_json_payload() {
            Ok(payload) => self.native.send_async(payload),
            Err(e) => {
                tracing::warn!(channel = self.native.name(), error = %e, "Dropping unencodable value");
                false
            }
        }
    }

    fn close(&self) {
        self.native.close()
    }
}

#[async_trait]
impl<H: HostRuntime> ReceiveChannel<ContextAdapter<H>> for ChannelAdapter<H> {
    async fn receive<T>(&self, ctx: &ContextAdapter<H>, value: &mut T) -> Result<bool, WorkflowError>
    where
        T: DeserializeOwned + Send,
    {
        receive(&self.native, ctx, value).await
    }

    async fn receive_with_timeout<T>(
        &self,
        ctx: &ContextAdapter<H>,
        timeout: Duration,
        value: &mut T,
    ) -> Result<(bool, bool), WorkflowError>
    where
        T: DeserializeOwned + Send,
    {
        receive_with_timeout(&self.native, ctx, timeout, value).await
    }

    fn receive_async<T>(&self, value: &mut T) -> Result<bool, WorkflowError>
    where
        T: DeserializeOwned,
    {
        receive_async::<H, T>(&self.native, value)
    }

    fn receive_async_with_more_flag<T>(&self, value: &mut T) -> Result<(bool, bool), WorkflowError>
    where
        T: DeserializeOwned,
    {
        receive_async_with_more_flag::<H, T>(&self.native, value)
    }

    fn len(&self) -> usize {
        self.native.len()
    }
}

/// Receive side of a native channel. Signal channels and context done channels are handed out
/// as this type.
pub struct ReceiveChannelAdapter<H: HostRuntime> {
    native: NativeChan<H>,
    _host: PhantomData<fn() -> H>,
}

impl<H: HostRuntime> ReceiveChannelAdapter<H> {
    pub fn native(&self) -> &NativeChan<H> {
        &self.native
    }
}

impl<H: HostRuntime> Clone for ReceiveChannelAdapter<H> {
    fn clone(&self) -> Self {
        new_receive_channel(self.native.clone())
    }
}

impl<H: HostRuntime> NamedChannel for ReceiveChannelAdapter<H> {
    fn name(&self) -> &str {
        self.native.name()
    }
}

#[async_trait]
impl<H: HostRuntime> ReceiveChannel<ContextAdapter<H>> for ReceiveChannelAdapter<H> {
    async fn receive<T>(&self, ctx: &ContextAdapter<H>, value: &mut T) -> Result<bool, WorkflowError>
    where
        T: DeserializeOwned + Send,
    {
        receive(&self.native, ctx, value).await
    }

    async fn receive_with_timeout<T>(
        &self,
        ctx: &ContextAdapter<H>,
        timeout: Duration,
        value: &mut T,
    ) -> Result<(bool, bool), WorkflowError>
    where
        T: DeserializeOwned + Send,
    {
        receive_with_timeout(&self.native, ctx, timeout, value).await
    }

    fn receive_async<T>(&self, value: &mut T) -> Result<bool, WorkflowError>
    where
        T: DeserializeOwned,
    {
        receive_async::<H, T>(&self.native, value)
    }

    fn receive_async_with_more_flag<T>(&self, value: &mut T) -> Result<(bool, bool), WorkflowError>
    where
        T: DeserializeOwned,
    {
        receive_async_with_more_flag::<H, T>(&self.native, value)
    }

    fn len(&self) -> usize {
        self.native.len()
    }
}

async fn receive<H, T>(
    native: &NativeChan<H>,
    ctx: &ContextAdapter<H>,
    value: &mut T,
) -> Result<bool, WorkflowError>
where
    H: HostRuntime,
    T: DeserializeOwned + Send,
{
    let nctx = native_ctx(native.execution_id(), ctx);
    match native
        .receive(nctx)
        .await
        .map_err(|e| WorkflowError::from_host("receive", e))?
    {
        Some(payload) => {
            decode_into("receive", &payload, value)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn receive_with_timeout<H, T>(
    native: &NativeChan<H>,
    ctx: &ContextAdapter<H>,
    timeout: Duration,
    value: &mut T,
) -> Result<(bool, bool), WorkflowError>
where
    H: HostRuntime,
    T: DeserializeOwned + Send,
{
    let nctx = native_ctx(native.execution_id(), ctx);
    match native.receive_with_timeout(nctx, timeout).await {
        (Some(payload), more) => {
            decode_into("receive with timeout", &payload, value)?;
            Ok((true, more))
        }
        (None, more) => Ok((false, more)),
    }
}

fn receive_async<H, T>(native: &NativeChan<H>, value: &mut T) -> Result<bool, WorkflowError>
where
    H: HostRuntime,
    T: DeserializeOwned,
{
    match native.receive_async() {
        Some(payload) => {
            decode_into("receive async", &payload, value)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn receive_async_with_more_flag<H, T>(
    native: &NativeChan<H>,
    value: &mut T,
) -> Result<(bool, bool), WorkflowError>
where
    H: HostRuntime,
    T: DeserializeOwned,
{
    match native.receive_async_with_more_flag() {
        (Some(payload), more) => {
            decode_into("receive async", &payload, value)?;
            Ok((true, more))
        }
        (None, more) => Ok((false, more)),
    }
}

enum FutureState<N> {
    Native(N),
    Rejected(ConversionError),
}

pub struct FutureAdapter<H: HostRuntime> {
    state: FutureState<H::Future>,
    _host: PhantomData<fn() -> H>,
}

impl<H: HostRuntime> FutureAdapter<H> {
    /// The wrapped native future, absent if the future was rejected before reaching the host
    pub fn native(&self) -> Option<&H::Future> {
        match &self.state {
            FutureState::Native(n) => Some(n),
            FutureState::Rejected(_) => None,
        }
    }
}

impl<H: HostRuntime> Clone for FutureAdapter<H> {
    fn clone(&self) -> Self {
        let state = match &self.state {
            FutureState::Native(n) => FutureState::Native(n.clone()),
            FutureState::Rejected(e) => FutureState::Rejected(e.clone()),
        };
        Self {
            state,
            _host: PhantomData,
        }
    }
}

#[async_trait]
impl<H: HostRuntime> WfFuture<ContextAdapter<H>> for FutureAdapter<H> {
    async fn get<T>(&self, ctx: &ContextAdapter<H>) -> Result<T, WorkflowError>
    where
        T: DeserializeOwned + Send,
    {
        match &self.state {
            FutureState::Native(native) => get_decoded(native, ctx).await,
            FutureState::Rejected(e) => Err(e.clone().into()),
        }
    }

    fn is_ready(&self) -> bool {
        match &self.state {
            FutureState::Native(native) => native.is_ready(),
            FutureState::Rejected(_) => true,
        }
    }
}

async fn get_decoded<H, N, T>(native: &N, ctx: &ContextAdapter<H>) -> Result<T, WorkflowError>
where
    H: HostRuntime,
    N: NativeFuture<H::Context>,
    T: DeserializeOwned + Send,
{
    let nctx = native_ctx(native.execution_id(), ctx);
    let payload = native
        .get(nctx)
        .await
        .map_err(|e| WorkflowError::from_host("decode output value", e))?;
    T::from_json_payload(&payload)
        .map_err(|e| WorkflowError::from_host("decode output value", e.into()))
}

pub struct ChildWorkflowFutureAdapter<H: HostRuntime> {
    native: H::ChildFuture,
}

impl<H: HostRuntime> ChildWorkflowFutureAdapter<H> {
    pub fn native(&self) -> &H::ChildFuture {
        &self.native
    }
}

impl<H: HostRuntime> Clone for ChildWorkflowFutureAdapter<H> {
    fn clone(&self) -> Self {
        new_child_workflow_future(self.native.clone())
    }
}

#[async_trait]
impl<H: HostRuntime> WfFuture<ContextAdapter<H>> for ChildWorkflowFutureAdapter<H> {
    async fn get<T>(&self, ctx: &ContextAdapter<H>) -> Result<T, WorkflowError>
    where
        T: DeserializeOwned + Send,
    {
        get_decoded(&self.native, ctx).await
    }

    fn is_ready(&self) -> bool {
        self.native.is_ready()
    }
}

impl<H: HostRuntime> ChildWfFuture<ContextAdapter<H>> for ChildWorkflowFutureAdapter<H> {
    type Future = FutureAdapter<H>;

    fn child_workflow_execution(&self) -> Self::Future {
        new_future(self.native.execution())
    }

    fn signal_child_workflow<T>(
        &self,
        ctx: &ContextAdapter<H>,
        signal_name: &str,
        data: &T,
    ) -> Self::Future
    where
        T: Serialize + ?Sized,
    {
        let nctx = native_ctx(self.native.execution_id(), ctx);
        match data.as_json_payload() {
            Ok(payload) => new_future(self.native.signal(nctx, signal_name, payload)),
            Err(e) => rejected_future(e.into()),
        }
    }
}
