use super::{
    scheduler::{ExecutionStatus, ResultCell, Scheduler, TimerAction, TimerKey},
    LocalContext,
};
use crate::{
    errors::HostError,
    host::{NativeChildWorkflowFuture, NativeContext, NativeFuture},
    payload::Payload,
};
use async_trait::async_trait;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

/// Future over a result cell of a local run
#[derive(Clone)]
pub struct LocalFuture {
    cell: Arc<ResultCell>,
    run_id: Arc<str>,
    scheduler: Arc<Scheduler>,
}

impl LocalFuture {
    pub(crate) fn new(cell: Arc<ResultCell>, ctx: &LocalContext) -> Self {
        Self {
            cell,
            run_id: ctx.run_id().into(),
            scheduler: ctx.scheduler().clone(),
        }
    }

    /// A future that is already resolved
    pub(crate) fn ready(ctx: &LocalContext, result: Result<Payload, HostError>) -> Self {
        let fut = Self::new(ResultCell::new(), ctx);
        fut.cell.resolve(&fut.scheduler, result);
        fut
    }
}

#[async_trait]
impl NativeFuture<LocalContext> for LocalFuture {
    fn execution_id(&self) -> &str {
        &self.run_id
    }

    async fn get(&self, ctx: &LocalContext) -> Result<Payload, HostError> {
        wait_for(&self.cell, &self.scheduler, ctx).await
    }

    fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }
}

async fn wait_for(
    cell: &ResultCell,
    scheduler: &Scheduler,
    ctx: &LocalContext,
) -> Result<Payload, HostError> {
    futures::future::poll_fn(|cx| {
        if let Some(result) = cell.get() {
            return Poll::Ready(result);
        }
        if ctx.is_cancelled() {
            return Poll::Ready(Err(HostError::Canceled));
        }
        scheduler.park(cx.waker());
        Poll::Pending
    })
    .await
}

/// Result of a child workflow started from a local run
#[derive(Clone)]
pub struct LocalChildFuture {
    result: LocalFuture,
    started: Arc<ResultCell>,
    workflow_id: Arc<str>,
}

impl LocalChildFuture {
    pub(crate) fn new(
        ctx: &LocalContext,
        workflow_id: &str,
        result: Arc<ResultCell>,
        started: Arc<ResultCell>,
    ) -> Self {
        Self {
            result: LocalFuture::new(result, ctx),
            started,
            workflow_id: workflow_id.into(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

#[async_trait]
impl NativeFuture<LocalContext> for LocalChildFuture {
    fn execution_id(&self) -> &str {
        self.result.execution_id()
    }

    async fn get(&self, ctx: &LocalContext) -> Result<Payload, HostError> {
        self.result.get(ctx).await
    }

    fn is_ready(&self) -> bool {
        self.result.is_ready()
    }
}

impl NativeChildWorkflowFuture<LocalContext> for LocalChildFuture {
    type Future = LocalFuture;

    fn execution(&self) -> LocalFuture {
        LocalFuture {
            cell: self.started.clone(),
            run_id: self.result.run_id.clone(),
            scheduler: self.result.scheduler.clone(),
        }
    }

    fn signal(&self, ctx: &LocalContext, signal_name: &str, value: Payload) -> LocalFuture {
        let scheduler = ctx.scheduler();
        let ack = ResultCell::new();
        let fut = LocalFuture::new(ack.clone(), ctx);
        if ctx.is_cancelled() {
            ack.resolve(scheduler, Err(HostError::Canceled));
            return fut;
        }
        // A child that never started cannot take signals
        if let Some(Err(e)) = self.started.get() {
            ack.resolve(scheduler, Err(e));
            return fut;
        }
        let run_id = scheduler
            .state
            .lock()
            .runs_by_workflow_id
            .get(&*self.workflow_id)
            .cloned();
        let Some(run_id) = run_id else {
            ack.resolve(
                scheduler,
                Err(HostError::WorkflowCompleted {
                    workflow_id: self.workflow_id.to_string(),
                }),
            );
            return fut;
        };
        let status = scheduler.with_execution(&run_id, |e| e.status);
        match status {
            Some(ExecutionStatus::Running) | Some(ExecutionStatus::Scheduled) => {
                if let Some(chan) = scheduler.signal_channel(&run_id, signal_name) {
                    chan.deliver(value);
                }
                if status == Some(ExecutionStatus::Running) {
                    ack.resolve(scheduler, Ok(Payload::null()));
                } else {
                    scheduler.with_execution(&run_id, |e| e.pending_signal_acks.push(ack.clone()));
                }
            }
            Some(ExecutionStatus::Closed) | None => {
                ack.resolve(
                    scheduler,
                    Err(HostError::WorkflowCompleted {
                        workflow_id: self.workflow_id.to_string(),
                    }),
                );
            }
        }
        fut
    }
}

/// Waits on the virtual clock
pub(crate) struct Sleep<'a> {
    ctx: &'a LocalContext,
    duration: Duration,
    state: SleepState,
}

enum SleepState {
    Init,
    Waiting { timer: TimerKey, fired: Arc<AtomicBool> },
    Done,
}

impl<'a> Sleep<'a> {
    pub(crate) fn new(ctx: &'a LocalContext, duration: Duration) -> Self {
        Self {
            ctx,
            duration,
            state: SleepState::Init,
        }
    }
}

impl Future for Sleep<'_> {
    type Output = Result<(), HostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let scheduler = this.ctx.scheduler();
        match std::mem::replace(&mut this.state, SleepState::Done) {
            SleepState::Init => {
                if this.ctx.is_cancelled() {
                    return Poll::Ready(Err(HostError::Canceled));
                }
                if this.duration.is_zero() {
                    return Poll::Ready(Ok(()));
                }
                let fired = Arc::new(AtomicBool::new(false));
                let timer = scheduler.add_timer(this.duration, TimerAction::Fire(fired.clone()));
                this.state = SleepState::Waiting { timer, fired };
                scheduler.park(cx.waker());
                Poll::Pending
            }
            SleepState::Waiting { timer, fired } => {
                if fired.load(Ordering::SeqCst) {
                    return Poll::Ready(Ok(()));
                }
                if this.ctx.is_cancelled() {
                    scheduler.cancel_timer(timer);
                    return Poll::Ready(Err(HostError::Canceled));
                }
                this.state = SleepState::Waiting { timer, fired };
                scheduler.park(cx.waker());
                Poll::Pending
            }
            SleepState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Sleep<'_> {
    fn drop(&mut self) {
        if let SleepState::Waiting { timer, .. } = &self.state {
            self.ctx.scheduler().cancel_timer(*timer);
        }
    }
}
