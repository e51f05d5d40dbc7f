//! A deterministic, in-process [HostRuntime].
//!
//! Workflow code runs on a virtual clock that only moves when a [LocalRun] is told to move it.
//! Activities run for real on the calling tokio runtime, one at a time, outside of workflow
//! code. Everything a run does happens in a fixed order, so driving the same run the same way
//! always produces the same history.

mod activity;
mod channel;
mod context;
mod future;
mod run;
mod scheduler;

pub use activity::{arg, ActivityContext, ActivityError, ActivityFunction, ActivityInfo};
pub use channel::LocalChannel;
pub use context::LocalContext;
pub use future::{LocalChildFuture, LocalFuture};
pub use run::LocalRun;

use crate::{
    adapter::{new_context, ContextAdapter},
    engine::HostWorkflowEngine,
    errors::{HostError, WorkflowError},
    host::{
        HostRuntime, NativeActivityOptions, NativeChildWorkflowOptions, NativeContext,
        NativeRetryPolicy, QueryHandler,
    },
    model::{ActivityRef, CancelHandle, ContextValue, WorkflowExecution, WorkflowInfo},
    payload::{AsJsonPayloadExt, FromJsonPayloadExt, Payload},
    telemetry::{Level, TracingLogger},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use scheduler::{ExecutionState, ExecutionStatus, ResultCell, TimerAction};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The engine workflow functions registered with a [LocalHost] receive
pub type LocalEngine = HostWorkflowEngine<LocalHost>;
/// The context workflow functions registered with a [LocalHost] receive
pub type LocalWfContext = ContextAdapter<LocalHost>;

const RESERVED_QUERY_PREFIX: &str = "__";
const RUN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_6f6d_2d72_756e_2d69_642d_6e73_0001);

/// Configuration of a [LocalHost]. Construct with [LocalHostOptionsBuilder]
#[derive(Debug, Clone, PartialEq, derive_builder::Builder)]
#[builder(setter(into), default)]
pub struct LocalHostOptions {
    pub namespace: String,
    /// Task queue of workflows started without one
    pub task_queue: String,
    /// Workflow time when a run starts
    pub start_time: SystemTime,
    /// Used for activities whose options carry the zero retry policy
    pub default_activity_retry_policy: NativeRetryPolicy,
    /// Initial threshold of the loggers handed to workflow code. Each run adjusts its own copy.
    pub log_level: Level,
}

impl Default for LocalHostOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            task_queue: "default".to_string(),
            start_time: SystemTime::UNIX_EPOCH,
            default_activity_retry_policy: NativeRetryPolicy {
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 2.0,
                maximum_interval: Duration::from_secs(100),
                maximum_attempts: 10,
                non_retryable_error_types: vec![],
            },
            log_level: Level::Info,
        }
    }
}

/// How to start the root workflow of a [LocalRun]
#[derive(Debug, Clone, Default, PartialEq, derive_builder::Builder)]
#[builder(setter(into), default)]
pub struct StartWorkflowOptions {
    /// Defaults to the workflow type when empty
    pub workflow_id: String,
    pub workflow_type: String,
    #[builder(setter(into, strip_option))]
    pub task_queue: Option<String>,
    #[builder(setter(into, strip_option))]
    pub execution_timeout: Option<Duration>,
    pub memo: BTreeMap<String, Payload>,
}

type BoxWfFn = Arc<
    dyn Fn(LocalHost, LocalContext, Payload) -> BoxFuture<'static, Result<Payload, HostError>>
        + Send
        + Sync,
>;

/// A workflow implementation registered with a [LocalHost]
#[derive(Clone)]
pub struct WorkflowFunction {
    wf_func: BoxWfFn,
}

impl WorkflowFunction {
    /// Wrap a workflow written against the engine facade. The input is decoded before the
    /// function is invoked and the output encoded once it returns.
    pub fn new<F, Fut, I, O>(f: F) -> Self
    where
        F: Fn(LocalEngine, LocalWfContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
    {
        Self {
            wf_func: Arc::new(move |host: LocalHost, ctx: LocalContext, input: Payload| {
                let input = match I::from_json_payload(&input) {
                    Ok(i) => i,
                    Err(e) => return futures::future::ready(Err(HostError::from(e))).boxed(),
                };
                f(HostWorkflowEngine::new(host), new_context(ctx), input)
                    .map(|res| match res {
                        Ok(out) => out.as_json_payload().map_err(HostError::from),
                        Err(e) => Err(workflow_failure(e)),
                    })
                    .boxed()
            }),
        }
    }

    pub(crate) fn call(
        &self,
        host: LocalHost,
        ctx: LocalContext,
        input: Payload,
    ) -> BoxFuture<'static, Result<Payload, HostError>> {
        (self.wf_func)(host, ctx, input)
    }
}

impl fmt::Debug for WorkflowFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkflowFunction")
    }
}

fn workflow_failure(err: WorkflowError) -> HostError {
    if err.is_cancelled() {
        HostError::Canceled
    } else {
        HostError::WorkflowFailed(err.to_string())
    }
}

/// Deterministic run id of an execution
pub(crate) fn run_id_for(parent_run_id: &str, workflow_id: &str, seq: u64) -> String {
    let key = format!("{}\0{}\0{}", parent_run_id, workflow_id, seq);
    Uuid::new_v5(&RUN_ID_NAMESPACE, key.as_bytes()).to_string()
}

/// An activity waiting to run, or waiting for its next attempt
pub(crate) struct PendingActivity {
    pub(crate) ctx: LocalContext,
    pub(crate) activity_type: String,
    pub(crate) activity_id: String,
    pub(crate) task_queue: String,
    pub(crate) args: Vec<Payload>,
    pub(crate) options: NativeActivityOptions,
    /// Starts at 1
    pub(crate) attempt: u32,
    /// Clock offset when the first attempt was scheduled
    pub(crate) scheduled_at: Duration,
    pub(crate) cell: Arc<ResultCell>,
}

/// Everything needed to start, or restart, a child execution
#[derive(Clone)]
pub(crate) struct ChildStart {
    pub(crate) run_id: String,
    pub(crate) token: CancellationToken,
    pub(crate) function: WorkflowFunction,
    pub(crate) input: Payload,
    pub(crate) options: NativeChildWorkflowOptions,
    pub(crate) attempt: u32,
    /// Clock offset the execution must finish by, fixed when the first attempt starts
    pub(crate) deadline: Option<Duration>,
    pub(crate) result: Arc<ResultCell>,
    pub(crate) started: Arc<ResultCell>,
}

/// In-process host. Cloning is cheap and clones share registrations, so one host may serve any
/// number of runs.
#[derive(Clone)]
pub struct LocalHost {
    inner: Arc<LocalHostInner>,
}

struct LocalHostInner {
    options: LocalHostOptions,
    activities: DashMap<String, ActivityFunction>,
    workflows: DashMap<String, WorkflowFunction>,
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new(LocalHostOptions::default())
    }
}

impl fmt::Debug for LocalHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHost")
            .field("options", &self.inner.options)
            .field("activities", &self.inner.activities.len())
            .field("workflows", &self.inner.workflows.len())
            .finish()
    }
}

impl LocalHost {
    pub fn new(options: LocalHostOptions) -> Self {
        Self {
            inner: Arc::new(LocalHostInner {
                options,
                activities: DashMap::new(),
                workflows: DashMap::new(),
            }),
        }
    }

    pub fn options(&self) -> &LocalHostOptions {
        &self.inner.options
    }

    /// Register an activity under `activity_type`, replacing any previous registration
    pub fn register_activity(
        &self,
        activity_type: impl Into<String>,
        function: impl Into<ActivityFunction>,
    ) {
        self.inner
            .activities
            .insert(activity_type.into(), function.into());
    }

    /// Register a workflow under `workflow_type`, replacing any previous registration
    pub fn register_workflow<F, Fut, I, O>(&self, workflow_type: impl Into<String>, function: F)
    where
        F: Fn(LocalEngine, LocalWfContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
    {
        self.inner
            .workflows
            .insert(workflow_type.into(), WorkflowFunction::new(function));
    }

    pub fn engine(&self) -> LocalEngine {
        HostWorkflowEngine::new(self.clone())
    }

    /// Start a run of a registered workflow. Nothing executes until the run is driven.
    pub fn start_workflow<I>(
        &self,
        options: StartWorkflowOptions,
        input: &I,
    ) -> Result<LocalRun, HostError>
    where
        I: Serialize + ?Sized,
    {
        let function = self.workflow_function(&options.workflow_type)?;
        let input = input.as_json_payload()?;
        Ok(LocalRun::start(self.clone(), options, function, input))
    }

    fn workflow_function(&self, workflow_type: &str) -> Result<WorkflowFunction, HostError> {
        self.inner
            .workflows
            .get(workflow_type)
            .map(|f| f.value().clone())
            .ok_or_else(|| HostError::WorkflowNotRegistered(workflow_type.to_string()))
    }

    pub(crate) fn activity_function(&self, activity_type: &str) -> Option<ActivityFunction> {
        self.inner
            .activities
            .get(activity_type)
            .map(|f| f.value().clone())
    }

    /// Info of an execution the scheduler no longer knows about
    fn detached_info(&self, ctx: &LocalContext) -> WorkflowInfo {
        WorkflowInfo {
            workflow_execution: WorkflowExecution {
                workflow_id: String::new(),
                run_id: ctx.run_id().to_string(),
            },
            workflow_type: String::new(),
            task_queue: self.inner.options.task_queue.clone(),
            attempt: 1,
            parent: None,
            memo: BTreeMap::new(),
            cron_schedule: None,
            start_time: ctx.scheduler().start_time(),
            execution_timeout: None,
            run_timeout: None,
            task_timeout: None,
        }
    }
}

#[async_trait]
impl HostRuntime for LocalHost {
    type Context = LocalContext;
    type Future = LocalFuture;
    type ChildFuture = LocalChildFuture;
    type Logger = TracingLogger;

    fn logger(&self, ctx: &LocalContext) -> TracingLogger {
        let info = self.info(ctx);
        ctx.scheduler()
            .logger(self.inner.options.log_level)
            .with_field("namespace", &self.inner.options.namespace)
            .with_field("workflow_id", &info.workflow_execution.workflow_id)
            .with_field("run_id", &info.workflow_execution.run_id)
            .with_field("workflow_type", &info.workflow_type)
    }

    fn info(&self, ctx: &LocalContext) -> WorkflowInfo {
        ctx.scheduler()
            .with_execution(ctx.run_id(), |e| e.info.clone())
            .unwrap_or_else(|| self.detached_info(ctx))
    }

    fn now(&self, ctx: &LocalContext) -> SystemTime {
        ctx.scheduler().now()
    }

    fn execute_activity(
        &self,
        ctx: &LocalContext,
        activity: &ActivityRef,
        args: Vec<Payload>,
    ) -> LocalFuture {
        if ctx.is_cancelled() {
            return LocalFuture::ready(ctx, Err(HostError::Canceled));
        }
        let options = ctx.activity_options().clone();
        if options.start_to_close_timeout.is_none() && options.schedule_to_close_timeout.is_none()
        {
            return LocalFuture::ready(
                ctx,
                Err(HostError::InvalidActivityOptions(
                    "either start to close or schedule to close timeout must be set".to_string(),
                )),
            );
        }
        let scheduler = ctx.scheduler();
        let (seq, workflow_queue) = scheduler
            .with_execution(ctx.run_id(), |e| {
                e.activity_seq += 1;
                (e.activity_seq, e.info.task_queue.clone())
            })
            .unwrap_or_else(|| (scheduler.next_seq(), self.inner.options.task_queue.clone()));
        let cell = ResultCell::new();
        let fut = LocalFuture::new(cell.clone(), ctx);
        scheduler.enqueue_activity(PendingActivity {
            ctx: ctx.clone(),
            activity_type: activity.name().to_string(),
            activity_id: options
                .activity_id
                .clone()
                .unwrap_or_else(|| seq.to_string()),
            task_queue: options.task_queue.clone().unwrap_or(workflow_queue),
            args,
            options,
            attempt: 1,
            scheduled_at: scheduler.elapsed(),
            cell,
        });
        fut
    }

    fn execute_child_workflow(
        &self,
        ctx: &LocalContext,
        options: NativeChildWorkflowOptions,
        input: Payload,
    ) -> Result<LocalChildFuture, HostError> {
        let function = self.workflow_function(&options.workflow_type)?;
        let scheduler = ctx.scheduler();
        let result = ResultCell::new();
        let started = ResultCell::new();
        let fut = LocalChildFuture::new(ctx, &options.workflow_id, result.clone(), started.clone());
        let refuse = |err: HostError| {
            started.resolve(scheduler, Err(err.clone()));
            result.resolve(scheduler, Err(err));
        };
        if ctx.is_cancelled() {
            refuse(HostError::Canceled);
            return Ok(fut);
        }

        let parent = self.info(ctx);
        let mut state = scheduler.state.lock();
        let running = state
            .runs_by_workflow_id
            .get(&options.workflow_id)
            .and_then(|run_id| state.executions.get(run_id))
            .map_or(false, |e| e.status != ExecutionStatus::Closed);
        if running {
            drop(state);
            refuse(HostError::WorkflowAlreadyStarted {
                workflow_id: options.workflow_id,
            });
            return Ok(fut);
        }
        let run_id = run_id_for(ctx.run_id(), &options.workflow_id, scheduler.next_seq());
        let token = ctx.token().child_token();
        let info = WorkflowInfo {
            workflow_execution: WorkflowExecution {
                workflow_id: options.workflow_id.clone(),
                run_id: run_id.clone(),
            },
            workflow_type: options.workflow_type.clone(),
            task_queue: options
                .task_queue
                .clone()
                .unwrap_or_else(|| parent.task_queue.clone()),
            attempt: 1,
            parent: Some(parent.workflow_execution),
            memo: options.memo.clone(),
            cron_schedule: options.cron_schedule.clone(),
            start_time: scheduler.start_time() + state.now,
            execution_timeout: options.workflow_execution_timeout,
            run_timeout: options.workflow_run_timeout,
            task_timeout: options.workflow_task_timeout,
        };
        state.executions.insert(
            run_id.clone(),
            ExecutionState::new(
                info,
                token.clone(),
                ExecutionStatus::Scheduled,
                result.clone(),
                started.clone(),
            ),
        );
        state
            .runs_by_workflow_id
            .insert(options.workflow_id.clone(), run_id.clone());
        drop(state);

        tracing::debug!(
            workflow_id = %options.workflow_id,
            workflow_type = %options.workflow_type,
            run_id = %run_id,
            "Scheduling child workflow"
        );
        let start_delay = options.start_delay.filter(|d| !d.is_zero());
        let start = ChildStart {
            run_id,
            token,
            function,
            input,
            options,
            attempt: 1,
            deadline: None,
            result,
            started,
        };
        match start_delay {
            Some(delay) => {
                scheduler.add_timer(delay, TimerAction::StartChild(start));
            }
            None => scheduler.enqueue_start(start),
        }
        Ok(fut)
    }

    async fn sleep(&self, ctx: &LocalContext, duration: Duration) -> Result<(), HostError> {
        future::Sleep::new(ctx, duration).await
    }

    fn set_query_handler(
        &self,
        ctx: &LocalContext,
        query_type: &str,
        handler: QueryHandler,
    ) -> Result<(), HostError> {
        if query_type.is_empty() {
            return Err(HostError::QueryRejected(
                "query type must not be empty".to_string(),
            ));
        }
        if query_type.starts_with(RESERVED_QUERY_PREFIX) {
            return Err(HostError::QueryRejected(format!(
                "query type {} uses the reserved prefix {}",
                query_type, RESERVED_QUERY_PREFIX
            )));
        }
        ctx.scheduler()
            .with_execution(ctx.run_id(), |e| {
                e.query_handlers.insert(query_type.to_string(), handler);
            })
            .ok_or_else(|| {
                HostError::QueryRejected(format!("unknown execution {}", ctx.run_id()))
            })
    }

    fn signal_channel(&self, ctx: &LocalContext, signal_name: &str) -> LocalChannel {
        ctx.scheduler()
            .signal_channel(ctx.run_id(), signal_name)
            .unwrap_or_else(|| {
                LocalChannel::unbounded(ctx.scheduler().clone(), ctx.run_id(), signal_name)
            })
    }

    fn new_channel(&self, ctx: &LocalContext, name: &str, capacity: usize) -> LocalChannel {
        LocalChannel::new(ctx.scheduler().clone(), ctx.run_id(), name, capacity)
    }

    fn with_activity_options(
        &self,
        ctx: &LocalContext,
        options: NativeActivityOptions,
    ) -> LocalContext {
        ctx.with_activity_options(options)
    }

    fn with_value(&self, ctx: &LocalContext, key: &str, value: ContextValue) -> LocalContext {
        ctx.with_value(key, value)
    }

    fn with_cancel(&self, ctx: &LocalContext) -> (LocalContext, CancelHandle) {
        let derived = ctx.with_child_token();
        let token = derived.token().clone();
        let scheduler = Arc::downgrade(ctx.scheduler());
        let handle = CancelHandle::new(move || {
            token.cancel();
            if let Some(s) = scheduler.upgrade() {
                s.bump();
            }
        });
        (derived, handle)
    }
}
