use super::{
    activity::{ActivityContext, ActivityError, ActivityInfo},
    run_id_for,
    scheduler::{ExecutionState, ExecutionStatus, ResultCell, Scheduler, TimerAction},
    ChildStart, LocalContext, LocalHost, PendingActivity, StartWorkflowOptions, WorkflowFunction,
};
use crate::{
    errors::{HostError, TimeoutKind},
    host::{HostRuntime, NativeContext},
    model::{WorkflowExecution, WorkflowInfo},
    payload::{AsJsonPayloadExt, FromJsonPayloadExt, Payload},
    retry_logic::RetryPolicyExt,
    telemetry::VecDisplayer,
};
use futures::{future::BoxFuture, task::noop_waker, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    sync::{atomic::Ordering, Arc},
    task::{Context, Poll},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

struct WorkflowTask {
    run_id: String,
    fut: BoxFuture<'static, Result<Payload, HostError>>,
    /// How to start the execution again if it fails. Absent for the root, which never retries.
    start: Option<ChildStart>,
}

/// One run of a root workflow and every child it starts. Nothing happens until the run is
/// driven with [LocalRun::run_until_blocked], [LocalRun::advance] or [LocalRun::run_until_done].
pub struct LocalRun {
    host: LocalHost,
    scheduler: Arc<Scheduler>,
    execution: WorkflowExecution,
    result: Arc<ResultCell>,
    tasks: Vec<WorkflowTask>,
}

impl LocalRun {
    pub(super) fn start(
        host: LocalHost,
        options: StartWorkflowOptions,
        function: WorkflowFunction,
        input: Payload,
    ) -> Self {
        let scheduler = Scheduler::new(host.options().start_time);
        let workflow_id = if options.workflow_id.is_empty() {
            options.workflow_type.clone()
        } else {
            options.workflow_id.clone()
        };
        let execution = WorkflowExecution {
            run_id: run_id_for("", &workflow_id, 0),
            workflow_id,
        };
        let token = CancellationToken::new();
        let result = ResultCell::new();
        let started = ResultCell::new();
        let info = WorkflowInfo {
            workflow_execution: execution.clone(),
            workflow_type: options.workflow_type,
            task_queue: options
                .task_queue
                .unwrap_or_else(|| host.options().task_queue.clone()),
            attempt: 1,
            parent: None,
            memo: options.memo,
            cron_schedule: None,
            start_time: scheduler.start_time(),
            execution_timeout: options.execution_timeout,
            run_timeout: None,
            task_timeout: None,
        };
        {
            let mut state = scheduler.state.lock();
            state.executions.insert(
                execution.run_id.clone(),
                ExecutionState::new(
                    info,
                    token.clone(),
                    ExecutionStatus::Running,
                    result.clone(),
                    started.clone(),
                ),
            );
            state
                .runs_by_workflow_id
                .insert(execution.workflow_id.clone(), execution.run_id.clone());
        }
        started.resolve(
            &scheduler,
            execution.as_json_payload().map_err(HostError::from),
        );
        if let Some(timeout) = options.execution_timeout {
            scheduler.add_timer(
                timeout,
                TimerAction::ExecutionTimeout {
                    run_id: execution.run_id.clone(),
                },
            );
        }

        tracing::debug!(
            workflow_id = %execution.workflow_id,
            run_id = %execution.run_id,
            "Starting local workflow run"
        );
        let ctx = LocalContext::root(
            scheduler.clone(),
            &execution.run_id,
            token,
            options.execution_timeout,
        );
        let fut = function.call(host.clone(), ctx, input);
        Self {
            host,
            scheduler,
            tasks: vec![WorkflowTask {
                run_id: execution.run_id.clone(),
                fut,
                start: None,
            }],
            execution,
            result,
        }
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Current workflow time
    pub fn now(&self) -> std::time::SystemTime {
        self.scheduler.now()
    }

    /// Time the virtual clock moved since the run started
    pub fn elapsed(&self) -> Duration {
        self.scheduler.elapsed()
    }

    pub fn is_done(&self) -> bool {
        self.result.is_ready()
    }

    /// Outcome of the root workflow, once it finished
    pub fn result(&self) -> Option<Result<Payload, HostError>> {
        self.result.get()
    }

    /// Make all progress possible without moving the clock: poll workflow code until nothing
    /// changes, start children that are due, and run queued activities.
    pub async fn run_until_blocked(&mut self) {
        loop {
            self.poll_tasks();
            if self.start_children() {
                continue;
            }
            match self.scheduler.next_activity() {
                Some(activity) => self.run_activity(activity).await,
                None => break,
            }
        }
    }

    /// Move the clock forward by `duration`, firing every timer due on the way
    pub async fn advance(&mut self, duration: Duration) {
        let target = self.scheduler.elapsed().saturating_add(duration);
        self.run_until_blocked().await;
        while let Some(action) = self.scheduler.pop_timer(Some(target)) {
            self.fire(action);
            self.run_until_blocked().await;
        }
        self.scheduler.advance_clock_to(target);
        self.run_until_blocked().await;
    }

    /// Drive the run, jumping the clock from timer to timer, until the root workflow finishes.
    /// Fails with [HostError::Deadlock] if the workflow is blocked and no timer could wake it.
    pub async fn run_until_done(&mut self) -> Result<Payload, HostError> {
        loop {
            self.run_until_blocked().await;
            if let Some(result) = self.result.get() {
                return result;
            }
            match self.scheduler.pop_timer(None) {
                Some(action) => self.fire(action),
                None => {
                    return Err(HostError::Deadlock(format!(
                        "workflow {} is blocked with no pending timers",
                        self.execution.workflow_id
                    )))
                }
            }
        }
    }

    /// [LocalRun::run_until_done], decoding the result
    pub async fn result_as<T: DeserializeOwned>(&mut self) -> Result<T, HostError> {
        let payload = self.run_until_done().await?;
        Ok(T::from_json_payload(&payload)?)
    }

    /// Deliver a signal to the root workflow. It is observed on the next drive.
    pub fn signal<T>(&self, signal_name: &str, value: &T) -> Result<(), HostError>
    where
        T: Serialize + ?Sized,
    {
        let payload = value.as_json_payload()?;
        self.deliver_signal(&self.execution.run_id, signal_name, payload)
    }

    /// Deliver a signal to the root workflow once the clock moved by `delay`
    pub fn signal_after<T>(&self, delay: Duration, signal_name: &str, value: &T) -> Result<(), HostError>
    where
        T: Serialize + ?Sized,
    {
        let payload = value.as_json_payload()?;
        self.scheduler.add_timer(
            delay,
            TimerAction::Signal {
                run_id: self.execution.run_id.clone(),
                name: signal_name.to_string(),
                payload,
            },
        );
        Ok(())
    }

    /// Request cancellation of the root workflow
    pub fn cancel(&self) {
        self.cancel_execution(&self.execution.run_id)
    }

    pub fn cancel_after(&self, delay: Duration) {
        self.scheduler.add_timer(
            delay,
            TimerAction::Cancel {
                run_id: self.execution.run_id.clone(),
            },
        );
    }

    /// Ask the root workflow's handler for `query_type`
    pub fn query(&self, query_type: &str, args: &[Payload]) -> Result<Payload, HostError> {
        let lookup = self
            .scheduler
            .with_execution(&self.execution.run_id, |e| {
                match e.query_handlers.get(query_type) {
                    Some(handler) => Ok(handler.clone()),
                    None => Err(e.query_handlers.keys().cloned().collect::<Vec<_>>()),
                }
            })
            .ok_or_else(|| HostError::WorkflowCompleted {
                workflow_id: self.execution.workflow_id.clone(),
            })?;
        match lookup {
            Ok(handler) => handler(args),
            Err(known) => Err(HostError::UnknownQuery {
                query_type: query_type.to_string(),
                known: known.display(),
            }),
        }
    }

    /// Poll every workflow task until a round makes no progress
    fn poll_tasks(&mut self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            let generation = self.scheduler.generation();
            self.scheduler.wake_parked();
            let mut i = 0;
            while i < self.tasks.len() {
                match self.tasks[i].fut.poll_unpin(&mut cx) {
                    Poll::Ready(outcome) => {
                        let task = self.tasks.remove(i);
                        self.complete(task, outcome);
                    }
                    Poll::Pending => i += 1,
                }
            }
            if self.scheduler.generation() == generation {
                break;
            }
        }
    }

    fn complete(&mut self, task: WorkflowTask, outcome: Result<Payload, HostError>) {
        let WorkflowTask { run_id, start, .. } = task;
        if let (Err(err), Some(start)) = (&outcome, &start) {
            if let Some(delay) = self.child_retry_delay(start, err) {
                self.schedule_child_retry(start.clone(), delay, err);
                return;
            }
        }
        let closed = self
            .scheduler
            .with_execution(&run_id, |e| {
                if e.status == ExecutionStatus::Closed {
                    return None;
                }
                e.status = ExecutionStatus::Closed;
                Some((
                    e.result.clone(),
                    e.token.clone(),
                    e.info.workflow_execution.workflow_id.clone(),
                ))
            })
            .flatten();
        let Some((result, token, workflow_id)) = closed else {
            return;
        };
        // Anything the execution left running goes down with it
        token.cancel();
        tracing::debug!(
            workflow_id = %workflow_id,
            run_id = %run_id,
            success = outcome.is_ok(),
            "Workflow execution closed"
        );
        let outcome = match outcome {
            Err(HostError::Canceled) => Err(HostError::Canceled),
            Err(e) if start.is_some() => Err(HostError::ChildWorkflowFailed {
                workflow_id,
                message: e.to_string(),
            }),
            other => other,
        };
        result.resolve(&self.scheduler, outcome);
    }

    fn child_retry_delay(&self, start: &ChildStart, err: &HostError) -> Option<Duration> {
        if err.is_canceled() || start.token.is_cancelled() || start.options.retry_policy.is_zero() {
            return None;
        }
        start
            .options
            .retry_policy
            .should_retry(start.attempt as usize, &err.to_string())
    }

    fn schedule_child_retry(&self, mut start: ChildStart, delay: Duration, err: &HostError) {
        start.attempt += 1;
        tracing::debug!(
            run_id = %start.run_id,
            attempt = start.attempt,
            delay = ?delay,
            error = %err,
            "Retrying child workflow"
        );
        let attempt = start.attempt;
        self.scheduler.with_execution(&start.run_id, |e| {
            e.status = ExecutionStatus::Scheduled;
            e.info.attempt = attempt;
        });
        self.scheduler
            .add_timer(delay, TimerAction::StartChild(start));
    }

    fn start_children(&mut self) -> bool {
        let mut started_any = false;
        while let Some(start) = self.scheduler.next_start() {
            started_any = true;
            self.start_child(start);
        }
        started_any
    }

    fn start_child(&mut self, mut start: ChildStart) {
        let scheduler = self.scheduler.clone();
        if scheduler.is_closed(&start.run_id) {
            return;
        }
        if start.token.is_cancelled() {
            let acks = scheduler
                .with_execution(&start.run_id, |e| {
                    e.status = ExecutionStatus::Closed;
                    std::mem::take(&mut e.pending_signal_acks)
                })
                .unwrap_or_default();
            for ack in acks {
                ack.resolve(&scheduler, Err(HostError::Canceled));
            }
            start.started.resolve(&scheduler, Err(HostError::Canceled));
            start.result.resolve(&scheduler, Err(HostError::Canceled));
            return;
        }

        let now = scheduler.elapsed();
        let start_time = scheduler.start_time() + now;
        let begun = scheduler.with_execution(&start.run_id, |e| {
            e.status = ExecutionStatus::Running;
            e.info.start_time = start_time;
            (
                std::mem::take(&mut e.pending_signal_acks),
                e.info.workflow_execution.clone(),
            )
        });
        let Some((acks, execution)) = begun else {
            return;
        };
        for ack in acks {
            ack.resolve(&scheduler, Ok(Payload::null()));
        }
        start.started.resolve(
            &scheduler,
            execution.as_json_payload().map_err(HostError::from),
        );
        if start.attempt == 1 {
            let timeout = match (
                start.options.workflow_execution_timeout,
                start.options.workflow_run_timeout,
            ) {
                (Some(exec), Some(run)) => Some(exec.min(run)),
                (exec, run) => exec.or(run),
            };
            if let Some(timeout) = timeout {
                scheduler.add_timer(
                    timeout,
                    TimerAction::ExecutionTimeout {
                        run_id: start.run_id.clone(),
                    },
                );
                start.deadline = Some(now.saturating_add(timeout));
            }
        }

        tracing::debug!(
            workflow_id = %execution.workflow_id,
            run_id = %execution.run_id,
            attempt = start.attempt,
            "Starting child workflow"
        );
        let ctx = LocalContext::root(
            scheduler.clone(),
            &start.run_id,
            start.token.clone(),
            start.deadline,
        );
        let fut = start
            .function
            .call(self.host.clone(), ctx, start.input.clone());
        self.tasks.push(WorkflowTask {
            run_id: start.run_id.clone(),
            fut,
            start: Some(start),
        });
    }

    async fn run_activity(&mut self, activity: PendingActivity) {
        let scheduler = self.scheduler.clone();
        if activity.ctx.is_cancelled() || scheduler.is_closed(activity.ctx.run_id()) {
            activity.cell.resolve(&scheduler, Err(HostError::Canceled));
            return;
        }
        let Some(function) = self.host.activity_function(&activity.activity_type) else {
            activity.cell.resolve(
                &scheduler,
                Err(HostError::ActivityFailed {
                    activity_type: activity.activity_type.clone(),
                    message: format!(
                        "activity type {} is not registered",
                        activity.activity_type
                    ),
                    error_type: None,
                    non_retryable: true,
                }),
            );
            return;
        };

        let info = self.host.info(&activity.ctx);
        let act_ctx = ActivityContext::new(
            ActivityInfo {
                activity_id: activity.activity_id.clone(),
                activity_type: activity.activity_type.clone(),
                task_queue: activity.task_queue.clone(),
                attempt: activity.attempt,
                workflow_execution: info.workflow_execution,
                workflow_type: info.workflow_type,
                start_to_close_timeout: activity.options.start_to_close_timeout,
                heartbeat_timeout: activity.options.heartbeat_timeout,
            },
            activity.ctx.token().clone(),
        );
        let (timeout, kind) = attempt_timeout(&activity, scheduler.elapsed());
        tracing::debug!(
            activity_type = %activity.activity_type,
            activity_id = %activity.activity_id,
            attempt = activity.attempt,
            "Running local activity"
        );
        let outcome =
            tokio::time::timeout(timeout, function.call(act_ctx, activity.args.clone())).await;

        let activity_type = activity.activity_type.clone();
        match outcome {
            Ok(Ok(payload)) => {
                activity.cell.resolve(&scheduler, Ok(payload));
            }
            Ok(Err(ActivityError::Cancelled)) => {
                activity.cell.resolve(&scheduler, Err(HostError::Canceled));
            }
            Ok(Err(ActivityError::NonRetryable(e))) => {
                activity.cell.resolve(
                    &scheduler,
                    Err(HostError::ActivityFailed {
                        activity_type,
                        message: format!("{:#}", e),
                        error_type: None,
                        non_retryable: true,
                    }),
                );
            }
            Ok(Err(ActivityError::Retryable { source, error_type })) => {
                let message = format!("{:#}", source);
                let matched = error_type.clone().unwrap_or_else(|| message.clone());
                let failure = HostError::ActivityFailed {
                    activity_type,
                    message,
                    error_type,
                    non_retryable: false,
                };
                self.retry_or_fail(activity, failure, &matched);
            }
            Err(_elapsed) if kind == TimeoutKind::StartToClose => {
                let failure = HostError::ActivityTimeout {
                    activity_type,
                    kind,
                };
                let matched = failure.to_string();
                self.retry_or_fail(activity, failure, &matched);
            }
            Err(_elapsed) => {
                activity.cell.resolve(
                    &scheduler,
                    Err(HostError::ActivityTimeout {
                        activity_type,
                        kind,
                    }),
                );
            }
        }
    }

    fn retry_or_fail(&self, activity: PendingActivity, failure: HostError, matched: &str) {
        let policy = if activity.options.retry_policy.is_zero() {
            &self.host.options().default_activity_retry_policy
        } else {
            &activity.options.retry_policy
        };
        let delay = if activity.ctx.is_cancelled() {
            None
        } else {
            policy.should_retry(activity.attempt as usize, matched)
        };
        let Some(delay) = delay else {
            activity.cell.resolve(&self.scheduler, Err(failure));
            return;
        };
        if let Some(limit) = activity.options.schedule_to_close_timeout {
            let waited = self
                .scheduler
                .elapsed()
                .saturating_add(delay)
                .saturating_sub(activity.scheduled_at);
            if waited >= limit {
                activity.cell.resolve(
                    &self.scheduler,
                    Err(HostError::ActivityTimeout {
                        activity_type: activity.activity_type.clone(),
                        kind: TimeoutKind::ScheduleToClose,
                    }),
                );
                return;
            }
        }
        tracing::debug!(
            activity_type = %activity.activity_type,
            attempt = activity.attempt,
            delay = ?delay,
            error = %failure,
            "Retrying activity"
        );
        let next = PendingActivity {
            attempt: activity.attempt + 1,
            ..activity
        };
        self.scheduler
            .add_timer(delay, TimerAction::RetryActivity(next));
    }

    fn fire(&mut self, action: TimerAction) {
        match action {
            TimerAction::Fire(flag) => {
                flag.store(true, Ordering::SeqCst);
                self.scheduler.bump();
            }
            TimerAction::RetryActivity(activity) => self.scheduler.enqueue_activity(activity),
            TimerAction::StartChild(start) => self.scheduler.enqueue_start(start),
            TimerAction::Signal {
                run_id,
                name,
                payload,
            } => {
                if let Err(e) = self.deliver_signal(&run_id, &name, payload) {
                    tracing::warn!(signal = %name, error = %e, "Dropping delayed signal");
                }
            }
            TimerAction::Cancel { run_id } => self.cancel_execution(&run_id),
            TimerAction::ExecutionTimeout { run_id } => self.time_out(&run_id),
        }
    }

    fn deliver_signal(&self, run_id: &str, name: &str, payload: Payload) -> Result<(), HostError> {
        if self.scheduler.is_closed(run_id) {
            return Err(HostError::WorkflowCompleted {
                workflow_id: self.execution.workflow_id.clone(),
            });
        }
        if let Some(chan) = self.scheduler.signal_channel(run_id, name) {
            chan.deliver(payload);
        }
        Ok(())
    }

    fn cancel_execution(&self, run_id: &str) {
        if let Some(token) = self.scheduler.with_execution(run_id, |e| e.token.clone()) {
            token.cancel();
            self.scheduler.bump();
        }
    }

    fn time_out(&mut self, run_id: &str) {
        let closed = self
            .scheduler
            .with_execution(run_id, |e| {
                if e.status == ExecutionStatus::Closed {
                    return None;
                }
                e.status = ExecutionStatus::Closed;
                Some((
                    e.result.clone(),
                    e.token.clone(),
                    e.info.workflow_execution.workflow_id.clone(),
                ))
            })
            .flatten();
        let Some((result, token, workflow_id)) = closed else {
            return;
        };
        tracing::debug!(workflow_id = %workflow_id, run_id = %run_id, "Workflow execution timed out");
        self.tasks.retain(|t| t.run_id != run_id);
        token.cancel();
        result.resolve(
            &self.scheduler,
            Err(HostError::WorkflowTimedOut { workflow_id }),
        );
    }
}

/// Real-time bound of one attempt, and which timeout it enforces
fn attempt_timeout(activity: &PendingActivity, now: Duration) -> (Duration, TimeoutKind) {
    let remaining = activity
        .options
        .schedule_to_close_timeout
        .map(|limit| limit.saturating_sub(now.saturating_sub(activity.scheduled_at)));
    match (activity.options.start_to_close_timeout, remaining) {
        (Some(stc), Some(rem)) if rem < stc => (rem, TimeoutKind::ScheduleToClose),
        (Some(stc), _) => (stc, TimeoutKind::StartToClose),
        (None, Some(rem)) => (rem, TimeoutKind::ScheduleToClose),
        // Both absent is refused when the activity is scheduled
        (None, None) => (Duration::MAX, TimeoutKind::StartToClose),
    }
}

impl fmt::Debug for LocalRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRun")
            .field("execution", &self.execution)
            .field("elapsed", &self.scheduler.elapsed())
            .field("running_tasks", &self.tasks.len())
            .field("done", &self.is_done())
            .finish()
    }
}

impl Drop for LocalRun {
    fn drop(&mut self) {
        // Futures of unfinished executions hold contexts that point back at the scheduler
        self.tasks.clear();
        self.scheduler.shutdown();
    }
}
