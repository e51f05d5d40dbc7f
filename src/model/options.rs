use crate::{errors::ConversionError, payload::Payload};
use std::{collections::BTreeMap, time::Duration};

/// Options for scheduling an activity. Every field is optional: when applied to a context with
/// [crate::model::WorkflowEngine::with_activity_options], set fields override the context's
/// current options and unset fields are inherited from it.
#[derive(Default, Debug, Clone, PartialEq, derive_builder::Builder)]
#[builder(setter(into, strip_option), default)]
pub struct ActivityOptions {
    /// Task queue to schedule the activity in. Unset means the workflow's task queue.
    pub task_queue: Option<String>,
    /// Total time that a workflow is willing to wait for the activity to complete, retries
    /// included. Either this or `start_to_close_timeout` is required.
    pub schedule_to_close_timeout: Option<Duration>,
    /// Time the activity task can stay in the task queue before a worker picks it up
    pub schedule_to_start_timeout: Option<Duration>,
    /// Maximum time of a single attempt
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    /// Whether cancellation of the activity waits for the activity to acknowledge it
    pub wait_for_cancellation: Option<bool>,
    /// Identifier of the activity in workflow history. Unset means the execution's sequence
    /// number.
    pub activity_id: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub disable_eager_execution: Option<bool>,
}

/// How a host retries a failed activity or child workflow. Backoff grows from
/// `initial_interval` by `backoff_coefficient` per attempt, capped at `maximum_interval`.
/// `maximum_attempts` of zero means unlimited.
#[derive(Default, Debug, Clone, PartialEq, derive_builder::Builder)]
#[builder(setter(into), default)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: i32,
    /// Errors whose type matches one of these are never retried
    pub non_retryable_error_types: Vec<String>,
}

impl RetryPolicy {
    /// Reject policies the host could not honour. Zero values mean "host default" and are
    /// always accepted.
    pub fn validate(&self) -> Result<(), ConversionError> {
        if !self.backoff_coefficient.is_finite() {
            return Err(ConversionError::InvalidRetryPolicy(format!(
                "backoff coefficient {} is not a finite number",
                self.backoff_coefficient
            )));
        }
        if self.backoff_coefficient != 0.0 && self.backoff_coefficient < 1.0 {
            return Err(ConversionError::InvalidRetryPolicy(format!(
                "backoff coefficient {} is below 1",
                self.backoff_coefficient
            )));
        }
        if !self.maximum_interval.is_zero() && self.maximum_interval < self.initial_interval {
            return Err(ConversionError::InvalidRetryPolicy(format!(
                "maximum interval {:?} is shorter than initial interval {:?}",
                self.maximum_interval, self.initial_interval
            )));
        }
        if self.maximum_attempts < 0 {
            return Err(ConversionError::InvalidRetryPolicy(format!(
                "maximum attempts {} is negative",
                self.maximum_attempts
            )));
        }
        Ok(())
    }
}

/// Options for starting a child workflow
#[derive(Default, Debug, Clone, PartialEq, derive_builder::Builder)]
#[builder(setter(into), default)]
pub struct ChildWorkflowOptions {
    /// Task queue for the child. Unset means the parent's task queue.
    #[builder(setter(into, strip_option))]
    pub task_queue: Option<String>,
    /// Total time the child may run, including retries and continue-as-new
    #[builder(setter(into, strip_option))]
    pub workflow_execution_timeout: Option<Duration>,
    /// Time a single run of the child may take
    #[builder(setter(into, strip_option))]
    pub workflow_run_timeout: Option<Duration>,
    #[builder(setter(into, strip_option))]
    pub workflow_task_timeout: Option<Duration>,
    #[builder(setter(into, strip_option))]
    pub retry_policy: Option<RetryPolicy>,
    #[builder(setter(into, strip_option))]
    pub cron_schedule: Option<String>,
    pub memo: BTreeMap<String, Payload>,
    /// Delay before the child's first run is dispatched
    #[builder(setter(into, strip_option))]
    pub start_delay: Option<Duration>,
}

impl ChildWorkflowOptions {
    pub fn validate(&self) -> Result<(), ConversionError> {
        if let Some(rp) = &self.retry_policy {
            rp.validate()?;
        }
        if let (Some(run), Some(exec)) = (
            self.workflow_run_timeout,
            self.workflow_execution_timeout,
        ) {
            if run > exec {
                return Err(ConversionError::InvalidChildWorkflowOptions(format!(
                    "run timeout {:?} exceeds execution timeout {:?}",
                    run, exec
                )));
            }
        }
        if self.start_delay.is_some() && self.cron_schedule.is_some() {
            return Err(ConversionError::InvalidChildWorkflowOptions(
                "start delay cannot be combined with a cron schedule".to_string(),
            ));
        }
        if let Some(cron) = &self.cron_schedule {
            validate_cron_shape(cron)?;
        }
        Ok(())
    }
}

/// Only the shape is checked: five whitespace separated fields, or an `@` descriptor
fn validate_cron_shape(cron: &str) -> Result<(), ConversionError> {
    let cron = cron.trim();
    if cron.starts_with('@') && cron.len() > 1 {
        return Ok(());
    }
    let fields = cron.split_whitespace().count();
    if fields != 5 {
        return Err(ConversionError::InvalidChildWorkflowOptions(format!(
            "cron schedule {:?} has {} fields, expected 5",
            cron, fields
        )));
    }
    Ok(())
}
