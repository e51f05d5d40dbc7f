//! Option structures in the shape a host runtime consumes them

use crate::payload::Payload;
use std::{collections::BTreeMap, time::Duration};

/// Retry policy as the host sees it. The zero value (`Default`) means "use the host's default
/// policy".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeRetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: i32,
    pub non_retryable_error_types: Vec<String>,
}

impl NativeRetryPolicy {
    pub fn is_zero(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeActivityOptions {
    pub task_queue: Option<String>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub wait_for_cancellation: Option<bool>,
    pub activity_id: Option<String>,
    pub retry_policy: NativeRetryPolicy,
    pub disable_eager_execution: Option<bool>,
}

impl NativeActivityOptions {
    /// Layer `self` over `parent`: fields set here win, unset fields come from `parent`. A zero
    /// retry policy counts as unset.
    pub fn merged_over(&self, parent: &NativeActivityOptions) -> NativeActivityOptions {
        NativeActivityOptions {
            task_queue: self.task_queue.clone().or_else(|| parent.task_queue.clone()),
            schedule_to_close_timeout: self
                .schedule_to_close_timeout
                .or(parent.schedule_to_close_timeout),
            schedule_to_start_timeout: self
                .schedule_to_start_timeout
                .or(parent.schedule_to_start_timeout),
            start_to_close_timeout: self.start_to_close_timeout.or(parent.start_to_close_timeout),
            heartbeat_timeout: self.heartbeat_timeout.or(parent.heartbeat_timeout),
            wait_for_cancellation: self.wait_for_cancellation.or(parent.wait_for_cancellation),
            activity_id: self.activity_id.clone().or_else(|| parent.activity_id.clone()),
            retry_policy: if self.retry_policy.is_zero() {
                parent.retry_policy.clone()
            } else {
                self.retry_policy.clone()
            },
            disable_eager_execution: self
                .disable_eager_execution
                .or(parent.disable_eager_execution),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeChildWorkflowOptions {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: Option<String>,
    pub workflow_execution_timeout: Option<Duration>,
    pub workflow_run_timeout: Option<Duration>,
    pub workflow_task_timeout: Option<Duration>,
    pub retry_policy: NativeRetryPolicy,
    pub cron_schedule: Option<String>,
    pub memo: BTreeMap<String, Payload>,
    pub start_delay: Option<Duration>,
}
