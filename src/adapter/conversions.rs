//! Field-for-field translation of option records into their native form

use crate::{
    host::{NativeActivityOptions, NativeChildWorkflowOptions, NativeRetryPolicy},
    model::{ActivityOptions, ChildWorkflowOptions, RetryPolicy},
};

impl From<&RetryPolicy> for NativeRetryPolicy {
    fn from(rp: &RetryPolicy) -> Self {
        NativeRetryPolicy {
            initial_interval: rp.initial_interval,
            backoff_coefficient: rp.backoff_coefficient,
            maximum_interval: rp.maximum_interval,
            maximum_attempts: rp.maximum_attempts,
            non_retryable_error_types: rp.non_retryable_error_types.clone(),
        }
    }
}

impl From<&NativeRetryPolicy> for RetryPolicy {
    fn from(rp: &NativeRetryPolicy) -> Self {
        RetryPolicy {
            initial_interval: rp.initial_interval,
            backoff_coefficient: rp.backoff_coefficient,
            maximum_interval: rp.maximum_interval,
            maximum_attempts: rp.maximum_attempts,
            non_retryable_error_types: rp.non_retryable_error_types.clone(),
        }
    }
}

/// An absent policy becomes the native zero value, which the host treats as its default
pub fn to_native_retry_policy(rp: Option<&RetryPolicy>) -> NativeRetryPolicy {
    rp.map(Into::into).unwrap_or_default()
}

impl From<&ActivityOptions> for NativeActivityOptions {
    fn from(o: &ActivityOptions) -> Self {
        NativeActivityOptions {
            task_queue: o.task_queue.clone(),
            schedule_to_close_timeout: o.schedule_to_close_timeout,
            schedule_to_start_timeout: o.schedule_to_start_timeout,
            start_to_close_timeout: o.start_to_close_timeout,
            heartbeat_timeout: o.heartbeat_timeout,
            wait_for_cancellation: o.wait_for_cancellation,
            activity_id: o.activity_id.clone(),
            retry_policy: to_native_retry_policy(o.retry_policy.as_ref()),
            disable_eager_execution: o.disable_eager_execution,
        }
    }
}

pub fn to_native_child_options(
    o: &ChildWorkflowOptions,
    workflow_id: String,
    workflow_type: String,
) -> NativeChildWorkflowOptions {
    NativeChildWorkflowOptions {
        workflow_id,
        workflow_type,
        task_queue: o.task_queue.clone(),
        workflow_execution_timeout: o.workflow_execution_timeout,
        workflow_run_timeout: o.workflow_run_timeout,
        workflow_task_timeout: o.workflow_task_timeout,
        retry_policy: to_native_retry_policy(o.retry_policy.as_ref()),
        cron_schedule: o.cron_schedule.clone(),
        memo: o.memo.clone(),
        start_delay: o.start_delay,
    }
}
