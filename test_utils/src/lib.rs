//! Shared helpers for integration tests: a run starter, option presets, canned activities and
//! a logger that remembers what it was asked to log.

use parking_lot::Mutex;
use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use temporal_loom::{
    local::{
        arg, ActivityContext, ActivityError, ActivityFunction, LocalEngine, LocalHost,
        LocalHostOptionsBuilder, LocalRun, LocalWfContext, StartWorkflowOptionsBuilder,
    },
    telemetry::{KeyValLogger, Level},
    ActivityOptions, ActivityOptionsBuilder, RetryPolicy, RetryPolicyBuilder, WorkflowError,
};

pub const NAMESPACE: &str = "default";
pub const TEST_Q: &str = "q";

/// Activity options presets suitable for tests: a generous start to close timeout and a retry
/// policy that backs off by one second
pub fn activity_opts() -> ActivityOptions {
    ActivityOptionsBuilder::default()
        .start_to_close_timeout(Duration::from_secs(10))
        .retry_policy(fast_retry_policy(5))
        .build()
        .expect("activity options are valid")
}

pub fn fast_retry_policy(maximum_attempts: i32) -> RetryPolicy {
    RetryPolicyBuilder::default()
        .initial_interval(Duration::from_secs(1))
        .backoff_coefficient(1.0)
        .maximum_interval(Duration::from_secs(1))
        .maximum_attempts(maximum_attempts)
        .build()
        .expect("retry policy is valid")
}

/// Helps integ tests set up a host and start workflows on it. The test name becomes the
/// workflow id of started runs.
pub struct LocalWfStarter {
    test_name: String,
    host: LocalHost,
}

impl LocalWfStarter {
    pub fn new(test_name: &str) -> Self {
        let options = LocalHostOptionsBuilder::default()
            .namespace(NAMESPACE)
            .task_queue(TEST_Q)
            .log_level(Level::Debug)
            .build()
            .expect("host options are valid");
        Self {
            test_name: test_name.to_string(),
            host: LocalHost::new(options),
        }
    }

    pub fn host(&self) -> &LocalHost {
        &self.host
    }

    /// Register a workflow under the test name
    pub fn register_wf<F, Fut, I, O>(&self, function: F) -> &Self
    where
        F: Fn(LocalEngine, LocalWfContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, WorkflowError>> + Send + 'static,
        I: serde::de::DeserializeOwned + 'static,
        O: serde::Serialize + 'static,
    {
        self.host.register_workflow(&self.test_name, function);
        self
    }

    pub fn register_activity(&self, name: &str, function: impl Into<ActivityFunction>) -> &Self {
        self.host.register_activity(name, function);
        self
    }

    /// Start the workflow registered under the test name
    pub fn start<I: serde::Serialize + ?Sized>(&self, input: &I) -> LocalRun {
        self.start_with(None, input)
    }

    pub fn start_with<I: serde::Serialize + ?Sized>(
        &self,
        execution_timeout: Option<Duration>,
        input: &I,
    ) -> LocalRun {
        let mut options = StartWorkflowOptionsBuilder::default();
        options
            .workflow_id(self.test_name.as_str())
            .workflow_type(self.test_name.as_str());
        if let Some(timeout) = execution_timeout {
            options.execution_timeout(timeout);
        }
        let options = options.build().expect("start options are valid");
        self.host
            .start_workflow(options, input)
            .expect("workflow is registered")
    }
}

/// Activity returning its first argument unchanged
pub fn echo_activity() -> ActivityFunction {
    ActivityFunction::new(|_ctx: ActivityContext, args| async move {
        arg::<serde_json::Value>(&args, 0)
    })
}

/// Activity that counts its invocations and returns the count
pub fn counting_activity(calls: Arc<AtomicUsize>) -> ActivityFunction {
    ActivityFunction::new(move |_ctx: ActivityContext, _args| {
        let calls = calls.clone();
        async move { Ok::<_, ActivityError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
    })
}

/// Activity that fails with a retryable error `failures` times, then returns the attempt number
/// it succeeded on
pub fn flaky_activity(failures: usize, calls: Arc<AtomicUsize>) -> ActivityFunction {
    ActivityFunction::new(move |ctx: ActivityContext, _args| {
        let calls = calls.clone();
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                return Err(ActivityError::from(anyhow::anyhow!("flaky failure {}", call)));
            }
            Ok(ctx.info().attempt)
        }
    })
}

/// Activity that always fails with a retryable error of type `error_type`
pub fn failing_activity(error_type: &'static str, calls: Arc<AtomicUsize>) -> ActivityFunction {
    ActivityFunction::new(move |_ctx: ActivityContext, _args| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ActivityError::retryable_with_type(
                anyhow::anyhow!("always fails"),
                error_type,
            ))
        }
    })
}

/// Activity that sleeps for `delay` of real time before returning
pub fn slow_activity(delay: Duration) -> ActivityFunction {
    ActivityFunction::new(move |_ctx: ActivityContext, _args| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, ActivityError>("done")
    })
}

/// One captured log call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub msg: String,
    pub keyvals: Vec<(String, String)>,
}

/// A [KeyValLogger] that records every call instead of emitting it
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    fn record(&self, level: Level, msg: &str, keyvals: &[(&str, &dyn Display)]) {
        self.records.lock().push(LogRecord {
            level,
            msg: msg.to_string(),
            keyvals: keyvals
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }
}

impl KeyValLogger for RecordingLogger {
    fn debug(&self, msg: &str, keyvals: &[(&str, &dyn Display)]) {
        self.record(Level::Debug, msg, keyvals)
    }

    fn info(&self, msg: &str, keyvals: &[(&str, &dyn Display)]) {
        self.record(Level::Info, msg, keyvals)
    }

    fn warn(&self, msg: &str, keyvals: &[(&str, &dyn Display)]) {
        self.record(Level::Warn, msg, keyvals)
    }

    fn error(&self, msg: &str, keyvals: &[(&str, &dyn Display)]) {
        self.record(Level::Error, msg, keyvals)
    }
}
