use super::{scheduler::Scheduler, LocalChannel};
use crate::{
    errors::HostError,
    host::{NativeActivityOptions, NativeContext},
    model::ContextValue,
};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;

/// Context of one execution inside a local run. Cloning is cheap; deriving produces a new
/// context and leaves this one untouched.
#[derive(Clone)]
pub struct LocalContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    scheduler: Arc<Scheduler>,
    run_id: String,
    token: CancellationToken,
    /// Offset from the run's start time
    deadline: Option<Duration>,
    values: BTreeMap<String, ContextValue>,
    activity_options: NativeActivityOptions,
}

impl LocalContext {
    pub(crate) fn root(
        scheduler: Arc<Scheduler>,
        run_id: impl Into<String>,
        token: CancellationToken,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                scheduler,
                run_id: run_id.into(),
                token,
                deadline,
                values: BTreeMap::new(),
                activity_options: NativeActivityOptions::default(),
            }),
        }
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    fn derive(
        &self,
        token: CancellationToken,
        values: BTreeMap<String, ContextValue>,
        activity_options: NativeActivityOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                scheduler: self.inner.scheduler.clone(),
                run_id: self.inner.run_id.clone(),
                token,
                deadline: self.inner.deadline,
                values,
                activity_options,
            }),
        }
    }

    pub(crate) fn with_activity_options(&self, options: NativeActivityOptions) -> Self {
        self.derive(
            self.inner.token.clone(),
            self.inner.values.clone(),
            options.merged_over(&self.inner.activity_options),
        )
    }

    pub(crate) fn with_value(&self, key: &str, value: ContextValue) -> Self {
        let mut values = self.inner.values.clone();
        values.insert(key.to_string(), value);
        self.derive(
            self.inner.token.clone(),
            values,
            self.inner.activity_options.clone(),
        )
    }

    /// A context canceled with this one, that may also be canceled on its own
    pub(crate) fn with_child_token(&self) -> Self {
        self.derive(
            self.inner.token.child_token(),
            self.inner.values.clone(),
            self.inner.activity_options.clone(),
        )
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .map_or(false, |d| self.inner.scheduler.elapsed() >= d)
    }
}

impl NativeContext for LocalContext {
    type Channel = LocalChannel;

    fn execution_id(&self) -> &str {
        &self.inner.run_id
    }

    fn deadline(&self) -> Option<SystemTime> {
        self.inner
            .deadline
            .map(|d| self.inner.scheduler.start_time() + d)
    }

    fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    fn err(&self) -> Option<HostError> {
        if self.deadline_passed() {
            Some(HostError::DeadlineExceeded)
        } else if self.inner.token.is_cancelled() {
            Some(HostError::Canceled)
        } else {
            None
        }
    }

    fn value(&self, key: &str) -> Option<ContextValue> {
        self.inner.values.get(key).cloned()
    }

    fn done(&self) -> LocalChannel {
        LocalChannel::done(
            self.inner.scheduler.clone(),
            &self.inner.run_id,
            self.inner.token.clone(),
        )
    }

    fn activity_options(&self) -> &NativeActivityOptions {
        &self.inner.activity_options
    }
}

impl fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalContext")
            .field("run_id", &self.inner.run_id)
            .field("cancelled", &self.inner.token.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .field("activity_options", &self.inner.activity_options)
            .finish()
    }
}
