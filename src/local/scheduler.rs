//! Shared state of one local run: the virtual clock, timers, queued activities and children,
//! and every execution started by the run.

use super::{ChildStart, LocalChannel, PendingActivity};
use crate::{
    errors::HostError,
    host::QueryHandler,
    model::WorkflowInfo,
    payload::Payload,
    telemetry::{Level, TracingLogger},
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::Waker,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;

/// Orders timers by fire time, then by creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) at: Duration,
    pub(crate) seq: u64,
}

pub(crate) enum TimerAction {
    Fire(Arc<AtomicBool>),
    RetryActivity(PendingActivity),
    StartChild(ChildStart),
    Signal {
        run_id: String,
        name: String,
        payload: Payload,
    },
    Cancel {
        run_id: String,
    },
    ExecutionTimeout {
        run_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionStatus {
    Scheduled,
    Running,
    Closed,
}

/// Single-assignment result slot behind every local future
#[derive(Debug, Default)]
pub(crate) struct ResultCell {
    value: Mutex<Option<Result<Payload, HostError>>>,
}

impl ResultCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores the outcome unless one is already stored. Returns whether this call stored it.
    pub(crate) fn resolve(&self, scheduler: &Scheduler, result: Result<Payload, HostError>) -> bool {
        let mut value = self.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(result);
        drop(value);
        scheduler.bump();
        true
    }

    pub(crate) fn get(&self) -> Option<Result<Payload, HostError>> {
        self.value.lock().clone()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.value.lock().is_some()
    }
}

pub(crate) struct ExecutionState {
    pub(crate) info: WorkflowInfo,
    pub(crate) token: CancellationToken,
    pub(crate) status: ExecutionStatus,
    pub(crate) signal_channels: BTreeMap<String, LocalChannel>,
    pub(crate) query_handlers: BTreeMap<String, QueryHandler>,
    pub(crate) activity_seq: u64,
    pub(crate) result: Arc<ResultCell>,
    pub(crate) started: Arc<ResultCell>,
    /// Signals sent before the execution started, acknowledged once it does
    pub(crate) pending_signal_acks: Vec<Arc<ResultCell>>,
}

impl ExecutionState {
    pub(crate) fn new(
        info: WorkflowInfo,
        token: CancellationToken,
        status: ExecutionStatus,
        result: Arc<ResultCell>,
        started: Arc<ResultCell>,
    ) -> Self {
        Self {
            info,
            token,
            status,
            signal_channels: BTreeMap::new(),
            query_handlers: BTreeMap::new(),
            activity_seq: 0,
            result,
            started,
            pending_signal_acks: vec![],
        }
    }
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) now: Duration,
    pub(crate) timers: BTreeMap<TimerKey, TimerAction>,
    pub(crate) activities: VecDeque<PendingActivity>,
    pub(crate) starts: VecDeque<ChildStart>,
    pub(crate) executions: BTreeMap<String, ExecutionState>,
    /// Workflow id to the run id of its latest run
    pub(crate) runs_by_workflow_id: BTreeMap<String, String>,
}

pub(crate) struct Scheduler {
    start_time: SystemTime,
    generation: AtomicU64,
    seq: AtomicU64,
    parked: Mutex<Vec<Waker>>,
    /// Base of every workflow logger in this run. Its level is shared by the run only.
    logger: OnceCell<TracingLogger>,
    pub(crate) state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub(crate) fn new(start_time: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            start_time,
            generation: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            parked: Mutex::new(vec![]),
            logger: OnceCell::new(),
            state: Mutex::new(SchedulerState::default()),
        })
    }

    /// Record that something a waiting future may care about changed
    pub(crate) fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remember the waker of a pending future so that it is woken before the next poll round
    pub(crate) fn park(&self, waker: &Waker) {
        self.parked.lock().push(waker.clone());
    }

    pub(crate) fn wake_parked(&self) {
        let wakers = std::mem::take(&mut *self.parked.lock());
        for w in wakers {
            w.wake();
        }
    }

    pub(crate) fn logger(&self, level: Level) -> &TracingLogger {
        self.logger.get_or_init(|| TracingLogger::new(level))
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.state.lock().now
    }

    pub(crate) fn now(&self) -> SystemTime {
        self.start_time + self.elapsed()
    }

    pub(crate) fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub(crate) fn add_timer(&self, after: Duration, action: TimerAction) -> TimerKey {
        let seq = self.next_seq();
        let mut state = self.state.lock();
        let key = TimerKey {
            at: state.now.saturating_add(after),
            seq,
        };
        state.timers.insert(key, action);
        drop(state);
        self.bump();
        key
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.state.lock().timers.remove(&key);
    }

    /// Remove the earliest timer if it fires no later than `limit`, moving the clock to it
    pub(crate) fn pop_timer(&self, limit: Option<Duration>) -> Option<TimerAction> {
        let mut state = self.state.lock();
        let key = *state.timers.keys().next()?;
        if limit.map_or(false, |l| key.at > l) {
            return None;
        }
        let action = state.timers.remove(&key)?;
        if key.at > state.now {
            state.now = key.at;
        }
        Some(action)
    }

    pub(crate) fn advance_clock_to(&self, at: Duration) {
        let mut state = self.state.lock();
        if at > state.now {
            state.now = at;
        }
    }

    pub(crate) fn enqueue_activity(&self, activity: PendingActivity) {
        self.state.lock().activities.push_back(activity);
        self.bump();
    }

    pub(crate) fn next_activity(&self) -> Option<PendingActivity> {
        self.state.lock().activities.pop_front()
    }

    pub(crate) fn enqueue_start(&self, start: ChildStart) {
        self.state.lock().starts.push_back(start);
        self.bump();
    }

    pub(crate) fn next_start(&self) -> Option<ChildStart> {
        self.state.lock().starts.pop_front()
    }

    /// Run `f` against the state of execution `run_id`, if it exists
    pub(crate) fn with_execution<R>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut ExecutionState) -> R,
    ) -> Option<R> {
        self.state.lock().executions.get_mut(run_id).map(f)
    }

    pub(crate) fn is_closed(&self, run_id: &str) -> bool {
        self.with_execution(run_id, |e| e.status == ExecutionStatus::Closed)
            .unwrap_or(true)
    }

    /// Signal channel of an execution, created on first use
    pub(crate) fn signal_channel(
        self: &Arc<Self>,
        run_id: &str,
        name: &str,
    ) -> Option<LocalChannel> {
        let mut state = self.state.lock();
        let exec = state.executions.get_mut(run_id)?;
        let chan = exec
            .signal_channels
            .entry(name.to_string())
            .or_insert_with(|| LocalChannel::unbounded(self.clone(), run_id, name));
        Some(chan.clone())
    }

    /// Drop everything the run still holds. Pending timers and queued work keep contexts alive,
    /// and contexts point back at the scheduler.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.timers.clear();
        state.activities.clear();
        state.starts.clear();
        for exec in state.executions.values_mut() {
            exec.signal_channels.clear();
            exec.query_handlers.clear();
        }
        drop(state);
        self.parked.lock().clear();
    }
}
