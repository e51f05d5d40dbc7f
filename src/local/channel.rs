use super::{
    scheduler::{Scheduler, TimerAction, TimerKey},
    LocalContext,
};
use crate::{
    errors::HostError,
    host::{NativeChannel, NativeContext},
    payload::Payload,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Channel inside a local run. Every handle cloned from one channel shares its queue.
#[derive(Clone)]
pub struct LocalChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    run_id: String,
    scheduler: Arc<Scheduler>,
    /// Set for context done channels, which read as closed once the token is canceled
    closed_by: Option<CancellationToken>,
    core: Mutex<ChannelCore>,
}

/// Sender id for a value returned by a receiver that gave up. No send future waits on it.
const ORPHAN_SENDER: u64 = 0;

#[derive(Default)]
struct ChannelCore {
    capacity: usize,
    buffer: VecDeque<Payload>,
    /// Senders waiting for room, in arrival order
    blocked_senders: VecDeque<(u64, Payload)>,
    /// Blocked senders whose value was taken but who have not observed it yet
    delivered: BTreeSet<u64>,
    /// Receivers waiting for a value, in arrival order
    waiting_receivers: VecDeque<u64>,
    /// Values handed straight to a waiting receiver
    handoffs: BTreeMap<u64, Payload>,
    closed: bool,
    next_id: u64,
}

impl ChannelCore {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Accept a value without blocking, or hand it back
    fn offer(&mut self, value: Payload) -> Result<(), Payload> {
        if self.buffer.len() < self.capacity {
            self.buffer.push_back(value);
            return Ok(());
        }
        if let Some(rid) = self.waiting_receivers.pop_front() {
            self.handoffs.insert(rid, value);
            return Ok(());
        }
        Err(value)
    }

    fn take_next(&mut self) -> Option<Payload> {
        if let Some(v) = self.buffer.pop_front() {
            if let Some((sid, p)) = self.blocked_senders.pop_front() {
                self.buffer.push_back(p);
                self.mark_delivered(sid);
            }
            return Some(v);
        }
        if let Some((sid, p)) = self.blocked_senders.pop_front() {
            self.mark_delivered(sid);
            return Some(p);
        }
        None
    }

    fn mark_delivered(&mut self, sid: u64) {
        if sid != ORPHAN_SENDER {
            self.delivered.insert(sid);
        }
    }

    /// Take a value for the waiting receiver `rid`, preferring one handed to it directly
    fn take_for(&mut self, rid: u64) -> Option<Payload> {
        let v = self.handoffs.remove(&rid).or_else(|| self.take_next())?;
        self.waiting_receivers.retain(|id| *id != rid);
        Some(v)
    }

    fn wait(&mut self) -> u64 {
        let rid = self.next_id();
        self.waiting_receivers.push_back(rid);
        rid
    }

    /// Give up waiting. A value already handed to `rid` moves on to the next waiting receiver,
    /// or queues ahead of the blocked senders. It never grows the buffer past capacity.
    fn stop_waiting(&mut self, rid: u64) -> bool {
        self.waiting_receivers.retain(|id| *id != rid);
        let Some(v) = self.handoffs.remove(&rid) else {
            return false;
        };
        if let Some(next) = self.waiting_receivers.pop_front() {
            self.handoffs.insert(next, v);
        } else if self.buffer.len() < self.capacity {
            self.buffer.push_back(v);
        } else {
            self.blocked_senders.push_front((ORPHAN_SENDER, v));
        }
        true
    }

    fn block_sender(&mut self, value: Payload) -> u64 {
        let sid = self.next_id();
        self.blocked_senders.push_back((sid, value));
        sid
    }

    fn withdraw_sender(&mut self, sid: u64) {
        self.blocked_senders.retain(|(id, _)| *id != sid);
        self.delivered.remove(&sid);
    }

    fn has_values(&self) -> bool {
        !self.buffer.is_empty() || !self.blocked_senders.is_empty()
    }
}

impl LocalChannel {
    pub(crate) fn new(scheduler: Arc<Scheduler>, run_id: &str, name: &str, capacity: usize) -> Self {
        Self::build(scheduler, run_id, name, capacity, None)
    }

    pub(crate) fn unbounded(scheduler: Arc<Scheduler>, run_id: &str, name: &str) -> Self {
        Self::build(scheduler, run_id, name, usize::MAX, None)
    }

    pub(crate) fn done(scheduler: Arc<Scheduler>, run_id: &str, token: CancellationToken) -> Self {
        Self::build(scheduler, run_id, "done", 0, Some(token))
    }

    fn build(
        scheduler: Arc<Scheduler>,
        run_id: &str,
        name: &str,
        capacity: usize,
        closed_by: Option<CancellationToken>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                run_id: run_id.to_string(),
                scheduler,
                closed_by,
                core: Mutex::new(ChannelCore {
                    capacity,
                    ..Default::default()
                }),
            }),
        }
    }

    fn is_closed(&self, core: &ChannelCore) -> bool {
        core.closed
            || self
                .inner
                .closed_by
                .as_ref()
                .map_or(false, CancellationToken::is_cancelled)
    }

    /// Push a value regardless of capacity. Used for signal delivery.
    pub(crate) fn deliver(&self, value: Payload) {
        let mut core = self.inner.core.lock();
        if let Err(value) = core.offer(value) {
            core.buffer.push_back(value);
        }
        drop(core);
        self.inner.scheduler.bump();
    }
}

impl fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("LocalChannel")
            .field("name", &self.inner.name)
            .field("buffered", &core.buffer.len())
            .field("blocked_senders", &core.blocked_senders.len())
            .field("closed", &self.is_closed(&core))
            .finish()
    }
}

#[async_trait]
impl NativeChannel<LocalContext> for LocalChannel {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn execution_id(&self) -> &str {
        &self.inner.run_id
    }

    async fn send(&self, ctx: &LocalContext, value: Payload) -> Result<(), HostError> {
        SendFuture {
            chan: self,
            ctx,
            state: SendState::Init(value),
        }
        .await
    }

    fn send_async(&self, value: Payload) -> bool {
        let mut core = self.inner.core.lock();
        if self.is_closed(&core) {
            return false;
        }
        let accepted = core.offer(value).is_ok();
        drop(core);
        if accepted {
            self.inner.scheduler.bump();
        }
        accepted
    }

    fn close(&self) {
        let mut core = self.inner.core.lock();
        if core.closed {
            return;
        }
        core.closed = true;
        drop(core);
        self.inner.scheduler.bump();
    }

    async fn receive(&self, ctx: &LocalContext) -> Result<Option<Payload>, HostError> {
        ReceiveFuture {
            chan: self,
            ctx,
            state: ReceiveState::Init,
        }
        .await
    }

    async fn receive_with_timeout(
        &self,
        ctx: &LocalContext,
        timeout: Duration,
    ) -> (Option<Payload>, bool) {
        TimedReceiveFuture {
            chan: self,
            ctx,
            timeout,
            state: TimedReceiveState::Init,
        }
        .await
    }

    fn receive_async(&self) -> Option<Payload> {
        self.receive_async_with_more_flag().0
    }

    fn receive_async_with_more_flag(&self) -> (Option<Payload>, bool) {
        let mut core = self.inner.core.lock();
        match core.take_next() {
            Some(v) => {
                drop(core);
                self.inner.scheduler.bump();
                (Some(v), true)
            }
            None => (None, !self.is_closed(&core)),
        }
    }

    fn len(&self) -> usize {
        let core = self.inner.core.lock();
        core.buffer.len() + core.blocked_senders.len()
    }
}

enum SendState {
    Init(Payload),
    Blocked(u64),
    Done,
}

struct SendFuture<'a> {
    chan: &'a LocalChannel,
    ctx: &'a LocalContext,
    state: SendState,
}

impl Future for SendFuture<'_> {
    type Output = Result<(), HostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let chan = this.chan;
        let scheduler = &chan.inner.scheduler;
        let mut core = chan.inner.core.lock();
        match std::mem::replace(&mut this.state, SendState::Done) {
            SendState::Init(value) => {
                if chan.is_closed(&core) {
                    return Poll::Ready(Err(HostError::ChannelClosed(chan.inner.name.clone())));
                }
                match core.offer(value) {
                    Ok(()) => {
                        drop(core);
                        scheduler.bump();
                        Poll::Ready(Ok(()))
                    }
                    Err(_) if this.ctx.is_cancelled() => Poll::Ready(Err(HostError::Canceled)),
                    Err(value) => {
                        this.state = SendState::Blocked(core.block_sender(value));
                        drop(core);
                        scheduler.bump();
                        scheduler.park(cx.waker());
                        Poll::Pending
                    }
                }
            }
            SendState::Blocked(sid) => {
                if core.delivered.remove(&sid) {
                    return Poll::Ready(Ok(()));
                }
                if chan.is_closed(&core) {
                    core.withdraw_sender(sid);
                    return Poll::Ready(Err(HostError::ChannelClosed(chan.inner.name.clone())));
                }
                if this.ctx.is_cancelled() {
                    core.withdraw_sender(sid);
                    return Poll::Ready(Err(HostError::Canceled));
                }
                this.state = SendState::Blocked(sid);
                drop(core);
                scheduler.park(cx.waker());
                Poll::Pending
            }
            SendState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for SendFuture<'_> {
    fn drop(&mut self) {
        if let SendState::Blocked(sid) = self.state {
            self.chan.inner.core.lock().withdraw_sender(sid);
        }
    }
}

enum ReceiveState {
    Init,
    Waiting(u64),
    Done,
}

struct ReceiveFuture<'a> {
    chan: &'a LocalChannel,
    ctx: &'a LocalContext,
    state: ReceiveState,
}

impl Future for ReceiveFuture<'_> {
    type Output = Result<Option<Payload>, HostError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let chan = this.chan;
        let scheduler = &chan.inner.scheduler;
        let mut core = chan.inner.core.lock();
        let waiting = match std::mem::replace(&mut this.state, ReceiveState::Done) {
            ReceiveState::Init => None,
            ReceiveState::Waiting(rid) => Some(rid),
            ReceiveState::Done => return Poll::Ready(Ok(None)),
        };
        let taken = match waiting {
            Some(rid) => core.take_for(rid),
            None => core.take_next(),
        };
        if let Some(v) = taken {
            drop(core);
            scheduler.bump();
            return Poll::Ready(Ok(Some(v)));
        }
        if chan.is_closed(&core) {
            if let Some(rid) = waiting {
                core.stop_waiting(rid);
            }
            return Poll::Ready(Ok(None));
        }
        if this.ctx.is_cancelled() {
            if let Some(rid) = waiting {
                core.stop_waiting(rid);
            }
            return Poll::Ready(Err(HostError::Canceled));
        }
        let rid = waiting.unwrap_or_else(|| core.wait());
        this.state = ReceiveState::Waiting(rid);
        drop(core);
        scheduler.park(cx.waker());
        Poll::Pending
    }
}

impl Drop for ReceiveFuture<'_> {
    fn drop(&mut self) {
        if let ReceiveState::Waiting(rid) = self.state {
            if self.chan.inner.core.lock().stop_waiting(rid) {
                self.chan.inner.scheduler.bump();
            }
        }
    }
}

enum TimedReceiveState {
    Init,
    Waiting {
        rid: u64,
        timer: TimerKey,
        fired: Arc<AtomicBool>,
    },
    Done,
}

struct TimedReceiveFuture<'a> {
    chan: &'a LocalChannel,
    ctx: &'a LocalContext,
    timeout: Duration,
    state: TimedReceiveState,
}

impl Future for TimedReceiveFuture<'_> {
    type Output = (Option<Payload>, bool);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let chan = this.chan;
        let scheduler = &chan.inner.scheduler;
        let mut core = chan.inner.core.lock();
        match std::mem::replace(&mut this.state, TimedReceiveState::Done) {
            TimedReceiveState::Init => {
                if let Some(v) = core.take_next() {
                    drop(core);
                    scheduler.bump();
                    return Poll::Ready((Some(v), true));
                }
                if chan.is_closed(&core) {
                    return Poll::Ready((None, false));
                }
                if this.ctx.is_cancelled() || this.timeout.is_zero() {
                    return Poll::Ready((None, true));
                }
                let rid = core.wait();
                // The timer goes in after the channel lock is released
                drop(core);
                let fired = Arc::new(AtomicBool::new(false));
                let timer = scheduler.add_timer(this.timeout, TimerAction::Fire(fired.clone()));
                this.state = TimedReceiveState::Waiting { rid, timer, fired };
                scheduler.park(cx.waker());
                Poll::Pending
            }
            TimedReceiveState::Waiting { rid, timer, fired } => {
                if let Some(v) = core.take_for(rid) {
                    drop(core);
                    scheduler.cancel_timer(timer);
                    scheduler.bump();
                    return Poll::Ready((Some(v), true));
                }
                let outcome = if chan.is_closed(&core) {
                    Some((None, false))
                } else if this.ctx.is_cancelled() || fired.load(Ordering::SeqCst) {
                    Some((None, true))
                } else {
                    None
                };
                match outcome {
                    Some(outcome) => {
                        core.stop_waiting(rid);
                        drop(core);
                        scheduler.cancel_timer(timer);
                        Poll::Ready(outcome)
                    }
                    None => {
                        drop(core);
                        this.state = TimedReceiveState::Waiting { rid, timer, fired };
                        scheduler.park(cx.waker());
                        Poll::Pending
                    }
                }
            }
            TimedReceiveState::Done => Poll::Ready((None, true)),
        }
    }
}

impl Drop for TimedReceiveFuture<'_> {
    fn drop(&mut self) {
        if let TimedReceiveState::Waiting { rid, timer, .. } = &self.state {
            let returned = self.chan.inner.core.lock().stop_waiting(*rid);
            self.chan.inner.scheduler.cancel_timer(*timer);
            if returned {
                self.chan.inner.scheduler.bump();
            }
        }
    }
}
