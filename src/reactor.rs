//! The event loop (§4.4): owns the backend, the active handle registries,
//! the timer heap, the deferred-work queues, and runs the turn cycle.
//!
//! Architectural note (see DESIGN.md): rather than a C-style pointer graph
//! of handles each holding a raw pointer back to their loop, every handle's
//! state lives directly inside `EventLoop`'s per-kind `SlotMap`s, addressed
//! by a small `Copy` id (`TcpId`, `UdpId`, ...). Callbacks are boxed
//! closures of shape `FnMut(&mut EventLoop, ...)`, so user code re-enters
//! the loop through an explicit `&mut EventLoop` parameter rather than a
//! shared, interior-mutable back-reference — this sidesteps `RefCell`
//! re-entrancy panics entirely while keeping the "operations mutate handle
//! state, callbacks can drive further operations" shape the spec describes.

use crate::backend::{Backend, MioBackend, ReadyEvent, WAKE_TOKEN};
use crate::collections::mpsc::MpscQueue;
use crate::config::Config;
use crate::dns::DnsId;
use crate::error::{Error, Result};
use crate::mempool::Pool;
use crate::mqtt::client::MqttId;
use crate::tcp::{TcpListenerId, TcpStreamId};
use crate::timer::{now_us, TimerToken, TimerWheel};
use crate::tls::TlsId;
use crate::udp::UdpId;
use crate::websocket::WsId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long `run` keeps turning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Loop until no active handles and no pending work remain.
    Default,
    /// One turn; block for I/O if nothing else is ready.
    Once,
    /// One turn; never block.
    NoWait,
}

/// Which registry a backend-registered token dispatches to. Only raw
/// socket owners (TCP streams/listeners, UDP) register directly with the
/// backend; TLS/WebSocket/MQTT are layered on top via callbacks and never
/// appear here.
pub(crate) enum Source {
    TcpStream(TcpStreamId),
    TcpListener(TcpListenerId),
    Udp(UdpId),
}

type DeferredJob = Box<dyn FnOnce(&mut EventLoop) + Send>;
type LocalJob = Box<dyn FnOnce(&mut EventLoop)>;

/// Cross-thread-safe handle for waking a sleeping loop and scheduling work
/// onto it (§5: "only `loop.queue_work` and `loop.wake()` are safe from
/// non-loop threads").
#[derive(Clone)]
pub struct WakeHandle {
    waker: Arc<mio::Waker>,
    external: Arc<MpscQueue<DeferredJob>>,
    stop_flag: Arc<AtomicBool>,
}

impl WakeHandle {
    /// Enqueue work to run on the loop thread at the start of its next
    /// turn, then wake the loop if it is blocked in `backend.wait`.
    pub fn queue_work<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.external
            .enqueue(Box::new(job))
            .map_err(|_| Error::resource_exhausted("deferred work queue full"))?;
        self.waker.wake().map_err(|e| Error::reactor(format!("wake failed: {e}")))
    }

    /// Request the loop stop after its current turn completes.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Runtime statistics surfaced for observability.
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub turns: u64,
    pub io_events_dispatched: u64,
    pub timers_fired: u64,
    pub deferred_jobs_run: u64,
}

/// The reactor. Not `Send`: every operation besides [`WakeHandle`] is
/// loop-thread-only.
pub struct EventLoop {
    backend: Box<dyn Backend>,
    pool: Arc<Pool>,
    config: Config,
    timers: TimerWheel,

    deferred_local: VecDeque<LocalJob>,
    deferred_external: Arc<MpscQueue<DeferredJob>>,
    stop_flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,

    sources: HashMap<usize, Source>,
    next_token: usize,
    closing: Vec<LocalJob>,

    pub(crate) tcp_streams: slotmap::SlotMap<TcpStreamId, crate::tcp::StreamState>,
    pub(crate) tcp_listeners: slotmap::SlotMap<TcpListenerId, crate::tcp::ListenerState>,
    pub(crate) udp: slotmap::SlotMap<UdpId, crate::udp::UdpState>,
    pub(crate) dns: slotmap::SlotMap<DnsId, crate::dns::DnsState>,
    pub(crate) tls: slotmap::SlotMap<TlsId, crate::tls::TlsState>,
    pub(crate) ws: slotmap::SlotMap<WsId, crate::websocket::WsState>,
    pub(crate) mqtt: slotmap::SlotMap<MqttId, crate::mqtt::client::ClientState>,

    stats: LoopStats,
}

impl EventLoop {
    pub fn new(config: Config) -> Result<Self> {
        let mut backend = MioBackend::new(config.reactor.max_events_per_poll)?;
        let waker = backend.clone_waker();
        let pool = Arc::new(Pool::new(Default::default()));

        Ok(Self {
            backend: Box::new(backend),
            pool,
            timers: TimerWheel::new(config.timer.max_timers),
            deferred_local: VecDeque::with_capacity(config.reactor.max_deferred_queue.min(1024)),
            deferred_external: Arc::new(MpscQueue::with_capacity(config.reactor.max_deferred_queue)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            waker,
            sources: HashMap::with_capacity(config.reactor.initial_handle_capacity),
            next_token: 1,
            closing: Vec::new(),
            tcp_streams: slotmap::SlotMap::with_key(),
            tcp_listeners: slotmap::SlotMap::with_key(),
            udp: slotmap::SlotMap::with_key(),
            dns: slotmap::SlotMap::with_key(),
            tls: slotmap::SlotMap::with_key(),
            ws: slotmap::SlotMap::with_key(),
            mqtt: slotmap::SlotMap::with_key(),
            config,
            stats: LoopStats::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.clone()
    }

    /// Current monotonic time, microseconds, shared clock source across the
    /// whole process (§4.4 `now()`).
    pub fn now_us(&self) -> i64 {
        now_us()
    }

    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle {
            waker: Arc::clone(&self.waker),
            external: Arc::clone(&self.deferred_external),
            stop_flag: Arc::clone(&self.stop_flag),
        }
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    /// Schedule work for the very next turn, from the loop thread itself.
    pub fn queue_work_immediate<F>(&mut self, job: F)
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.deferred_local.push_back(Box::new(job));
    }

    /// Same contract as [`WakeHandle::queue_work`], usable when you already
    /// hold `&mut EventLoop` (e.g. scheduling work from inside a callback
    /// without waiting for another turn's deferred-queue drain would be
    /// wrong — this still defers to "next turn", per §4.4 phase 1's
    /// starvation guard).
    pub fn queue_work<F>(&mut self, job: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.deferred_external
            .enqueue(Box::new(job))
            .map_err(|_| Error::resource_exhausted("deferred work queue full"))
    }

    pub(crate) fn schedule_close<F>(&mut self, job: F)
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.closing.push(Box::new(job));
    }

    // Per-kind register/modify/deregister rather than one generic method
    // taking `&mut dyn mio::event::Source`: the socket to (de)register
    // always lives inside one of this struct's own slotmaps, and a generic
    // method would force callers to borrow that field and `self` for the
    // method call at once, which the borrow checker rejects. Naming the
    // field directly inside each method lets it borrow `self.backend` and
    // `self.tcp_streams` (disjoint fields) in the same statement instead.

    pub(crate) fn register_tcp_stream(&mut self, id: TcpStreamId, mask: crate::backend::ReadinessMask) -> Result<usize> {
        let token = self.next_token;
        self.next_token += 1;
        let state = self.tcp_streams.get_mut(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        self.backend.add(&mut state.socket, token, mask)?;
        self.sources.insert(token, Source::TcpStream(id));
        Ok(token)
    }

    pub(crate) fn modify_tcp_stream(&mut self, id: TcpStreamId, mask: crate::backend::ReadinessMask) -> Result<()> {
        let state = self.tcp_streams.get_mut(id).ok_or_else(|| Error::argument("unknown tcp stream"))?;
        let token = state.token;
        self.backend.modify(&mut state.socket, token, mask)
    }

    pub(crate) fn deregister_tcp_stream(&mut self, id: TcpStreamId) {
        let Some(state) = self.tcp_streams.get_mut(id) else { return };
        let token = state.token;
        let _ = self.backend.remove(&mut state.socket);
        self.sources.remove(&token);
    }

    pub(crate) fn register_tcp_listener(&mut self, id: TcpListenerId, mask: crate::backend::ReadinessMask) -> Result<usize> {
        let token = self.next_token;
        self.next_token += 1;
        let state = self.tcp_listeners.get_mut(id).ok_or_else(|| Error::argument("unknown tcp listener"))?;
        self.backend.add(&mut state.socket, token, mask)?;
        self.sources.insert(token, Source::TcpListener(id));
        Ok(token)
    }

    pub(crate) fn deregister_tcp_listener(&mut self, id: TcpListenerId) {
        let Some(state) = self.tcp_listeners.get_mut(id) else { return };
        let token = state.token;
        let _ = self.backend.remove(&mut state.socket);
        self.sources.remove(&token);
    }

    pub(crate) fn register_udp(&mut self, id: UdpId, mask: crate::backend::ReadinessMask) -> Result<usize> {
        let token = self.next_token;
        self.next_token += 1;
        let state = self.udp.get_mut(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        self.backend.add(&mut state.socket, token, mask)?;
        self.sources.insert(token, Source::Udp(id));
        Ok(token)
    }

    pub(crate) fn modify_udp(&mut self, id: UdpId, mask: crate::backend::ReadinessMask) -> Result<()> {
        let state = self.udp.get_mut(id).ok_or_else(|| Error::argument("unknown udp socket"))?;
        let token = state.token;
        self.backend.modify(&mut state.socket, token, mask)
    }

    pub(crate) fn deregister_udp(&mut self, id: UdpId) {
        let Some(state) = self.udp.get_mut(id) else { return };
        let token = state.token;
        let _ = self.backend.remove(&mut state.socket);
        self.sources.remove(&token);
    }

    pub(crate) fn start_timer(
        &mut self,
        timeout: Duration,
        period: Duration,
        callback: impl FnMut(TimerToken) -> Result<()> + Send + 'static,
    ) -> Result<TimerToken> {
        self.timers.start(
            self.now_us(),
            timeout.as_micros() as i64,
            period.as_micros() as i64,
            Box::new(callback),
        )
    }

    pub fn stop_timer(&mut self, token: TimerToken) -> bool {
        self.timers.stop(token)
    }

    fn has_active_work(&self) -> bool {
        !self.tcp_streams.is_empty()
            || !self.tcp_listeners.is_empty()
            || !self.udp.is_empty()
            || !self.dns.is_empty()
            || !self.tls.is_empty()
            || !self.ws.is_empty()
            || !self.mqtt.is_empty()
            || self.timers.stats().live_timers > 0
            || !self.deferred_local.is_empty()
            || self.deferred_external.len_estimate() > 0
    }

    /// Run exactly one turn, following §4.4's six ordered phases.
    pub fn run_turn(&mut self, mode: RunMode) -> Result<()> {
        self.stats.turns += 1;

        // Phase 1: drain the deferred-work queues entirely. Jobs queued by
        // a running job are recorded but run next turn (we snapshot the
        // local queue length and only drain what existed at entry, and the
        // external MPSC drains to empty, accepting the documented race
        // where a concurrently-enqueuing thread can extend this turn's
        // drain slightly).
        let local_count = self.deferred_local.len();
        for _ in 0..local_count {
            if let Some(job) = self.deferred_local.pop_front() {
                job(self);
                self.stats.deferred_jobs_run += 1;
            }
        }
        while let Some(job) = self.deferred_external.dequeue() {
            job(self);
            self.stats.deferred_jobs_run += 1;
        }

        // Phase 2+3: compute the wait timeout, block for I/O, dispatch.
        let now = self.now_us();
        let next_deadline = self.timers.next_deadline_us();
        let timeout = match mode {
            RunMode::NoWait => Some(Duration::ZERO),
            _ => match next_deadline {
                Some(deadline) => {
                    let micros = (deadline - now).max(0) as u64;
                    Some(Duration::from_micros(micros).min(Duration::from_millis(
                        self.config.reactor.max_poll_timeout_ms,
                    )))
                }
                None if mode == RunMode::Once => {
                    Some(Duration::from_millis(self.config.reactor.max_poll_timeout_ms))
                }
                None => Some(Duration::from_millis(self.config.reactor.max_poll_timeout_ms)),
            },
        };

        let events = self.backend.wait(timeout)?;
        for event in &events {
            self.dispatch_event(*event);
        }
        self.stats.io_events_dispatched += events.len() as u64;

        // Phase 4: fire due timers, in deadline order, strictly after I/O.
        let now = self.now_us();
        let fired = self.timers.fire_due(now);
        self.stats.timers_fired += fired as u64;

        // Phase 5: process closing handles.
        let closing = std::mem::take(&mut self.closing);
        for job in closing {
            job(self);
        }

        // Phase 6: termination check happens in `run`.
        let _ = mode;
        Ok(())
    }

    fn dispatch_event(&mut self, event: ReadyEvent) {
        if event.token == WAKE_TOKEN {
            return;
        }
        let Some(source) = self.sources.get(&event.token) else {
            warn!(token = event.token, "no handler registered for ready token");
            return;
        };
        trace!(token = event.token, readable = event.readable, writable = event.writable, "dispatching I/O event");
        match *source {
            Source::TcpStream(id) => crate::tcp::dispatch_stream_ready(self, id, event),
            Source::TcpListener(id) => crate::tcp::dispatch_listener_ready(self, id, event),
            Source::Udp(id) => crate::udp::dispatch_ready(self, id, event),
        }
    }

    /// Run until termination, per `mode` (§4.4).
    pub fn run(&mut self, mode: RunMode) -> Result<()> {
        debug!(?mode, "event loop starting");
        loop {
            self.run_turn(mode)?;
            match mode {
                RunMode::Once | RunMode::NoWait => return Ok(()),
                RunMode::Default => {
                    if self.stop_flag.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    if !self.has_active_work() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_terminates_with_no_work() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        lp.run(RunMode::Default).unwrap();
        assert_eq!(lp.stats().turns, 1);
    }

    #[test]
    fn one_shot_timer_runs_exactly_once_and_loop_terminates() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        lp.start_timer(Duration::from_millis(1), Duration::ZERO, move |_| {
            f.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        lp.run(RunMode::Default).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn wake_handle_queue_work_runs_on_loop_thread() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        let handle = lp.wake_handle();
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let thread = std::thread::spawn(move || {
            handle.queue_work(move |_| { r.store(true, Ordering::SeqCst); }).unwrap();
        });
        thread.join().unwrap();
        lp.run(RunMode::Once).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_from_other_thread_halts_default_run() {
        let mut lp = EventLoop::new(Config::default()).unwrap();
        let handle = lp.wake_handle();
        // An always-active periodic timer would otherwise keep DEFAULT mode
        // running forever; `stop()` must still terminate it.
        lp.start_timer(Duration::from_millis(1), Duration::from_millis(1), |_| Ok(())).unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.stop();
        });
        lp.run(RunMode::Default).unwrap();
    }
}
