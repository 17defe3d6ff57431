//! Runtime: the processor pool and its shared state
//!
//! A [`Runtime`] owns one OS thread per processor plus the state they share:
//! the global overflow queue, every processor's local queue (so siblings can
//! steal from it), the per-processor timer sets and the idle parking word.
//!
//! ```rust,ignore
//! use ufiber_runtime::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::from_env().num_processors(4))?;
//! rt.start()?;
//! rt.spawn(|| println!("hello from a fiber"));
//! let answer = rt.block_on(|| 42)?;
//! rt.shutdown();
//! ```
//!
//! Only one runtime may be alive per process; constructing a second one is
//! a fatal invariant violation.

use crate::config::{ConfigError, RuntimeConfig};
use crate::fiber::{Entry, Fiber};
use crate::parking::FutexParking;
use crate::processor::Processor;
use crate::run_queue::RunQueue;
use crate::timer::{TimerCallback, TimerHandle, TimerSet};
use crate::tls;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use ufiber_core::error::{RuntimeError, RuntimeResult};
use ufiber_core::fatal::panic_message;
use ufiber_core::id::FiberId;
use ufiber_core::state::FiberState;
use ufiber_core::{fatal, fatal_assert, kdebug, kerror, kinfo};

/// Set while a `Runtime` exists in this process
static RUNTIME_ALIVE: AtomicBool = AtomicBool::new(false);

/// Counters across all processors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Fibers created (spawns and timer callbacks)
    pub spawned: u64,
    /// Fibers that returned normally
    pub completed: u64,
    /// Fibers whose entry function panicked
    pub failed: u64,
    /// Fibers moved by work stealing
    pub stolen: u64,
}

/// State shared by the runtime and all of its processors
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    global: RunQueue,
    locals: Vec<RunQueue>,
    timers: Vec<Arc<TimerSet>>,
    pub(crate) parking: Arc<FutexParking>,
    shutdown: AtomicBool,
    next_timer: AtomicUsize,
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    stolen: AtomicU64,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig) -> Arc<Self> {
        let n = config.effective_processors();
        let parking = Arc::new(FutexParking::new());
        let timers = (0..n)
            .map(|_| {
                let set = TimerSet::new();
                let weak = Arc::downgrade(&parking);
                // A new earliest timer must shorten an idle processor's park
                set.set_tickle_hook(Box::new(move || {
                    if let Some(parking) = weak.upgrade() {
                        parking.wake_all();
                    }
                }));
                set
            })
            .collect();
        let locals = (0..n)
            .map(|_| RunQueue::with_capacity(config.local_queue_capacity))
            .collect();

        Arc::new(Self {
            config,
            global: RunQueue::new(),
            locals,
            timers,
            parking,
            shutdown: AtomicBool::new(false),
            next_timer: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
        })
    }

    #[inline]
    pub(crate) fn num_processors(&self) -> usize {
        self.locals.len()
    }

    #[inline]
    pub(crate) fn local_queue(&self, id: usize) -> &RunQueue {
        &self.locals[id]
    }

    #[inline]
    pub(crate) fn timer_set(&self, id: usize) -> &Arc<TimerSet> {
        &self.timers[id]
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The processor driving this thread, if it belongs to this runtime
    fn local_processor(&self) -> Option<&'static Processor> {
        tls::current_processor().filter(|p| std::ptr::eq(Arc::as_ptr(p.shared()), self))
    }

    /// Schedule `entry` as a new fiber
    ///
    /// On one of this runtime's processor threads the fiber goes to the local
    /// queue while it has room; otherwise it goes to the global queue. Fails
    /// with [`RuntimeError::NotInRuntime`] once the runtime is shut down.
    pub(crate) fn spawn(&self, entry: Entry) -> RuntimeResult<FiberId> {
        if self.is_shutdown() {
            return Err(RuntimeError::NotInRuntime);
        }
        if let Some(p) = self.local_processor() {
            if p.queue().len_hint() < self.config.local_queue_capacity {
                let fiber = p.build_fiber(entry)?;
                let id = fiber.id();
                self.record_spawn();
                p.queue().push(fiber);
                self.parking.wake_one();
                return Ok(id);
            }
        }

        let fiber = Fiber::new(entry, self.config.stack_size)?;
        let id = fiber.id();
        self.record_spawn();
        self.global.push(fiber);
        self.parking.wake_one();
        Ok(id)
    }

    /// Move work to processor `id`: the global queue first, then a sibling
    ///
    /// Siblings are scanned from a random start and always keep their last
    /// fiber. Returns the number of fibers moved.
    pub(crate) fn steal_tasks(&self, id: usize) -> usize {
        let dst = &self.locals[id];

        let n = self.global.steal(dst, true);
        if n > 0 {
            self.stolen.fetch_add(n as u64, Ordering::Relaxed);
            return n;
        }

        let count = self.locals.len();
        if count < 2 {
            return 0;
        }
        let start = rand::thread_rng().gen_range(0..count);
        for i in 0..count {
            let victim = (start + i) % count;
            if victim == id || self.locals[victim].is_empty() {
                continue;
            }
            let n = self.locals[victim].steal(dst, false);
            if n > 0 {
                kdebug!("processor {} stole {} fibers from processor {}", id, n, victim);
                self.stolen.fetch_add(n as u64, Ordering::Relaxed);
                return n;
            }
        }
        0
    }

    /// Schedule a timer on the calling processor, or round-robin from outside
    pub(crate) fn add_timer(
        &self,
        period: Duration,
        cb: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        self.pick_timer_set().add_timer(period, cb, recurring)
    }

    pub(crate) fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        period: Duration,
        cb: TimerCallback,
        cond: std::sync::Weak<T>,
        recurring: bool,
    ) -> TimerHandle {
        self.pick_timer_set()
            .add_condition_timer(period, cb, cond, recurring)
    }

    fn pick_timer_set(&self) -> &Arc<TimerSet> {
        match self.local_processor() {
            Some(p) => &self.timers[p.id()],
            None => {
                let i = self.next_timer.fetch_add(1, Ordering::Relaxed) % self.timers.len();
                &self.timers[i]
            }
        }
    }

    #[inline]
    pub(crate) fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_exit(&self, state: FiberState) {
        match state {
            FiberState::Except => self.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.completed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
        }
    }
}

/// Holds processor threads until every processor has been constructed
struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open,
    Aborted,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Closed),
            cond: Condvar::new(),
        }
    }

    /// Block until released; true if processors should run
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == GateState::Closed {
            self.cond.wait(&mut state);
        }
        *state == GateState::Open
    }

    fn release(&self, to: GateState) {
        *self.state.lock() = to;
        self.cond.notify_all();
    }
}

/// A pool of processors running fibers
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Runtime {
    /// Create a runtime; processor threads start with [`start`](Self::start)
    ///
    /// # Panics
    ///
    /// Fatal if another runtime is alive in this process.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate().map_err(|ConfigError::InvalidValue(msg)| {
            RuntimeError::InvalidConfig(msg)
        })?;
        if RUNTIME_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            fatal!("a second Runtime was constructed while one is alive");
        }
        Ok(Self {
            shared: Shared::new(config),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spin up one OS thread per processor
    ///
    /// Every processor is constructed before any of them starts scheduling.
    /// Calling `start` on a running runtime does nothing; a runtime that was
    /// shut down cannot be restarted.
    pub fn start(&self) -> RuntimeResult<()> {
        let mut threads = self.threads.lock();
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.shared.is_shutdown() {
            return Err(RuntimeError::NotInRuntime);
        }

        let n = self.shared.num_processors();
        let gate = Arc::new(StartGate::new());
        let (init_tx, init_rx) = mpsc::channel::<RuntimeResult<()>>();

        let mut failure = None;
        for id in 0..n {
            let shared = Arc::clone(&self.shared);
            let gate = Arc::clone(&gate);
            let init_tx = init_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("ufiber-proc-{}", id))
                .spawn(move || processor_main(id, shared, gate, init_tx));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    failure = Some(RuntimeError::ThreadSpawn(e));
                    break;
                }
            }
        }
        drop(init_tx);

        if failure.is_none() {
            for _ in 0..threads.len() {
                match init_rx.recv() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    Err(_) => {
                        failure = Some(RuntimeError::ProcessorInit {
                            id: usize::MAX,
                            reason: "processor thread exited during init".into(),
                        });
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            gate.release(GateState::Aborted);
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
            kerror!("runtime start failed: {}", err);
            return Err(err);
        }

        self.started.store(true, Ordering::Release);
        gate.release(GateState::Open);
        kinfo!("runtime started with {} processors", n);
        Ok(())
    }

    /// Schedule `f` as a new fiber
    ///
    /// # Panics
    ///
    /// Panics if the fiber's stack cannot be allocated; see
    /// [`try_spawn`](Self::try_spawn).
    pub fn spawn<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_spawn(f) {
            Ok(id) => id,
            Err(e) => panic!("failed to spawn fiber: {}", e),
        }
    }

    /// Schedule `f` as a new fiber
    ///
    /// Fails if the stack cannot be allocated, or with
    /// [`RuntimeError::NotInRuntime`] after [`shutdown`](Self::shutdown).
    pub fn try_spawn<F>(&self, f: F) -> RuntimeResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Box::new(f))
    }

    /// Run `f` in a fiber and block the calling thread until it returns
    ///
    /// Starts the runtime if needed. Returns [`RuntimeError::FiberFailed`]
    /// if `f` panicked. Must not be called from inside a fiber.
    pub fn block_on<F, T>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        fatal_assert!(!tls::is_in_fiber(), "block_on called from inside a fiber");
        self.start()?;

        let (tx, rx) = mpsc::sync_channel::<Result<T, String>>(1);
        self.try_spawn(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = tx.send(Ok(value));
            }
            Err(payload) => {
                let _ = tx.send(Err(panic_message(&*payload)));
                panic::resume_unwind(payload);
            }
        })?;

        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(RuntimeError::FiberFailed(reason)),
            Err(_) => Err(RuntimeError::FiberFailed(
                "fiber dropped before completing".into(),
            )),
        }
    }

    /// Schedule `cb` after `period`, repeating if `recurring`
    pub fn add_timer<F>(&self, period: Duration, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.add_timer(period, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs while `cond`
    /// is alive
    pub fn add_condition_timer<F, T>(
        &self,
        period: Duration,
        cb: F,
        cond: std::sync::Weak<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.shared
            .add_condition_timer(period, Arc::new(cb), cond, recurring)
    }

    /// Cloneable handle for spawning from other threads
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn num_processors(&self) -> usize {
        self.shared.num_processors()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Stop all processors and join their threads
    ///
    /// Fibers that have not terminated are leaked, stacks included.
    pub fn shutdown(&self) {
        fatal_assert!(
            !tls::is_processor_thread(),
            "runtime shut down from one of its own processors"
        );
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.parking.wake_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        self.started.store(false, Ordering::Release);
        kinfo!("runtime stopped: {:?}", self.shared.stats());
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !tls::is_processor_thread() {
            self.shutdown();
        }
        RUNTIME_ALIVE.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("processors", &self.shared.num_processors())
            .field("started", &self.is_started())
            .field("stats", &self.shared.stats())
            .finish()
    }
}

/// Cloneable reference to a runtime's scheduling entry points
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Handle of the runtime driving the calling thread
    pub fn current() -> Option<Handle> {
        tls::current_processor().map(|p| Handle {
            shared: Arc::clone(p.shared()),
        })
    }

    pub fn spawn<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_spawn(f) {
            Ok(id) => id,
            Err(e) => panic!("failed to spawn fiber: {}", e),
        }
    }

    pub fn try_spawn<F>(&self, f: F) -> RuntimeResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Box::new(f))
    }

    pub fn add_timer<F>(&self, period: Duration, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.add_timer(period, Arc::new(cb), recurring)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("processors", &self.shared.num_processors())
            .finish()
    }
}

/// Body of a processor thread
fn processor_main(
    id: usize,
    shared: Arc<Shared>,
    gate: Arc<StartGate>,
    init_tx: mpsc::Sender<RuntimeResult<()>>,
) {
    let processor = match Processor::new(id, shared) {
        Ok(p) => {
            let _ = init_tx.send(Ok(()));
            p
        }
        Err(e) => {
            let _ = init_tx.send(Err(RuntimeError::ProcessorInit {
                id,
                reason: e.to_string(),
            }));
            return;
        }
    };
    drop(init_tx);

    if !gate.wait() {
        return;
    }

    // A panic here means the scheduler itself is broken; fiber panics never
    // reach this frame
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| processor.execute())) {
        kerror!(
            "processor {} crashed: {}",
            id,
            panic_message(&*payload)
        );
        std::process::abort();
    }
}
