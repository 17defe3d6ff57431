//! Per-processor timer set
//!
//! Timers are ordered by `(next_trigger, sequence)`; the sequence number makes
//! equal deadlines fire in insertion order. The owning processor asks for
//! [`TimerSet::next_trigger_duration`] to bound its reactor wait and collects
//! [`TimerSet::expired_callbacks`] after every wait.
//!
//! A recurring timer is rescheduled at `now + period` when it fires, so an
//! overloaded processor drifts instead of replaying missed intervals.
//!
//! The set is `Sync`: handles may be cancelled from any thread and the runtime
//! may place timers on a processor from outside its thread. Inserting a new
//! earliest timer raises a tickle so that a processor already blocked in its
//! reactor wait re-evaluates its timeout.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Callback run when a timer fires
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct Timer {
    period: Duration,
    recurring: bool,
    next: Instant,
    seq: u64,
    cb: TimerCallback,
}

impl Timer {
    #[inline]
    fn key(&self) -> (Instant, u64) {
        (self.next, self.seq)
    }
}

#[derive(Default)]
struct Inner {
    order: BTreeMap<(Instant, u64), u64>,
    timers: HashMap<u64, Timer>,
    next_seq: u64,
}

impl Inner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Schedule `id` at `next`; returns true if it became the earliest
    fn schedule(&mut self, id: u64, next: Instant) -> bool {
        let seq = self.seq();
        let Some(timer) = self.timers.get_mut(&id) else {
            return false;
        };
        timer.next = next;
        timer.seq = seq;
        let key = timer.key();
        let earliest = self.order.first_key_value().map_or(true, |(k, _)| key < *k);
        self.order.insert(key, id);
        earliest
    }

    fn unschedule(&mut self, id: u64) -> Option<&mut Timer> {
        let timer = self.timers.get_mut(&id)?;
        self.order.remove(&timer.key());
        Some(timer)
    }
}

/// Ordered collection of scheduled callbacks
pub struct TimerSet {
    inner: Mutex<Inner>,
    tickled: AtomicBool,
    on_earliest: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            tickled: AtomicBool::new(false),
            on_earliest: OnceLock::new(),
        })
    }

    /// Install the hook run whenever a new earliest timer is inserted
    ///
    /// Only the first call takes effect.
    pub fn set_tickle_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.on_earliest.set(hook);
    }

    /// Schedule `cb` to run after `period` (and every `period` if `recurring`)
    pub fn add_timer(
        self: &Arc<Self>,
        period: Duration,
        cb: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        self.add_timer_at(Instant::now(), period, cb, recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs while `cond`
    /// can still be upgraded
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        period: Duration,
        cb: TimerCallback,
        cond: Weak<T>,
        recurring: bool,
    ) -> TimerHandle {
        let guarded: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(period, guarded, recurring)
    }

    pub(crate) fn add_timer_at(
        self: &Arc<Self>,
        now: Instant,
        period: Duration,
        cb: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        let (id, earliest) = {
            let mut inner = self.inner.lock();
            let id = inner.seq();
            inner.timers.insert(
                id,
                Timer {
                    period,
                    recurring,
                    next: now,
                    seq: 0,
                    cb,
                },
            );
            let earliest = inner.schedule(id, now + period);
            (id, earliest)
        };
        if earliest {
            self.tickle();
        }
        TimerHandle {
            id,
            set: Arc::downgrade(self),
        }
    }

    /// Time until the earliest timer is due (zero if overdue), `None` if empty
    pub fn next_trigger_duration(&self) -> Option<Duration> {
        self.next_trigger_duration_at(Instant::now())
    }

    pub(crate) fn next_trigger_duration_at(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .order
            .first_key_value()
            .map(|((next, _), _)| next.saturating_duration_since(now))
    }

    /// Remove and return the callbacks of every due timer, earliest first
    pub fn expired_callbacks(&self) -> Vec<TimerCallback> {
        self.expired_callbacks_at(Instant::now())
    }

    pub(crate) fn expired_callbacks_at(&self, now: Instant) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        while let Some((&(next, _), &id)) = inner.order.first_key_value() {
            if next > now {
                break;
            }
            inner.order.pop_first();
            due.push(id);
        }

        let mut callbacks = Vec::with_capacity(due.len());
        for id in due {
            let Some(timer) = inner.timers.get(&id) else {
                continue;
            };
            callbacks.push(timer.cb.clone());
            if timer.recurring {
                let next = now + timer.period;
                inner.schedule(id, next);
            } else {
                inner.timers.remove(&id);
            }
        }
        callbacks
    }

    /// Number of scheduled timers
    pub fn len(&self) -> usize {
        self.inner.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume a pending tickle
    pub fn take_tickle(&self) -> bool {
        self.tickled.swap(false, Ordering::AcqRel)
    }

    fn tickle(&self) {
        self.tickled.store(true, Ordering::Release);
        if let Some(hook) = self.on_earliest.get() {
            hook();
        }
    }

    fn cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.unschedule(id).is_none() {
            return false;
        }
        inner.timers.remove(&id);
        true
    }

    fn restart(&self, id: u64, now: Instant, period: Option<Duration>) -> bool {
        let earliest = {
            let mut inner = self.inner.lock();
            let Some(timer) = inner.unschedule(id) else {
                return false;
            };
            if let Some(period) = period {
                timer.period = period;
            }
            let next = now + timer.period;
            inner.schedule(id, next)
        };
        if earliest {
            self.tickle();
        }
        true
    }
}

/// Handle to a scheduled timer
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    set: Weak<TimerSet>,
}

impl TimerHandle {
    /// Cancel the timer; false if it already fired (one-shot) or was cancelled
    pub fn cancel(&self) -> bool {
        self.set.upgrade().is_some_and(|set| set.cancel(self.id))
    }

    /// Restart the countdown from now with the same period
    pub fn refresh(&self) -> bool {
        self.set
            .upgrade()
            .is_some_and(|set| set.restart(self.id, Instant::now(), None))
    }

    /// Change the period and restart the countdown from now
    pub fn reset(&self, period: Duration) -> bool {
        self.set
            .upgrade()
            .is_some_and(|set| set.restart(self.id, Instant::now(), Some(period)))
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerHandle({})", self.id)
    }
}
