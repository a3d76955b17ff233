//! Single-shot, re-armable timers running their callbacks in a deferred context.
//!
//! A [TimerSet] owns a fixed number of slots, each with its callback bound at
//! construction. Arming only touches atomics, so it is safe from an interrupt
//! handler. Expired slots are fired by [TimerSet::run_expired], either from a
//! [TimerThread] or, in tests, by hand after advancing a [ManualClock].

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use log::{debug, trace};
use crate::{KeyError, KeyResult};

/// A monotonic time source.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Gets the time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

#[derive(Copy, Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(as_nanos(by), Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(as_nanos(to), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

fn as_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Deadline value of a slot that is not armed.
const DISARMED: u64 = 0;

/// Callback run when a slot expires.
pub type TimerCallback = Box<dyn Fn(&Expired<'_>) + Send + Sync>;

/// Handed to a callback while it runs.
pub struct Expired<'a> {
    slot: &'a Slot,
    index: usize,
    now: Duration,
    shut_down: &'a AtomicBool,
}

impl Expired<'_> {
    /// Index of the slot that fired.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Time the slot was found expired.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Arms the firing slot again, `delay` after [now](Self::now).
    pub fn rearm(&self, delay: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.slot
            .deadline
            .store(encode_deadline(self.now + delay), Ordering::SeqCst);
    }
}

struct Slot {
    deadline: AtomicU64,
    in_flight: AtomicU32,
    fires: AtomicU64,
    callback: TimerCallback,
}

fn encode_deadline(at: Duration) -> u64 {
    as_nanos(at).max(1)
}

pub struct TimerSet<C: Clock> {
    clock: C,
    slots: Box<[Slot]>,
    shut_down: AtomicBool,
    waker: OnceLock<Thread>,
}

impl<C: Clock> Debug for TimerSet<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerSet({:?}, {} slots)", self.clock, self.slots.len())
    }
}

impl<C: Clock> TimerSet<C> {
    /// Creates one disarmed slot per callback.
    pub fn new(clock: C, callbacks: Vec<TimerCallback>) -> Self {
        let slots = callbacks
            .into_iter()
            .map(|callback| Slot {
                deadline: AtomicU64::new(DISARMED),
                in_flight: AtomicU32::new(0),
                fires: AtomicU64::new(0),
                callback,
            })
            .collect();
        Self {
            clock,
            slots,
            shut_down: AtomicBool::new(false),
            waker: OnceLock::new(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Arms `slot` to fire `delay` from now.
    ///
    /// If the slot is already pending its deadline is moved, there is never more
    /// than one pending fire per slot. Never blocks and never allocates.
    /// Does nothing after [shutdown](Self::shutdown).
    ///
    /// Returns whether the slot was pending before.
    ///
    /// # Panics
    /// If `slot` is out of range.
    pub fn arm(&self, slot: usize, delay: Duration) -> bool {
        let slot = &self.slots[slot];
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }

        let deadline = encode_deadline(self.clock.now() + delay);
        let previous = slot.deadline.swap(deadline, Ordering::SeqCst);
        if let Some(waker) = self.waker.get() {
            waker.unpark();
        }
        previous != DISARMED
    }

    pub fn is_pending(&self, slot: usize) -> bool {
        self.slots[slot].deadline.load(Ordering::SeqCst) != DISARMED
    }

    /// Gets how many times the slot's callback ran.
    pub fn fires(&self, slot: usize) -> u64 {
        self.slots[slot].fires.load(Ordering::SeqCst)
    }

    /// Disarms `slot` and waits until a callback of it that is already running returns.
    ///
    /// Must not be called from the slot's own callback.
    ///
    /// Returns whether the slot was pending.
    pub fn cancel_sync(&self, slot: usize) -> bool {
        let slot = &self.slots[slot];
        let was_pending = slot.deadline.swap(DISARMED, Ordering::SeqCst) != DISARMED;
        while slot.in_flight.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        // The callback that was running may have re-armed its own slot.
        slot.deadline.store(DISARMED, Ordering::SeqCst);
        was_pending
    }

    /// Disarms every slot for good and waits for running callbacks to return.
    ///
    /// No callback starts after this returns, later arms are ignored.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for index in 0..self.slots.len() {
            self.cancel_sync(index);
        }
        debug!("{:?} shut down.", self);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Gets the earliest pending deadline, if any slot is armed.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.slots
            .iter()
            .map(|slot| slot.deadline.load(Ordering::SeqCst))
            .filter(|&deadline| deadline != DISARMED)
            .min()
            .map(Duration::from_nanos)
    }

    /// Fires every slot whose deadline has passed, once.
    ///
    /// A slot re-armed while being examined keeps its newer deadline and is not fired.
    ///
    /// Returns the number of callbacks that ran.
    pub fn run_expired(&self) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            return 0;
        }

        let now = self.clock.now();
        let now_nanos = as_nanos(now);
        let mut fired = 0;

        for (index, slot) in self.slots.iter().enumerate() {
            let deadline = slot.deadline.load(Ordering::SeqCst);
            if deadline == DISARMED || deadline > now_nanos {
                continue;
            }

            // Announce before claiming, so cancel_sync either wins the claim or waits for us.
            slot.in_flight.fetch_add(1, Ordering::SeqCst);
            let claimed = !self.shut_down.load(Ordering::SeqCst)
                && slot
                    .deadline
                    .compare_exchange(deadline, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();

            if claimed {
                trace!("Timer slot {} expired at {:?}.", index, now);
                slot.fires.fetch_add(1, Ordering::SeqCst);
                (slot.callback)(&Expired {
                    slot,
                    index,
                    now,
                    shut_down: &self.shut_down,
                });
                fired += 1;
            }
            slot.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fired
    }
}

/// Longest nap of an idle [TimerThread].
const IDLE_PARK: Duration = Duration::from_millis(500);

/// Background thread firing the slots of a [TimerSet] as they expire.
#[derive(Debug)]
pub struct TimerThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub fn spawn<C: Clock>(timers: Arc<TimerSet<C>>, name: &str) -> KeyResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = thread::Builder::new().name(name.to_string()).spawn({
            let stop = stop.clone();
            move || {
                timers.waker.get_or_init(thread::current);
                while !stop.load(Ordering::SeqCst) {
                    timers.run_expired();

                    let now = timers.clock().now();
                    match timers.next_deadline() {
                        Some(deadline) if deadline <= now => continue,
                        Some(deadline) => thread::park_timeout((deadline - now).min(IDLE_PARK)),
                        None => thread::park_timeout(IDLE_PARK),
                    }
                }
            }
        })?;

        debug!("Timer thread {:?} started.", name);
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) -> KeyResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::SeqCst);
        handle.thread().unpark();
        handle.join().map_err(|_| KeyError::TimerThreadPanicked)
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn counting(count: usize) -> (Vec<TimerCallback>, Arc<Mutex<Vec<(usize, Duration)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let callbacks = (0..count)
            .map(|_| {
                let log = log.clone();
                Box::new(move |expired: &Expired<'_>| {
                    log.lock().unwrap().push((expired.index(), expired.now()));
                }) as TimerCallback
            })
            .collect();
        (callbacks, log)
    }

    #[test]
    fn fires_once_at_deadline() {
        let clock = ManualClock::new();
        let (callbacks, log) = counting(1);
        let timers = TimerSet::new(clock.clone(), callbacks);

        assert!(!timers.arm(0, Duration::from_millis(10)));
        clock.advance(Duration::from_millis(9));
        assert_eq!(timers.run_expired(), 0);

        clock.advance(Duration::from_millis(1));
        assert_eq!(timers.run_expired(), 1);
        assert_eq!(timers.run_expired(), 0);
        assert!(!timers.is_pending(0));
        assert_eq!(*log.lock().unwrap(), vec![(0, Duration::from_millis(10))]);
    }

    #[test]
    fn rearm_moves_deadline_instead_of_adding_a_fire() {
        let clock = ManualClock::new();
        let (callbacks, log) = counting(1);
        let timers = TimerSet::new(clock.clone(), callbacks);

        timers.arm(0, Duration::from_millis(10));
        clock.advance(Duration::from_millis(5));
        assert!(timers.arm(0, Duration::from_millis(10)));

        clock.advance(Duration::from_millis(6));
        assert_eq!(timers.run_expired(), 0);
        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(15)));

        clock.advance(Duration::from_millis(4));
        assert_eq!(timers.run_expired(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(timers.fires(0), 1);
    }

    #[test]
    fn slots_are_independent() {
        let clock = ManualClock::new();
        let (callbacks, log) = counting(2);
        let timers = TimerSet::new(clock.clone(), callbacks);

        timers.arm(0, Duration::from_millis(10));
        timers.arm(1, Duration::from_millis(20));
        clock.advance(Duration::from_millis(10));
        assert_eq!(timers.run_expired(), 1);
        clock.advance(Duration::from_millis(10));
        assert_eq!(timers.run_expired(), 1);

        let indices: Vec<_> = log.lock().unwrap().iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn cancel_and_shutdown_prevent_fires() {
        let clock = ManualClock::new();
        let (callbacks, log) = counting(2);
        let timers = TimerSet::new(clock.clone(), callbacks);

        timers.arm(0, Duration::from_millis(1));
        assert!(timers.cancel_sync(0));
        assert!(!timers.cancel_sync(0));

        timers.arm(1, Duration::from_millis(1));
        timers.shutdown();
        assert!(!timers.arm(0, Duration::from_millis(1)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(timers.run_expired(), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn callback_can_rearm_itself() {
        let clock = ManualClock::new();
        let callbacks: Vec<TimerCallback> = vec![Box::new(|expired: &Expired<'_>| {
            expired.rearm(Duration::from_millis(100));
        })];
        let timers = TimerSet::new(clock.clone(), callbacks);

        timers.arm(0, Duration::from_millis(100));
        for round in 1..=3 {
            clock.advance(Duration::from_millis(100));
            assert_eq!(timers.run_expired(), 1);
            assert_eq!(timers.fires(0), round);
            assert!(timers.is_pending(0));
        }
    }

    #[test]
    fn thread_fires_with_system_clock() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        let callbacks: Vec<TimerCallback> = vec![Box::new(move |_: &Expired<'_>| {
            let _ = tx.lock().unwrap().send(());
        })];
        let timers = Arc::new(TimerSet::new(SystemClock::default(), callbacks));
        let mut thread = TimerThread::spawn(timers.clone(), "timer-test").unwrap();

        timers.arm(0, Duration::from_millis(5));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        timers.shutdown();
        thread.stop().unwrap();
        assert_eq!(timers.fires(0), 1);
    }

    #[test]
    fn rearm_racing_a_fire_never_loses_or_doubles_it() {
        let clock = ManualClock::new();
        clock.set(Duration::from_secs(1));
        let (callbacks, log) = counting(1);
        let timers = TimerSet::new(clock.clone(), callbacks);
        let stop = AtomicBool::new(false);

        let (fresh_arms, claimed) = thread::scope(|scope| {
            let firer = scope.spawn(|| {
                let mut claimed = 0;
                while !stop.load(Ordering::SeqCst) {
                    claimed += timers.run_expired();
                }
                claimed
            });

            let mut fresh_arms = 0;
            for _ in 0..20_000 {
                // Distinct deadlines, so a fire holding a stale one loses its claim.
                clock.advance(Duration::from_nanos(1));
                if !timers.arm(0, Duration::ZERO) {
                    fresh_arms += 1;
                }
            }
            stop.store(true, Ordering::SeqCst);
            (fresh_arms, firer.join().unwrap())
        });
        let claimed = claimed + timers.run_expired();

        // Every arm that found the slot idle starts exactly one fire.
        assert_eq!(timers.fires(0), claimed as u64);
        assert_eq!(claimed, fresh_arms);
        assert_eq!(log.lock().unwrap().len(), claimed);
        assert!(!timers.is_pending(0));
    }

    #[test]
    fn no_callback_starts_after_cancel_returns() {
        let clock = ManualClock::new();
        clock.set(Duration::from_secs(1));
        let started = Arc::new(AtomicU32::new(0));
        let running = Arc::new(AtomicBool::new(false));
        let callbacks: Vec<TimerCallback> = vec![Box::new({
            let started = started.clone();
            let running = running.clone();
            move |_: &Expired<'_>| {
                running.store(true, Ordering::SeqCst);
                started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(50));
                running.store(false, Ordering::SeqCst);
            }
        })];
        let timers = TimerSet::new(clock, callbacks);
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    timers.run_expired();
                }
            });

            for _ in 0..2_000 {
                timers.arm(0, Duration::ZERO);
                thread::yield_now();
                timers.cancel_sync(0);

                assert!(!running.load(Ordering::SeqCst));
                let before = started.load(Ordering::SeqCst);
                for _ in 0..10 {
                    thread::yield_now();
                }
                assert_eq!(started.load(Ordering::SeqCst), before);
            }
            stop.store(true, Ordering::SeqCst);
        });
        assert!(!timers.is_pending(0));
    }
}
