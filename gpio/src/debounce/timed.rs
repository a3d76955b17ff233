use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use crate::{GpioInput, GpioResult};

const UNKNOWN: u8 = 0;
const LOW: u8 = 1;
const HIGH: u8 = 2;

fn encode(level: bool) -> u8 {
    if level { HIGH } else { LOW }
}

/// A debounced GPIO input that uses a timer to filter out noise.
///
/// A new level is only reported once the raw input held it for at least
/// [`debounce_time`](Self::debounce_time).
pub struct TimedDebounce<'a> {
    input: &'a dyn GpioInput,
    origin: Instant,
    state: AtomicU8,
    candidate: AtomicU8,
    /// Nanoseconds after `origin` the candidate level was first seen.
    candidate_since: AtomicU64,
    pub debounce_time: Duration,
}

impl <'a> TimedDebounce<'a> {
    pub fn new(input: &'a dyn GpioInput) -> Self {
        Self {
            input,
            origin: Instant::now(),
            state: AtomicU8::new(UNKNOWN),
            candidate: AtomicU8::new(UNKNOWN),
            candidate_since: AtomicU64::new(0),
            debounce_time: Duration::from_millis(50),
        }
    }

    pub fn with_debounce_time(mut self, debounce_time: Duration) -> Self {
        self.debounce_time = debounce_time;
        self
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Debug for TimedDebounce<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(debounced)", self.input)
    }
}

impl GpioInput for TimedDebounce<'_> {
    fn read(&self) -> GpioResult<bool> {
        let raw = self.input.read()?;
        let raw_state = encode(raw);

        let stable = self.state.load(Ordering::Acquire);
        if stable == UNKNOWN {
            // First sample, nothing to compare against yet.
            self.state.store(raw_state, Ordering::Release);
            return Ok(raw);
        }

        if raw_state == stable {
            self.candidate.store(UNKNOWN, Ordering::Release);
            return Ok(stable == HIGH);
        }

        let now = self.elapsed_nanos();
        if self.candidate.load(Ordering::Acquire) == raw_state {
            let since = self.candidate_since.load(Ordering::Acquire);
            if Duration::from_nanos(now.saturating_sub(since)) >= self.debounce_time {
                self.candidate.store(UNKNOWN, Ordering::Release);
                self.state.store(raw_state, Ordering::Release);
                return Ok(raw);
            }
        } else {
            self.candidate_since.store(now, Ordering::Release);
            self.candidate.store(raw_state, Ordering::Release);
        }

        Ok(stable == HIGH)
    }
}
