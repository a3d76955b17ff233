//! Periodic LED blinking driven by a self re-arming timer.
//!
//! Controlled with the three timer commands of the driver family: close,
//! open and set period.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use log::{debug, warn};
use keyirq_gpio::GpioOutput;
use crate::timer::{Clock, Expired, SystemClock, TimerSet, TimerThread};
use crate::{KeyError, KeyResult, TimerMode};

pub const DEFAULT_PERIOD_MS: u32 = 1000;

const IOC_TYPE: u32 = 0xEF;

/// `_IO(type, nr)`: no direction, no size.
const fn io(nr: u32) -> u32 {
    IOC_TYPE << 8 | nr
}

pub const CLOSE_CMD: u32 = io(1);
pub const OPEN_CMD: u32 = io(2);
pub const SETPERIOD_CMD: u32 = io(3);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlinkCommand {
    /// Stops blinking, waiting for a toggle in progress.
    Close,
    /// Starts blinking with the current period.
    Open,
    /// Sets the period in milliseconds and restarts blinking with it.
    SetPeriod(u32),
}

impl BlinkCommand {
    /// Decodes an ioctl request.
    ///
    /// # Errors
    /// - `KeyError::InvalidArgument` for an unknown command or an out of range period.
    pub fn decode(cmd: u32, arg: u64) -> KeyResult<Self> {
        match cmd {
            CLOSE_CMD => Ok(BlinkCommand::Close),
            OPEN_CMD => Ok(BlinkCommand::Open),
            SETPERIOD_CMD => u32::try_from(arg)
                .map(BlinkCommand::SetPeriod)
                .map_err(|_| KeyError::InvalidArgument),
            _ => Err(KeyError::InvalidArgument),
        }
    }
}

struct BlinkShared {
    led: Arc<dyn GpioOutput>,
    lit: AtomicBool,
    period_ms: Mutex<u32>,
}

impl BlinkShared {
    fn period(&self) -> Duration {
        let period_ms = *self.period_ms.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_millis(period_ms.into())
    }
}

const SLOT: usize = 0;

pub struct BlinkTimer<C: Clock = SystemClock> {
    shared: Arc<BlinkShared>,
    timers: Arc<TimerSet<C>>,
    thread: Option<TimerThread>,
}

impl BlinkTimer<SystemClock> {
    pub fn new(led: Arc<dyn GpioOutput>) -> KeyResult<Self> {
        Self::with_clock(led, SystemClock::default(), TimerMode::Threaded)
    }
}

impl<C: Clock> BlinkTimer<C> {
    /// Creates a stopped blinker with the LED switched off.
    pub fn with_clock(led: Arc<dyn GpioOutput>, clock: C, mode: TimerMode) -> KeyResult<Self> {
        led.write(false)?;
        let shared = Arc::new(BlinkShared {
            led,
            lit: AtomicBool::new(false),
            period_ms: Mutex::new(DEFAULT_PERIOD_MS),
        });

        let callback = {
            let shared = shared.clone();
            Box::new(move |expired: &Expired<'_>| {
                let lit = !shared.lit.fetch_xor(true, Ordering::AcqRel);
                if let Err(err) = shared.led.write(lit) {
                    warn!("Can't toggle {:?}: {}", shared.led, err);
                }
                expired.rearm(shared.period());
            }) as crate::timer::TimerCallback
        };
        let timers = Arc::new(TimerSet::new(clock, vec![callback]));

        let thread = match mode {
            TimerMode::Threaded => Some(TimerThread::spawn(timers.clone(), "blink-timer")?),
            TimerMode::Manual => None,
        };

        Ok(Self { shared, timers, thread })
    }

    pub fn command(&self, command: BlinkCommand) -> KeyResult<()> {
        debug!("Blink command {:?}.", command);
        match command {
            BlinkCommand::Close => {
                self.timers.cancel_sync(SLOT);
            }
            BlinkCommand::Open => {
                self.timers.arm(SLOT, self.shared.period());
            }
            BlinkCommand::SetPeriod(0) => return Err(KeyError::InvalidArgument),
            BlinkCommand::SetPeriod(period_ms) => {
                *self
                    .shared
                    .period_ms
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = period_ms;
                self.timers.arm(SLOT, Duration::from_millis(period_ms.into()));
            }
        }
        Ok(())
    }

    /// Decodes and runs an ioctl request.
    pub fn ioctl(&self, cmd: u32, arg: u64) -> KeyResult<()> {
        self.command(BlinkCommand::decode(cmd, arg)?)
    }

    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    pub fn is_running(&self) -> bool {
        self.timers.is_pending(SLOT)
    }

    pub fn is_lit(&self) -> bool {
        self.shared.lit.load(Ordering::Acquire)
    }

    /// Fires a due toggle on the calling thread, for [TimerMode::Manual].
    pub fn run_expired_timers(&self) -> usize {
        self.timers.run_expired()
    }
}

impl<C: Clock> Debug for BlinkTimer<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlinkTimer({:?}, {:?})", self.shared.led, self.period())
    }
}

impl<C: Clock> Drop for BlinkTimer<C> {
    fn drop(&mut self) {
        self.timers.shutdown();
        if let Some(mut thread) = self.thread.take() {
            let _ = thread.stop();
        }
        if let Err(err) = self.shared.led.write(false) {
            warn!("Can't switch off {:?}: {}", self.shared.led, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;
    use keyirq_gpio::sim::SimChip;
    use keyirq_gpio::{GpioActiveLevel, GpioChip, LineOptions};

    fn blinker() -> (SimChip, ManualClock, BlinkTimer<ManualClock>) {
        let chip = SimChip::new("sim", 1);
        let options = LineOptions::default().with_active_level(GpioActiveLevel::Low);
        let led = chip.request_output(0, options, false).unwrap();
        let clock = ManualClock::new();
        let blink = BlinkTimer::with_clock(led, clock.clone(), TimerMode::Manual).unwrap();
        (chip, clock, blink)
    }

    #[test]
    fn decodes_ioctl_numbers() {
        assert_eq!(CLOSE_CMD, 0xEF01);
        assert_eq!(BlinkCommand::decode(OPEN_CMD, 0), Ok(BlinkCommand::Open));
        assert_eq!(BlinkCommand::decode(SETPERIOD_CMD, 250), Ok(BlinkCommand::SetPeriod(250)));
        assert_eq!(BlinkCommand::decode(0xEF04, 0), Err(KeyError::InvalidArgument));
        assert_eq!(
            BlinkCommand::decode(SETPERIOD_CMD, u64::MAX),
            Err(KeyError::InvalidArgument)
        );
    }

    #[test]
    fn toggles_every_period_once_opened() {
        let (chip, clock, blink) = blinker();
        assert!(!blink.is_running());

        blink.command(BlinkCommand::Open).unwrap();
        clock.advance(Duration::from_millis(999));
        assert_eq!(blink.run_expired_timers(), 0);

        clock.advance(Duration::from_millis(1));
        assert_eq!(blink.run_expired_timers(), 1);
        assert!(blink.is_lit());
        // Active low: lit means the line is pulled down.
        assert!(!chip.level(0).unwrap());

        clock.advance(Duration::from_millis(1000));
        assert_eq!(blink.run_expired_timers(), 1);
        assert!(!blink.is_lit());
        assert!(blink.is_running());
    }

    #[test]
    fn set_period_restarts_with_new_period() {
        let (_chip, clock, blink) = blinker();

        blink.ioctl(SETPERIOD_CMD, 200).unwrap();
        assert_eq!(blink.period(), Duration::from_millis(200));
        clock.advance(Duration::from_millis(200));
        assert_eq!(blink.run_expired_timers(), 1);
        clock.advance(Duration::from_millis(200));
        assert_eq!(blink.run_expired_timers(), 1);

        assert_eq!(blink.command(BlinkCommand::SetPeriod(0)), Err(KeyError::InvalidArgument));
    }

    #[test]
    fn close_stops_blinking() {
        let (_chip, clock, blink) = blinker();

        blink.command(BlinkCommand::Open).unwrap();
        blink.ioctl(CLOSE_CMD, 0).unwrap();
        assert!(!blink.is_running());

        clock.advance(Duration::from_secs(5));
        assert_eq!(blink.run_expired_timers(), 0);
    }

    #[test]
    fn drop_switches_the_led_off() {
        let (chip, clock, blink) = blinker();

        blink.command(BlinkCommand::Open).unwrap();
        clock.advance(Duration::from_millis(1000));
        blink.run_expired_timers();
        assert!(!chip.level(0).unwrap());

        drop(blink);
        assert!(chip.level(0).unwrap());
        assert!(!chip.is_requested(0).unwrap());
    }
}
