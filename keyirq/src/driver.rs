//! The interrupt-driven key driver: wiring, reads and teardown.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, trace, warn};
use crate::chrdev::{OpenGuard, SingleOpen};
use crate::config::DriverConfig;
use crate::devnum::{ChrdevRegion, ChrdevRegistry, DeviceNumber};
use crate::irq::{InterruptController, IrqHandler, IrqRegistration, Trigger};
use crate::keys::KeyTable;
use crate::state::{ConsumeError, SharedKeyState};
use crate::timer::{Clock, Expired, SystemClock, TimerCallback, TimerSet, TimerThread};
use crate::KeyResult;

/// The outside collaborators the driver is wired to.
#[derive(Copy, Clone, Debug)]
pub struct Platform<'a> {
    pub topology: &'a dyn crate::topology::Topology,
    pub interrupts: &'a dyn InterruptController,
    pub chrdevs: &'a ChrdevRegistry,
}

/// Who fires expired debounce timers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TimerMode {
    /// A background thread.
    #[default]
    Threaded,
    /// Nobody: the owner calls [KeyIrqDriver::run_expired_timers].
    Manual,
}

pub struct KeyIrqDriver<C: Clock = SystemClock> {
    name: String,
    debounce_delay: Duration,
    keys: Arc<KeyTable>,
    state: Arc<SharedKeyState>,
    timers: Arc<TimerSet<C>>,
    timer_thread: Option<TimerThread>,
    registrations: Vec<IrqRegistration>,
    region: Option<ChrdevRegion>,
    access: SingleOpen,
    torn_down: bool,
}

impl KeyIrqDriver<SystemClock> {
    /// Loads the driver with a timer thread on the system clock.
    pub fn init(config: &DriverConfig, platform: Platform<'_>) -> KeyResult<Self> {
        Self::init_with_clock(config, platform, SystemClock::default(), TimerMode::Threaded)
    }
}

impl<C: Clock> KeyIrqDriver<C> {
    /// Loads the driver.
    ///
    /// Resolves every key, registers its interrupt for both edges and leaves
    /// every debounce timer disarmed and the key state at its sentinel.
    /// Any failure aborts the whole load; whatever was set up is torn down again.
    pub fn init_with_clock(
        config: &DriverConfig,
        platform: Platform<'_>,
        clock: C,
        mode: TimerMode,
    ) -> KeyResult<Self> {
        config.validate()?;
        info!("Loading {}...", config.name);

        let region = platform.chrdevs.register(config.major, 1, &config.name)?;
        let keys = Arc::new(KeyTable::build(config, platform.topology)?);
        let state = Arc::new(SharedKeyState::new());

        let callbacks = (0..keys.len())
            .map(|index| debounce_callback(keys.clone(), state.clone(), index))
            .collect();
        let timers = Arc::new(TimerSet::new(clock, callbacks));

        let mut driver = KeyIrqDriver {
            name: config.name.clone(),
            debounce_delay: config.debounce_delay(),
            keys,
            state,
            timers,
            timer_thread: None,
            registrations: Vec::new(),
            region: Some(region),
            access: SingleOpen::new(),
            torn_down: false,
        };

        if mode == TimerMode::Threaded {
            let thread = TimerThread::spawn(driver.timers.clone(), &format!("{}-timer", config.name))?;
            driver.timer_thread = Some(thread);
        }

        for (index, key) in driver.keys.iter().enumerate() {
            let handler = interrupt_source(driver.timers.clone(), index, driver.debounce_delay);
            let registration =
                platform
                    .interrupts
                    .request_irq(key.irq(), Trigger::Both, key.name(), handler)?;
            debug!("{}: irq {} registered.", key.name(), key.irq());
            driver.registrations.push(registration);
        }

        info!(
            "{} loaded: {} keys, debounce {:?}, device {}.",
            driver.name,
            driver.keys.len(),
            driver.debounce_delay,
            driver.device_number().map(|n| n.to_string()).unwrap_or_default(),
        );
        Ok(driver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debounce_delay(&self) -> Duration {
        self.debounce_delay
    }

    pub fn keys(&self) -> &KeyTable {
        &self.keys
    }

    pub fn device_number(&self) -> Option<DeviceNumber> {
        self.region.as_ref().map(ChrdevRegion::first)
    }

    /// Shared key state. Stays valid after teardown.
    pub fn state(&self) -> Arc<SharedKeyState> {
        self.state.clone()
    }

    pub fn timers(&self) -> &TimerSet<C> {
        &self.timers
    }

    /// Fires due debounce timers on the calling thread, for [TimerMode::Manual].
    pub fn run_expired_timers(&self) -> usize {
        self.timers.run_expired()
    }

    /// Raw current code, without consuming anything.
    pub fn peek(&self) -> u8 {
        self.state.peek()
    }

    /// Takes the pending key event, see [SharedKeyState::consume].
    pub fn consume(&self) -> Result<u8, ConsumeError> {
        self.state.consume()
    }

    /// Opens the device for reading. Only one reader may hold it at a time.
    ///
    /// # Errors
    /// - `KeyError::Busy` if another [KeyFile] is alive.
    pub fn open(&self) -> KeyResult<KeyFile<'_>> {
        let guard = self.access.acquire()?;
        Ok(KeyFile {
            state: &self.state,
            _guard: guard,
        })
    }

    /// Unloads the driver.
    ///
    /// Cancels every debounce timer and waits for a running callback to
    /// return, then frees the interrupts, then releases the lines.
    pub fn teardown(mut self) -> KeyResult<()> {
        self.teardown_inner()
    }

    fn teardown_inner(&mut self) -> KeyResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        self.timers.shutdown();
        let stopped = match self.timer_thread.take() {
            Some(mut thread) => thread.stop(),
            None => Ok(()),
        };

        self.registrations.clear();
        self.region = None;
        info!("{} unloaded.", self.name);
        stopped
    }
}

impl<C: Clock> Debug for KeyIrqDriver<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIrqDriver")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("debounce_delay", &self.debounce_delay)
            .field("state", &self.state)
            .finish()
    }
}

impl<C: Clock> Drop for KeyIrqDriver<C> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown_inner() {
            warn!("{}: teardown failed: {}", self.name, err);
        }
    }
}

/// The open device. Reads are non-blocking.
#[derive(Debug)]
pub struct KeyFile<'a> {
    state: &'a SharedKeyState,
    _guard: OpenGuard<'a>,
}

impl KeyFile<'_> {
    /// Reads one key event.
    ///
    /// On success exactly one byte is written: the key code, bit 7 clear.
    ///
    /// # Errors
    /// - `KeyError::NoData` if no event is pending, nothing is written then.
    /// - `KeyError::InvalidArgument` if `buf` is empty.
    pub fn read(&self, buf: &mut [u8]) -> KeyResult<usize> {
        self.state.read_into(buf)
    }
}

/// The interrupt handler of key `index`: (re)arms its debounce timer and returns.
///
/// Every further edge within the window pushes the deadline out, so only the
/// level after the last bounce gets sampled.
fn interrupt_source<C: Clock>(timers: Arc<TimerSet<C>>, index: usize, delay: Duration) -> IrqHandler {
    Arc::new(move || {
        timers.arm(index, delay);
    })
}

/// The debounce timer callback of key `index`: samples the settled level and
/// publishes it.
fn debounce_callback(keys: Arc<KeyTable>, state: Arc<SharedKeyState>, index: usize) -> TimerCallback {
    Box::new(move |expired: &Expired<'_>| {
        let Some(key) = keys.get(index) else {
            return;
        };

        match key.is_pressed() {
            Ok(true) => {
                state.record_press(key.reported_code());
                trace!("{} pressed at {:?}.", key.name(), expired.now());
            }
            Ok(false) => {
                state.record_release(key.reported_code());
                trace!("{} released at {:?}.", key.name(), expired.now());
            }
            Err(err) => warn!("{}: can't sample line: {}", key.name(), err),
        }
    })
}
