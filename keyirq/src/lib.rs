//! Interrupt-driven key driver.
//!
//! An edge on a key line arms a per-key debounce timer, the timer samples the
//! settled level from a deferred context and publishes it through lock-free
//! [SharedKeyState], and a reader drains it one byte at a time.
//!
//! ```text
//! edge ─▶ interrupt source ─▶ debounce timer ─▶ shared key state ─▶ read()
//! ```

pub mod blink;
pub mod chrdev;
pub mod config;
pub mod devnum;
pub mod driver;
pub mod irq;
pub mod keys;
pub mod polled;
pub mod sim;
pub mod state;
pub mod timer;
pub mod topology;

pub use config::{DriverConfig, KeyConfig};
pub use driver::{KeyFile, KeyIrqDriver, Platform, TimerMode};
pub use state::{ConsumeError, SharedKeyState};

use irq::IrqId;
use keyirq_gpio::GpioError;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum KeyError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),
    #[error("IO error: {0}")]
    Io(std::io::ErrorKind),
    #[error("{configured} keys configured but the hardware describes only {available}")]
    TopologyMismatch { configured: usize, available: usize },
    #[error("can't find the line of key {index}")]
    MissingLine { index: usize },
    #[error("can't find the interrupt of key {index}")]
    MissingInterrupt { index: usize },
    #[error("interrupt {0} is already registered")]
    IrqBusy(IrqId),
    #[error("interrupt {0} is not known to the controller")]
    UnknownIrq(IrqId),
    #[error("no keys configured")]
    NoKeys,
    #[error("{count} keys configured, at most {max} supported", max = keys::MAX_KEYS)]
    TooManyKeys { count: usize },
    #[error("key {index} reports invalid code {code:#04x}")]
    InvalidCode { index: usize, code: u8 },
    #[error("debounce delay must be at least 1 ms")]
    InvalidDebounceDelay,
    #[error("major number {0} is already registered")]
    MajorBusy(u32),
    #[error("no free major number left")]
    NoFreeMajor,
    #[error("device is busy")]
    Busy,
    #[error("no key event available")]
    NoData,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("timer thread panicked")]
    TimerThreadPanicked,
}

impl From<std::io::Error> for KeyError {
    fn from(err: std::io::Error) -> Self {
        KeyError::Io(err.kind())
    }
}

pub type KeyResult<T> = Result<T, KeyError>;
