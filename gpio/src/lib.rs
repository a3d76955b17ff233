pub mod gpiod;
pub mod debounce;
pub mod sim;

use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum GpioError {
    #[error("line already in use")]
    AlreadyInUse,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("IO error: {0}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for GpioError {
    fn from(err: std::io::Error) -> Self {
        GpioError::Io(err.kind())
    }
}

pub type GpioResult<T> = Result<T, GpioError>;

/// A GPIO chip handing out individual lines.
///
/// Requested lines are reference counted so they can be shared between the
/// interrupt, timer and reader contexts. A line is released once the last
/// handle to it is dropped.
pub trait GpioChip: Debug + Send + Sync {
    /// Gets the amount of GPIO lines available on the chip.
    fn count(&self) -> usize;

    /// Requests the line at the given offset as an input.
    ///
    /// # Errors
    /// - `GpioError::InvalidArgument` if the offset is out of range.
    /// - `GpioError::AlreadyInUse` if the line was already requested.
    fn request_input(&self, offset: u32, options: LineOptions) -> GpioResult<Arc<dyn GpioInput>>;

    /// Requests the line at the given offset as an output, driven to `initial` right away.
    ///
    /// # Errors
    /// - `GpioError::InvalidArgument` if the offset is out of range.
    /// - `GpioError::AlreadyInUse` if the line was already requested.
    fn request_output(
        &self,
        offset: u32,
        options: LineOptions,
        initial: bool,
    ) -> GpioResult<Arc<dyn GpioOutput>>;
}

/// Specifies the active level of the GPIO line.
///
/// By default, the active level is high.
///
/// Might be software-implemented.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioActiveLevel {
    #[default] High,
    Low,
}

impl GpioActiveLevel {
    /// Gets the real state that will be on the GPIO line based on the active level and the value.
    pub fn get_state(&self, value: bool) -> bool {
        match self {
            GpioActiveLevel::High => value,
            GpioActiveLevel::Low => !value,
        }
    }
}

/// Specifies the bias of the GPIO line.
///
/// You can use this to enable pull-up or pull-down resistors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioBias {
    #[default] None,
    PullUp,
    PullDown,
}

impl GpioBias {
    /// Gets the level a floating line settles at with this bias, if any.
    pub fn idle_level(&self) -> Option<bool> {
        match self {
            GpioBias::None => None,
            GpioBias::PullUp => Some(true),
            GpioBias::PullDown => Some(false),
        }
    }
}

/// Options applied when requesting a line.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LineOptions {
    pub active_level: GpioActiveLevel,
    pub bias: GpioBias,
}

impl LineOptions {
    pub fn with_active_level(mut self, level: GpioActiveLevel) -> Self {
        self.active_level = level;
        self
    }

    pub fn with_bias(mut self, bias: GpioBias) -> Self {
        self.bias = bias;
        self
    }
}

pub trait GpioInput: Debug + Send + Sync {
    /// Reads the logical state of the GPIO line.
    fn read(&self) -> GpioResult<bool>;
}

pub trait GpioOutput: Debug + Send + Sync {
    /// Writes the logical state of the GPIO line.
    fn write(&self, value: bool) -> GpioResult<()>;
}
