//! An in-memory [GpioChip], used for tests and for running without hardware.
//!
//! Every line holds its physical level in an atomic, so a test (or a simulated
//! push button) can flip it from any thread while the driver samples it.
use crate::{GpioChip, GpioError, GpioInput, GpioOutput, GpioResult, LineOptions};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Clone)]
pub struct SimChip {
    inner: Arc<SimChipInner>,
}

struct SimChipInner {
    name: String,
    lines: Box<[SimLine]>,
}

#[derive(Default)]
struct SimLine {
    level: AtomicBool,
    requested: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl SimChip {
    /// Creates a chip with `count` lines, all idling high (as with pull-ups).
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        let lines = (0..count)
            .map(|_| SimLine {
                level: AtomicBool::new(true),
                ..SimLine::default()
            })
            .collect();
        Self {
            inner: Arc::new(SimChipInner {
                name: name.into(),
                lines,
            }),
        }
    }

    fn line(&self, offset: u32) -> GpioResult<&SimLine> {
        self.inner
            .lines
            .get(offset as usize)
            .ok_or(GpioError::InvalidArgument)
    }

    /// Drives the physical level of a line, as the outside world would.
    pub fn set_level(&self, offset: u32, level: bool) -> GpioResult<()> {
        self.line(offset)?.level.store(level, Ordering::SeqCst);
        Ok(())
    }

    /// Gets the physical level of a line.
    pub fn level(&self, offset: u32) -> GpioResult<bool> {
        Ok(self.line(offset)?.level.load(Ordering::SeqCst))
    }

    /// Gets how many times the line was sampled through an input handle.
    pub fn reads(&self, offset: u32) -> GpioResult<usize> {
        Ok(self.line(offset)?.reads.load(Ordering::SeqCst))
    }

    /// Gets how many times the line was driven through an output handle.
    pub fn writes(&self, offset: u32) -> GpioResult<usize> {
        Ok(self.line(offset)?.writes.load(Ordering::SeqCst))
    }

    /// Gets whether some handle currently holds the line.
    pub fn is_requested(&self, offset: u32) -> GpioResult<bool> {
        Ok(self.line(offset)?.requested.load(Ordering::SeqCst))
    }

    fn claim(&self, offset: u32) -> GpioResult<()> {
        let line = self.line(offset)?;
        if line.requested.swap(true, Ordering::SeqCst) {
            return Err(GpioError::AlreadyInUse);
        }
        Ok(())
    }
}

impl Debug for SimChip {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimChip({})", self.inner.name)
    }
}

impl GpioChip for SimChip {
    fn count(&self) -> usize {
        self.inner.lines.len()
    }

    /// A biased input starts out at the level its bias pulls it to.
    fn request_input(&self, offset: u32, options: LineOptions) -> GpioResult<Arc<dyn GpioInput>> {
        self.claim(offset)?;
        if let Some(level) = options.bias.idle_level() {
            self.set_level(offset, level)?;
        }
        Ok(Arc::new(SimInput {
            handle: SimHandle { chip: self.clone(), offset },
            options,
        }))
    }

    fn request_output(
        &self,
        offset: u32,
        options: LineOptions,
        initial: bool,
    ) -> GpioResult<Arc<dyn GpioOutput>> {
        self.claim(offset)?;
        let output = SimOutput {
            handle: SimHandle { chip: self.clone(), offset },
            options,
        };
        output.write(initial)?;
        Ok(Arc::new(output))
    }
}

struct SimHandle {
    chip: SimChip,
    offset: u32,
}

impl SimHandle {
    fn line(&self) -> &SimLine {
        // The offset was validated when the handle was created.
        &self.chip.inner.lines[self.offset as usize]
    }
}

impl Debug for SimHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.chip, self.offset)
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.line().requested.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct SimInput {
    handle: SimHandle,
    options: LineOptions,
}

impl GpioInput for SimInput {
    fn read(&self) -> GpioResult<bool> {
        let line = self.handle.line();
        line.reads.fetch_add(1, Ordering::SeqCst);
        let level = line.level.load(Ordering::SeqCst);
        Ok(self.options.active_level.get_state(level))
    }
}

#[derive(Debug)]
struct SimOutput {
    handle: SimHandle,
    options: LineOptions,
}

impl GpioOutput for SimOutput {
    fn write(&self, value: bool) -> GpioResult<()> {
        let line = self.handle.line();
        line.writes.fetch_add(1, Ordering::SeqCst);
        line.level
            .store(self.options.active_level.get_state(value), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GpioActiveLevel, GpioBias};

    #[test]
    fn lines_idle_high_and_count_reads() {
        let chip = SimChip::new("sim", 4);
        let input = chip.request_input(2, LineOptions::default()).unwrap();

        assert!(input.read().unwrap());
        chip.set_level(2, false).unwrap();
        assert!(!input.read().unwrap());
        assert_eq!(chip.reads(2).unwrap(), 2);
    }

    #[test]
    fn lines_are_exclusive_until_dropped() {
        let chip = SimChip::new("sim", 1);
        let input = chip.request_input(0, LineOptions::default()).unwrap();

        assert_eq!(
            chip.request_input(0, LineOptions::default()).unwrap_err(),
            GpioError::AlreadyInUse
        );
        drop(input);
        assert!(!chip.is_requested(0).unwrap());
        assert!(chip.request_input(0, LineOptions::default()).is_ok());
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let chip = SimChip::new("sim", 1);
        assert_eq!(
            chip.request_input(1, LineOptions::default()).unwrap_err(),
            GpioError::InvalidArgument
        );
    }

    #[test]
    fn active_low_output_drives_inverted_level() {
        let chip = SimChip::new("sim", 1);
        let led = chip
            .request_output(0, LineOptions::default().with_active_level(GpioActiveLevel::Low), false)
            .unwrap();

        assert!(chip.level(0).unwrap());
        led.write(true).unwrap();
        assert!(!chip.level(0).unwrap());
        assert_eq!(chip.writes(0).unwrap(), 2);
    }

    #[test]
    fn bias_sets_the_idle_level() {
        let chip = SimChip::new("sim", 2);
        let pulled_down = chip
            .request_input(0, LineOptions::default().with_bias(GpioBias::PullDown))
            .unwrap();
        assert!(!pulled_down.read().unwrap());

        chip.set_level(1, false).unwrap();
        let floating = chip.request_input(1, LineOptions::default()).unwrap();
        assert!(!floating.read().unwrap());
    }
}
