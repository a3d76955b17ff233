//! [GpioChip] implementation backed by the Linux GPIO character device, using the gpiod library.
use crate::{
    GpioActiveLevel, GpioBias, GpioChip, GpioError, GpioInput, GpioOutput, GpioResult,
    LineOptions,
};
use bitvec::vec::BitVec;
use log::debug;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;

/// A GPIO chip opened through `/dev/gpiochipN`.
///
/// Cloning is cheap, all clones share the same chip and line bookkeeping.
#[derive(Clone)]
pub struct GpiodChip {
    inner: Arc<GpiodChipInner>,
}

struct GpiodChipInner {
    chip: gpiod::Chip,
    used_lines: BitVec<AtomicU8>,
}

impl GpiodChip {
    pub fn new(chip: gpiod::Chip) -> Self {
        let n = chip.num_lines() as usize;
        let bits = BitVec::repeat(false, n);
        Self {
            inner: Arc::new(GpiodChipInner {
                chip,
                used_lines: bits,
            }),
        }
    }

    /// Opens the chip at the given path, e.g. `/dev/gpiochip0`.
    pub fn open(path: impl AsRef<Path>) -> GpioResult<Self> {
        let chip = gpiod::Chip::new(path.as_ref())?;
        let chip = Self::new(chip);
        debug!("{:?} opened with {} lines.", chip, chip.count());
        Ok(chip)
    }

    fn claim(&self, offset: u32) -> GpioResult<()> {
        let index = offset as usize;
        if index >= self.count() {
            return Err(GpioError::InvalidArgument);
        }

        if self.inner.used_lines[index] {
            return Err(GpioError::AlreadyInUse);
        }

        self.inner.used_lines.set_aliased(index, true);
        Ok(())
    }
}

impl Debug for GpiodChip {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpiodChip({})", self.inner.chip.name())
    }
}

impl From<GpioActiveLevel> for gpiod::Active {
    fn from(level: GpioActiveLevel) -> Self {
        match level {
            GpioActiveLevel::High => gpiod::Active::High,
            GpioActiveLevel::Low => gpiod::Active::Low,
        }
    }
}

impl From<GpioBias> for gpiod::Bias {
    fn from(bias: GpioBias) -> Self {
        match bias {
            GpioBias::None => gpiod::Bias::Disable,
            GpioBias::PullUp => gpiod::Bias::PullUp,
            GpioBias::PullDown => gpiod::Bias::PullDown,
        }
    }
}

impl GpioChip for GpiodChip {
    fn count(&self) -> usize {
        self.inner.chip.num_lines() as usize
    }

    fn request_input(&self, offset: u32, options: LineOptions) -> GpioResult<Arc<dyn GpioInput>> {
        self.claim(offset)?;
        let claim = LineClaim { chip: self.clone(), offset };

        let line = self.inner.chip.request_lines(
            gpiod::Options::input([offset])
                .consumer(env!("CARGO_PKG_NAME"))
                .active(options.active_level.into())
                .bias(options.bias.into()),
        )?;
        Ok(Arc::new(GpiodInput { claim, line }))
    }

    fn request_output(
        &self,
        offset: u32,
        options: LineOptions,
        initial: bool,
    ) -> GpioResult<Arc<dyn GpioOutput>> {
        self.claim(offset)?;
        let claim = LineClaim { chip: self.clone(), offset };

        let line = self.inner.chip.request_lines(
            gpiod::Options::output([offset])
                .consumer(env!("CARGO_PKG_NAME"))
                .active(options.active_level.into())
                .bias(options.bias.into()),
        )?;
        line.set_values([initial])?;
        Ok(Arc::new(GpiodOutput { claim, line }))
    }
}

/// Marks a line as used for as long as it lives.
struct LineClaim {
    chip: GpiodChip,
    offset: u32,
}

impl Debug for LineClaim {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.chip, self.offset)
    }
}

impl Drop for LineClaim {
    fn drop(&mut self) {
        self.chip.inner.used_lines.set_aliased(self.offset as usize, false);
    }
}

struct GpiodInput {
    claim: LineClaim,
    line: gpiod::Lines<gpiod::Input>,
}

impl Debug for GpiodInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[input]", self.claim)
    }
}

impl GpioInput for GpiodInput {
    fn read(&self) -> GpioResult<bool> {
        let values = self.line.get_values([false])?;
        Ok(values[0])
    }
}

struct GpiodOutput {
    claim: LineClaim,
    line: gpiod::Lines<gpiod::Output>,
}

impl Debug for GpiodOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[output]", self.claim)
    }
}

impl GpioOutput for GpiodOutput {
    fn write(&self, value: bool) -> GpioResult<()> {
        self.line.set_values([value])?;
        Ok(())
    }
}
