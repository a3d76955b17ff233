//! Hardware topology: which line and which interrupt belong to each key.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use log::warn;
use keyirq_gpio::{GpioBias, GpioChip, GpioInput, LineOptions};
use crate::irq::{IrqId, PolledInterrupts};
use crate::{KeyError, KeyResult};

/// Resolves the hardware behind each key index.
pub trait Topology: Debug {
    fn key_count(&self) -> usize;

    /// # Errors
    /// - `KeyError::MissingLine` if the key has no usable line.
    fn resolve_line(&self, index: usize) -> KeyResult<Arc<dyn GpioInput>>;

    /// # Errors
    /// - `KeyError::MissingInterrupt` if the key's line can't interrupt.
    fn resolve_irq(&self, index: usize) -> KeyResult<IrqId>;
}

/// Keys wired to lines of a [GpioChip], pulled up and active low.
///
/// The interrupt of a key is numbered after its line offset.
#[derive(Debug)]
pub struct ChipTopology {
    lines: Vec<(u32, Option<Arc<dyn GpioInput>>)>,
}

impl ChipTopology {
    /// Requests every offset as an input. Lines that can't be requested are
    /// remembered as missing and reported when resolved.
    pub fn resolve_all(chip: &dyn GpioChip, offsets: impl IntoIterator<Item = u32>) -> Self {
        let options = LineOptions::default().with_bias(GpioBias::PullUp);
        let lines = offsets
            .into_iter()
            .map(|offset| match chip.request_input(offset, options) {
                Ok(line) => (offset, Some(line)),
                Err(err) => {
                    warn!("Can't request line {} of {:?}: {}", offset, chip, err);
                    (offset, None)
                }
            })
            .collect();
        Self { lines }
    }

    /// Builds a software interrupt controller sampling every resolved line.
    pub fn polled_interrupts(&self, period: Duration) -> PolledInterrupts {
        let mut irqs = PolledInterrupts::new(period);
        for (offset, line) in &self.lines {
            if let Some(line) = line {
                irqs.add_line(IrqId(*offset), line.clone());
            }
        }
        irqs
    }
}

impl Topology for ChipTopology {
    fn key_count(&self) -> usize {
        self.lines.len()
    }

    fn resolve_line(&self, index: usize) -> KeyResult<Arc<dyn GpioInput>> {
        match self.lines.get(index) {
            Some((_, Some(line))) => Ok(line.clone()),
            _ => Err(KeyError::MissingLine { index }),
        }
    }

    fn resolve_irq(&self, index: usize) -> KeyResult<IrqId> {
        match self.lines.get(index) {
            Some((offset, Some(_))) => Ok(IrqId(*offset)),
            _ => Err(KeyError::MissingInterrupt { index }),
        }
    }
}
