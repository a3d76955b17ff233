//! A simulated board: push buttons on a [SimChip] raising [SimInterrupts].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use keyirq_gpio::sim::SimChip;
use keyirq_gpio::{GpioBias, GpioChip, GpioInput, LineOptions};
use crate::config::KeyConfig;
use crate::devnum::ChrdevRegistry;
use crate::driver::Platform;
use crate::irq::{Edge, IrqId, SimInterrupts};
use crate::topology::Topology;
use crate::{KeyError, KeyResult};

/// Buttons pull their line low when pressed. Each line interrupts as the
/// [IrqId] of its offset.
#[derive(Debug)]
pub struct SimBoard {
    chip: SimChip,
    interrupts: SimInterrupts,
    offsets: Vec<u32>,
    irq_missing: Vec<AtomicBool>,
}

impl SimBoard {
    pub fn new(keys: &[KeyConfig]) -> Self {
        let offsets: Vec<u32> = keys.iter().map(|key| key.line).collect();
        let count = offsets.iter().max().map_or(0, |&max| max as usize + 1);
        Self {
            chip: SimChip::new("sim-board", count),
            interrupts: SimInterrupts::new(),
            irq_missing: offsets.iter().map(|_| AtomicBool::new(false)).collect(),
            offsets,
        }
    }

    pub fn chip(&self) -> &SimChip {
        &self.chip
    }

    pub fn interrupts(&self) -> &SimInterrupts {
        &self.interrupts
    }

    pub fn platform<'a>(&'a self, chrdevs: &'a ChrdevRegistry) -> Platform<'a> {
        Platform {
            topology: self,
            interrupts: &self.interrupts,
            chrdevs,
        }
    }

    /// # Panics
    /// If the key index is out of range.
    pub fn irq(&self, index: usize) -> IrqId {
        IrqId(self.offsets[index])
    }

    /// Makes key `index` look as if its interrupt could not be mapped.
    pub fn remove_interrupt(&self, index: usize) {
        self.irq_missing[index].store(true, Ordering::SeqCst);
    }

    fn drive(&self, index: usize, level: bool) {
        let offset = self.offsets[index];
        // Offsets come from the board itself, so they are always in range.
        let _ = self.chip.set_level(offset, level);
        let edge = if level { Edge::Rising } else { Edge::Falling };
        self.interrupts.raise(IrqId(offset), edge);
    }

    /// Pulls the line of key `index` low and raises a falling edge.
    pub fn press(&self, index: usize) {
        self.drive(index, false);
    }

    /// Lets the line of key `index` go high and raises a rising edge.
    pub fn release(&self, index: usize) {
        self.drive(index, true);
    }

    /// Toggles key `index` `edges` times, `gap` apart, ending pressed when `edges` is odd.
    pub fn bounce(&self, index: usize, edges: usize, gap: Duration) {
        for edge in 0..edges {
            if edge % 2 == 0 {
                self.press(index);
            } else {
                self.release(index);
            }
            thread::sleep(gap);
        }
    }

    /// Gets how many times the driver sampled key `index`.
    pub fn reads(&self, index: usize) -> usize {
        self.chip.reads(self.offsets[index]).unwrap_or(0)
    }

    pub fn is_line_requested(&self, index: usize) -> bool {
        self.chip.is_requested(self.offsets[index]).unwrap_or(false)
    }
}

impl Topology for SimBoard {
    fn key_count(&self) -> usize {
        self.offsets.len()
    }

    fn resolve_line(&self, index: usize) -> KeyResult<Arc<dyn GpioInput>> {
        let offset = *self.offsets.get(index).ok_or(KeyError::MissingLine { index })?;
        let options = LineOptions::default().with_bias(GpioBias::PullUp);
        Ok(self.chip.request_input(offset, options)?)
    }

    fn resolve_irq(&self, index: usize) -> KeyResult<IrqId> {
        match self.irq_missing.get(index) {
            Some(missing) if !missing.load(Ordering::SeqCst) => Ok(self.irq(index)),
            _ => Err(KeyError::MissingInterrupt { index }),
        }
    }
}
