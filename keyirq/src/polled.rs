//! A key read by polling instead of interrupts.

use std::cell::Cell;
use std::time::Duration;
use keyirq_gpio::debounce::TimedDebounce;
use keyirq_gpio::GpioInput;
use crate::state::{CODE_MASK, NO_KEY};
use crate::KeyResult;

/// Reports `code` once per press of an active-low key, [NO_KEY] otherwise.
///
/// The level goes through a [TimedDebounce], so it has to be read often enough
/// for a press to outlast the debounce time between two reads.
#[derive(Debug)]
pub struct PolledKey<'a> {
    input: TimedDebounce<'a>,
    code: u8,
    was_pressed: Cell<bool>,
}

impl<'a> PolledKey<'a> {
    pub fn new(line: &'a dyn GpioInput, code: u8) -> Self {
        Self {
            input: TimedDebounce::new(line),
            code: code & CODE_MASK,
            was_pressed: Cell::new(false),
        }
    }

    pub fn with_debounce_time(mut self, debounce_time: Duration) -> Self {
        self.input = self.input.with_debounce_time(debounce_time);
        self
    }

    pub fn read(&self) -> KeyResult<u8> {
        let pressed = !self.input.read()?;
        let newly_pressed = pressed && !self.was_pressed.get();
        self.was_pressed.set(pressed);

        Ok(if newly_pressed { self.code } else { NO_KEY })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyirq_gpio::sim::SimChip;
    use keyirq_gpio::{GpioChip, LineOptions};
    use std::thread::sleep;

    #[test]
    fn reports_each_press_once() {
        let chip = SimChip::new("sim", 1);
        let line = chip.request_input(0, LineOptions::default()).unwrap();
        let key = PolledKey::new(&*line, 0xF0).with_debounce_time(Duration::from_millis(10));

        assert_eq!(key.read().unwrap(), NO_KEY);
        chip.set_level(0, false).unwrap();
        assert_eq!(key.read().unwrap(), NO_KEY);

        sleep(Duration::from_millis(20));
        assert_eq!(key.read().unwrap(), 0x70);
        assert_eq!(key.read().unwrap(), NO_KEY);

        chip.set_level(0, true).unwrap();
        key.read().unwrap();
        sleep(Duration::from_millis(20));
        assert_eq!(key.read().unwrap(), NO_KEY);

        chip.set_level(0, false).unwrap();
        key.read().unwrap();
        sleep(Duration::from_millis(20));
        assert_eq!(key.read().unwrap(), 0x70);
    }
}
