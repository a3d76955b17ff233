//! The key descriptor table, built once at initialization and read-only afterwards.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use log::debug;
use keyirq_gpio::GpioInput;
use crate::config::DriverConfig;
use crate::irq::IrqId;
use crate::topology::Topology;
use crate::{KeyError, KeyResult};

/// Capacity of the descriptor table.
pub const MAX_KEYS: usize = 8;

/// Everything the driver knows about one physical key.
pub struct KeyDescriptor {
    line: Arc<dyn GpioInput>,
    irq: IrqId,
    reported_code: u8,
    name: String,
}

impl KeyDescriptor {
    pub fn line(&self) -> &dyn GpioInput {
        &*self.line
    }

    pub fn irq(&self) -> IrqId {
        self.irq
    }

    /// Code handed to readers for this key, bit 7 clear.
    pub fn reported_code(&self) -> u8 {
        self.reported_code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Samples the line. Keys are active low, so `true` means pressed.
    pub fn is_pressed(&self) -> KeyResult<bool> {
        Ok(!self.line.read()?)
    }
}

impl Debug for KeyDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(code={:#04x}, irq={}, line={:?})",
            self.name, self.reported_code, self.irq, self.line
        )
    }
}

#[derive(Debug)]
pub struct KeyTable {
    keys: Box<[KeyDescriptor]>,
}

impl KeyTable {
    /// Resolves every configured key. Fails on the first key that can't be wired,
    /// so a partially wired table never exists.
    pub fn build(config: &DriverConfig, topology: &dyn Topology) -> KeyResult<Self> {
        config.validate()?;

        let available = topology.key_count();
        if available < config.keys.len() {
            return Err(KeyError::TopologyMismatch {
                configured: config.keys.len(),
                available,
            });
        }

        let keys = config
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let line = topology.resolve_line(index)?;
                let irq = topology.resolve_irq(index)?;
                let descriptor = KeyDescriptor {
                    line,
                    irq,
                    reported_code: key.code,
                    name: key.display_name(index),
                };
                debug!("key{}: {:?}", index, descriptor);
                Ok(descriptor)
            })
            .collect::<KeyResult<Box<[_]>>>()?;

        Ok(Self { keys })
    }

    pub fn get(&self, index: usize) -> Option<&KeyDescriptor> {
        self.keys.get(index)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.keys.iter()
    }
}
