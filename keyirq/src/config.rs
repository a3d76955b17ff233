use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::keys::MAX_KEYS;
use crate::state::{CODE_MASK, NO_KEY};
use crate::{KeyError, KeyResult};

/// Driver configuration, loaded once before the driver is initialized.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Device name, used for the character device region and the timer thread.
    pub name: String,
    /// Static major number. A free one is allocated when absent.
    pub major: Option<u32>,
    /// How long after the last edge the key level is sampled.
    ///
    /// Larger values trade responsiveness for bounce immunity.
    pub debounce_delay_ms: u64,
    pub keys: Vec<KeyConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    /// Diagnostic label. `KEY<index>` when left empty.
    #[serde(default)]
    pub name: String,
    /// Line offset on the GPIO chip.
    pub line: u32,
    /// Code reported when the key is released, `1..=0x7F`.
    pub code: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            name: "keyirq".to_string(),
            major: None,
            debounce_delay_ms: 10,
            keys: vec![KeyConfig {
                name: "KEY0".to_string(),
                line: 18,
                code: 0x01,
            }],
        }
    }
}

impl DriverConfig {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    /// Checks everything that can be checked without touching hardware.
    pub fn validate(&self) -> KeyResult<()> {
        if self.keys.is_empty() {
            return Err(KeyError::NoKeys);
        }
        if self.keys.len() > MAX_KEYS {
            return Err(KeyError::TooManyKeys { count: self.keys.len() });
        }
        if self.debounce_delay_ms == 0 {
            return Err(KeyError::InvalidDebounceDelay);
        }
        for (index, key) in self.keys.iter().enumerate() {
            if key.code == NO_KEY || key.code & !CODE_MASK != 0 {
                return Err(KeyError::InvalidCode { index, code: key.code });
            }
        }
        Ok(())
    }
}

impl KeyConfig {
    pub fn display_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("KEY{}", index)
        } else {
            self.name.clone()
        }
    }
}
