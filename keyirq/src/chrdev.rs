//! Single-open access to a device.
//!
//! The open count sits behind a short critical section. It is only touched on
//! open and close, never on the key event path.

use std::sync::{Mutex, PoisonError};
use crate::{KeyError, KeyResult};

#[derive(Debug, Default)]
pub struct SingleOpen {
    open: Mutex<u32>,
}

impl SingleOpen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the device.
    ///
    /// # Errors
    /// - `KeyError::Busy` if it is already open.
    pub fn acquire(&self) -> KeyResult<OpenGuard<'_>> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *open > 0 {
            return Err(KeyError::Busy);
        }
        *open += 1;
        Ok(OpenGuard { owner: self })
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) > 0
    }
}

/// Holds the device open. Closes it on drop.
#[derive(Debug)]
pub struct OpenGuard<'a> {
    owner: &'a SingleOpen,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        let mut open = self.owner.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *open > 0 {
            *open -= 1;
        }
    }
}
