//! Lock-free exchange between the debounce timer (writer) and the reader.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use log::debug;
use thiserror::Error;
use crate::{KeyError, KeyResult};

/// Sentinel code: no valid key recorded.
pub const NO_KEY: u8 = 0x00;
/// Set on a code that describes the release of the key.
pub const RELEASE_FLAG: u8 = 0x80;
/// Bits carrying the key code itself.
pub const CODE_MASK: u8 = 0x7F;

const GENERATION_SHIFT: u32 = 8;

fn code_of(slot: u32) -> u8 {
    (slot & 0xFF) as u8
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ConsumeError {
    #[error("no key event pending")]
    NoData,
    /// A release was flagged but the stored code lacks [RELEASE_FLAG].
    ///
    /// Reached in normal use when a key is pressed again before the reader
    /// took the previous release: the press overwrites the unread release.
    #[error("release pending but code {code:#04x} is not a release")]
    UnexpectedState { code: u8 },
}

impl From<ConsumeError> for KeyError {
    fn from(_: ConsumeError) -> Self {
        KeyError::NoData
    }
}

/// The last observed key code plus a pending-release flag.
///
/// Only the debounce timer writes the code, only [consume](Self::consume)
/// clears `release_pending`. The code is always published before the flag.
#[derive(Debug)]
pub struct SharedKeyState {
    /// Low byte: the code. Above it: a generation bumped on every write.
    current: AtomicU32,
    release_pending: AtomicBool,
    unexpected: AtomicU64,
}

impl Default for SharedKeyState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedKeyState {
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(NO_KEY as u32),
            release_pending: AtomicBool::new(false),
            unexpected: AtomicU64::new(0),
        }
    }

    fn publish(&self, code: u8) {
        // The closure never declines, so the update always succeeds.
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |slot| {
                let generation = (slot >> GENERATION_SHIFT).wrapping_add(1);
                Some(generation << GENERATION_SHIFT | u32::from(code))
            });
    }

    /// Records a settled press of the key reporting `code`.
    pub fn record_press(&self, code: u8) {
        self.publish(code & CODE_MASK);
    }

    /// Records a settled release of the key reporting `code` and flags it for the reader.
    pub fn record_release(&self, code: u8) {
        self.publish(code | RELEASE_FLAG);
        self.release_pending.store(true, Ordering::SeqCst);
    }

    /// Gets the raw current code without consuming anything.
    pub fn peek(&self) -> u8 {
        code_of(self.current.load(Ordering::SeqCst))
    }

    pub fn is_release_pending(&self) -> bool {
        self.release_pending.load(Ordering::SeqCst)
    }

    /// Takes the pending release event, if any.
    ///
    /// Returns the key code with [RELEASE_FLAG] cleared. A given release is
    /// handed out at most once, even with several callers racing.
    pub fn consume(&self) -> Result<u8, ConsumeError> {
        self.consume_with(|| {})
    }

    /// [consume](Self::consume), running `before_claim` between reading the
    /// code and clearing the flag.
    fn consume_with(&self, before_claim: impl FnOnce()) -> Result<u8, ConsumeError> {
        if !self.release_pending.load(Ordering::SeqCst) {
            return Err(ConsumeError::NoData);
        }

        let seen = self.current.load(Ordering::SeqCst);
        let code = code_of(seen);
        if code & RELEASE_FLAG == 0 {
            self.unexpected.fetch_add(1, Ordering::Relaxed);
            return Err(ConsumeError::UnexpectedState { code });
        }

        before_claim();

        // Whoever flips the flag owns the event.
        if self
            .release_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConsumeError::NoData);
        }

        // A release recorded after `seen` may have set the flag before the claim cleared it.
        let latest = self.current.load(Ordering::SeqCst);
        if latest != seen && code_of(latest) & RELEASE_FLAG != 0 {
            self.release_pending.store(true, Ordering::SeqCst);
        }

        Ok(code & CODE_MASK)
    }

    /// Gets how many times [consume](Self::consume) hit a release flag without a release code.
    pub fn unexpected_states(&self) -> u64 {
        self.unexpected.load(Ordering::Relaxed)
    }

    /// Device read: writes one event byte into `buf`.
    ///
    /// # Errors
    /// - `KeyError::InvalidArgument` if `buf` is empty.
    /// - `KeyError::NoData` if no release is pending. Nothing is written then.
    pub fn read_into(&self, buf: &mut [u8]) -> KeyResult<usize> {
        let Some(slot) = buf.first_mut() else {
            return Err(KeyError::InvalidArgument);
        };

        match self.consume() {
            Ok(code) => {
                *slot = code;
                Ok(1)
            }
            Err(err @ ConsumeError::UnexpectedState { code }) => {
                debug!("Key state {:#04x} is a press over an unread release, reporting no data.", code);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn starts_at_sentinel() {
        let state = SharedKeyState::new();
        assert_eq!(state.peek(), NO_KEY);
        assert!(!state.is_release_pending());
        assert_eq!(state.consume(), Err(ConsumeError::NoData));
    }

    #[test]
    fn press_alone_is_not_an_event() {
        let state = SharedKeyState::new();
        state.record_press(0x01);

        assert_eq!(state.peek(), 0x01);
        assert_eq!(state.consume(), Err(ConsumeError::NoData));
    }

    #[test]
    fn release_is_delivered_once() {
        let state = SharedKeyState::new();
        state.record_press(0x01);
        state.record_release(0x01);

        assert_eq!(state.peek(), 0x81);
        assert_eq!(state.consume(), Ok(0x01));
        assert_eq!(state.consume(), Err(ConsumeError::NoData));
        // Peeking still shows the raw code.
        assert_eq!(state.peek(), 0x81);
    }

    #[test]
    fn press_after_release_is_flagged_as_unexpected() {
        let state = SharedKeyState::new();
        state.record_release(0x02);
        state.record_press(0x02);

        assert_eq!(state.consume(), Err(ConsumeError::UnexpectedState { code: 0x02 }));
        assert_eq!(state.unexpected_states(), 1);
        // A device read reports it as plain no-data.
        assert_eq!(state.read_into(&mut [0xAA]), Err(KeyError::NoData));
        assert_eq!(state.unexpected_states(), 2);

        // The next release is still delivered.
        state.record_release(0x02);
        assert_eq!(state.consume(), Ok(0x02));
    }

    #[test]
    fn release_recorded_while_claiming_is_kept() {
        let state = SharedKeyState::new();
        state.record_release(0x11);

        let claimed = state.consume_with(|| {
            state.record_press(0x22);
            state.record_release(0x22);
        });
        assert_eq!(claimed, Ok(0x11));
        assert!(state.is_release_pending());
        assert_eq!(state.consume(), Ok(0x22));
        assert_eq!(state.consume(), Err(ConsumeError::NoData));
    }

    #[test]
    fn same_key_released_again_while_claiming_is_kept() {
        let state = SharedKeyState::new();
        state.record_release(0x11);

        let claimed = state.consume_with(|| {
            state.record_press(0x11);
            state.record_release(0x11);
        });
        assert_eq!(claimed, Ok(0x11));
        assert_eq!(state.consume(), Ok(0x11));
        assert_eq!(state.consume(), Err(ConsumeError::NoData));
    }

    #[test]
    fn press_while_claiming_does_not_raise_the_flag() {
        let state = SharedKeyState::new();
        state.record_release(0x11);

        let claimed = state.consume_with(|| state.record_press(0x22));
        assert_eq!(claimed, Ok(0x11));
        assert!(!state.is_release_pending());
        assert_eq!(state.peek(), 0x22);
    }

    #[test]
    fn read_writes_exactly_one_byte() {
        let state = SharedKeyState::new();
        let mut buf = [0xAA; 4];

        assert_eq!(state.read_into(&mut buf), Err(KeyError::NoData));
        assert_eq!(buf, [0xAA; 4]);

        state.record_release(0x05);
        assert_eq!(state.read_into(&mut buf), Ok(1));
        assert_eq!(buf, [0x05, 0xAA, 0xAA, 0xAA]);
        assert_eq!(state.read_into(&mut []), Err(KeyError::InvalidArgument));
    }

    #[test]
    fn concurrent_reader_never_sees_release_flag_or_foreign_code() {
        let state = Arc::new(SharedKeyState::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = thread::spawn({
            let state = state.clone();
            let done = done.clone();
            move || {
                for i in 0..100_000u32 {
                    let code = if i % 2 == 0 { 0x11 } else { 0x22 };
                    state.record_release(code);
                }
                done.store(true, Ordering::SeqCst);
            }
        });

        let mut delivered = 0u32;
        loop {
            let finished = done.load(Ordering::SeqCst);
            match state.consume() {
                Ok(code) => {
                    assert_eq!(code & RELEASE_FLAG, 0);
                    assert!(code == 0x11 || code == 0x22, "torn code {:#04x}", code);
                    delivered += 1;
                }
                Err(ConsumeError::NoData) if finished => break,
                Err(ConsumeError::NoData) => {}
                Err(err) => panic!("unexpected {:?}", err),
            }
        }

        writer.join().unwrap();
        assert!(delivered >= 1);
        assert_eq!(state.unexpected_states(), 0);
    }
}
