//! Character device numbers.
//!
//! The major number is settled first (the configured one, or a free one picked
//! by the registry), and only then split into the [DeviceNumber] handed out.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use log::{debug, info};
use crate::{KeyError, KeyResult};

const MINOR_BITS: u32 = 20;
const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;

/// Highest valid major number.
pub const MAJOR_MAX: u32 = 511;
/// Dynamic majors are handed out from here downwards...
const DYNAMIC_MAJOR_START: u32 = 254;
/// ...down to here.
const DYNAMIC_MAJOR_END: u32 = 234;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceNumber(u32);

impl DeviceNumber {
    pub fn new(major: u32, minor: u32) -> Self {
        DeviceNumber(major << MINOR_BITS | minor & MINOR_MASK)
    }

    pub fn major(self) -> u32 {
        self.0 >> MINOR_BITS
    }

    pub fn minor(self) -> u32 {
        self.0 & MINOR_MASK
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Display for DeviceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Bookkeeping of registered major numbers.
#[derive(Clone, Debug, Default)]
pub struct ChrdevRegistry {
    majors: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl ChrdevRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `count` minors starting at 0 under a major number.
    ///
    /// With `static_major` set (and not 0) that major is used, otherwise a free one
    /// is allocated.
    ///
    /// # Errors
    /// - `KeyError::InvalidArgument` for a zero `count` or a major above [MAJOR_MAX].
    /// - `KeyError::MajorBusy` if the static major is taken.
    /// - `KeyError::NoFreeMajor` if no dynamic major is left.
    pub fn register(
        &self,
        static_major: Option<u32>,
        count: u32,
        name: &str,
    ) -> KeyResult<ChrdevRegion> {
        if count == 0 || count > MINOR_MASK + 1 {
            return Err(KeyError::InvalidArgument);
        }

        let mut majors = self.majors.lock().unwrap_or_else(PoisonError::into_inner);
        let major = match static_major.filter(|&major| major != 0) {
            Some(major) if major > MAJOR_MAX => return Err(KeyError::InvalidArgument),
            Some(major) if majors.contains_key(&major) => return Err(KeyError::MajorBusy(major)),
            Some(major) => major,
            None => (DYNAMIC_MAJOR_END..=DYNAMIC_MAJOR_START)
                .rev()
                .find(|major| !majors.contains_key(major))
                .ok_or(KeyError::NoFreeMajor)?,
        };
        majors.insert(major, name.to_string());
        drop(majors);

        let first = DeviceNumber::new(major, 0);
        info!("{}: major={}, minor={}", name, first.major(), first.minor());
        Ok(ChrdevRegion {
            registry: self.clone(),
            first,
            count,
            name: name.to_string(),
        })
    }

    pub fn is_registered(&self, major: u32) -> bool {
        self.majors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&major)
    }
}

/// A registered range of device numbers, unregistered on drop.
#[derive(Debug)]
pub struct ChrdevRegion {
    registry: ChrdevRegistry,
    first: DeviceNumber,
    count: u32,
    name: String,
}

impl ChrdevRegion {
    pub fn first(&self) -> DeviceNumber {
        self.first
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ChrdevRegion {
    fn drop(&mut self) {
        self.registry
            .majors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.first.major());
        debug!("{}: region {} unregistered.", self.name, self.first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_major_and_minor() {
        let devt = DeviceNumber::new(200, 3);
        assert_eq!(devt.major(), 200);
        assert_eq!(devt.minor(), 3);
        assert_eq!(devt.raw(), 200 << 20 | 3);
        assert_eq!(devt.to_string(), "200:3");
    }

    #[test]
    fn static_major_is_used_as_configured() {
        let registry = ChrdevRegistry::new();
        let region = registry.register(Some(200), 1, "keyirq").unwrap();

        assert_eq!(region.first(), DeviceNumber::new(200, 0));
        assert_eq!(
            registry.register(Some(200), 1, "other").unwrap_err(),
            KeyError::MajorBusy(200)
        );

        drop(region);
        assert!(!registry.is_registered(200));
    }

    #[test]
    fn dynamic_majors_count_down() {
        let registry = ChrdevRegistry::new();
        let first = registry.register(None, 1, "a").unwrap();
        let second = registry.register(Some(0), 1, "b").unwrap();

        assert_eq!(first.first().major(), 254);
        assert_eq!(second.first().major(), 253);
    }

    #[test]
    fn dynamic_range_can_run_out() {
        let registry = ChrdevRegistry::new();
        let regions: Vec<_> = (DYNAMIC_MAJOR_END..=DYNAMIC_MAJOR_START)
            .map(|_| registry.register(None, 1, "fill").unwrap())
            .collect();

        assert_eq!(registry.register(None, 1, "late").unwrap_err(), KeyError::NoFreeMajor);
        drop(regions);
        assert!(registry.register(None, 1, "late").is_ok());
    }

    #[test]
    fn empty_range_is_rejected() {
        let registry = ChrdevRegistry::new();
        assert_eq!(registry.register(None, 0, "a").unwrap_err(), KeyError::InvalidArgument);
        assert_eq!(registry.register(Some(512), 1, "a").unwrap_err(), KeyError::InvalidArgument);
    }
}
