//! Interrupt controller boundary.
//!
//! Handlers are typed closures. Whatever context they need is captured at
//! registration time, there is no untyped cookie.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use log::{debug, warn};
use keyirq_gpio::GpioInput;
use crate::{KeyError, KeyResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IrqId(pub u32);

impl Display for IrqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a level transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Gets the edge between two consecutive levels, if they differ.
    pub fn between(from: bool, to: bool) -> Option<Edge> {
        match (from, to) {
            (false, true) => Some(Edge::Rising),
            (true, false) => Some(Edge::Falling),
            _ => None,
        }
    }
}

/// Which edges raise the interrupt.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Trigger {
    Rising,
    Falling,
    #[default]
    Both,
}

impl Trigger {
    pub fn accepts(self, edge: Edge) -> bool {
        matches!(
            (self, edge),
            (Trigger::Both, _) | (Trigger::Rising, Edge::Rising) | (Trigger::Falling, Edge::Falling)
        )
    }
}

/// Runs in interrupt context: must not block.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

pub trait InterruptController: Debug + Send + Sync {
    /// Binds `handler` to `irq`.
    ///
    /// The interrupt stays registered for as long as the returned [IrqRegistration] lives.
    ///
    /// # Errors
    /// - `KeyError::IrqBusy` if the interrupt already has a handler.
    /// - `KeyError::UnknownIrq` if the controller can't deliver the interrupt.
    fn request_irq(
        &self,
        irq: IrqId,
        trigger: Trigger,
        name: &str,
        handler: IrqHandler,
    ) -> KeyResult<IrqRegistration>;
}

/// A registered interrupt. Dropping it frees the interrupt: once the drop
/// returns, the handler is not running and won't be invoked again.
pub struct IrqRegistration {
    irq: IrqId,
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl IrqRegistration {
    pub fn new(irq: IrqId, name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            irq,
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn irq(&self) -> IrqId {
        self.irq
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Debug for IrqRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IrqRegistration({}, {})", self.irq, self.name)
    }
}

impl Drop for IrqRegistration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!("Interrupt {} ({}) freed.", self.irq, self.name);
        }
    }
}

struct SimEntry {
    name: String,
    trigger: Trigger,
    handler: IrqHandler,
}

/// An interrupt controller driven by hand.
///
/// [raise](SimInterrupts::raise) runs the handler right away on the calling
/// thread, which plays the part of the hard interrupt context.
#[derive(Clone, Default)]
pub struct SimInterrupts {
    handlers: Arc<RwLock<BTreeMap<IrqId, SimEntry>>>,
}

impl SimInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an edge on `irq`.
    ///
    /// Returns whether a handler took it.
    pub fn raise(&self, irq: IrqId, edge: Edge) -> bool {
        // Holding the read lock while the handler runs lets a concurrent free wait for it.
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        match handlers.get(&irq) {
            Some(entry) if entry.trigger.accepts(edge) => {
                (entry.handler)();
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, irq: IrqId) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&irq)
    }
}

impl Debug for SimInterrupts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map()
            .entries(handlers.iter().map(|(irq, entry)| (irq, &entry.name)))
            .finish()
    }
}

impl InterruptController for SimInterrupts {
    fn request_irq(
        &self,
        irq: IrqId,
        trigger: Trigger,
        name: &str,
        handler: IrqHandler,
    ) -> KeyResult<IrqRegistration> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&irq) {
            return Err(KeyError::IrqBusy(irq));
        }
        handlers.insert(irq, SimEntry {
            name: name.to_string(),
            trigger,
            handler,
        });

        let table = self.handlers.clone();
        Ok(IrqRegistration::new(irq, name, move || {
            table
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&irq);
        }))
    }
}

/// Software edge detection over plain input lines.
///
/// Every registration gets a sampler thread that reads the line each
/// `period` and invokes the handler on every accepted level change.
#[derive(Debug)]
pub struct PolledInterrupts {
    lines: BTreeMap<IrqId, Arc<dyn GpioInput>>,
    period: Duration,
}

impl PolledInterrupts {
    pub fn new(period: Duration) -> Self {
        Self {
            lines: BTreeMap::new(),
            period,
        }
    }

    /// Makes edges on `line` deliverable as `irq`.
    pub fn add_line(&mut self, irq: IrqId, line: Arc<dyn GpioInput>) {
        self.lines.insert(irq, line);
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl InterruptController for PolledInterrupts {
    fn request_irq(
        &self,
        irq: IrqId,
        trigger: Trigger,
        name: &str,
        handler: IrqHandler,
    ) -> KeyResult<IrqRegistration> {
        let line = self.lines.get(&irq).ok_or(KeyError::UnknownIrq(irq))?.clone();
        let period = self.period;
        let stop = Arc::new(AtomicBool::new(false));
        let mut last = line.read()?;

        let sampler = thread::Builder::new()
            .name(format!("irq-{}", irq))
            .spawn({
                let stop = stop.clone();
                move || {
                    while !stop.load(Ordering::SeqCst) {
                        thread::sleep(period);
                        let level = match line.read() {
                            Ok(level) => level,
                            Err(err) => {
                                warn!("Interrupt {} stopped, can't read {:?}: {}", irq, line, err);
                                return;
                            }
                        };
                        if let Some(edge) = Edge::between(last, level) {
                            if trigger.accepts(edge) && !stop.load(Ordering::SeqCst) {
                                handler();
                            }
                        }
                        last = level;
                    }
                }
            })?;

        debug!("Polling interrupt {} ({}) every {:?}.", irq, name, period);
        Ok(IrqRegistration::new(irq, name, move || {
            stop.store(true, Ordering::SeqCst);
            let _ = sampler.join();
        }))
    }
}
