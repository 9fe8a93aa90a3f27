//! Push/sample/adjust facade over the catalogs and batch driver
//!
//! Callers configure the batch by pushing named signals and controls, then
//! run a steady-state loop of read_batch / sample / adjust / write_batch.
//! Pushing is only legal before the first read_batch or adjust; once the
//! loop is active the operation set is frozen. Pushing a name and one of
//! its aliases yields the same handle, backed by one device operation.
//!
//! Power-limit controls get two pieces of special handling on first push:
//! the firmware lock bit is probed once and, when set, the control is
//! pruned from the catalog and the push fails; otherwise the limit-enable
//! companion bit is set so the staged limit actually takes effect.

use std::rc::Rc;

use crate::catalog::{ControlCatalog, SignalCatalog};
use crate::config::{Domain, PlatformTopo};
use crate::control::ControlRef;
use crate::error::{MsrflowError, Result};
use crate::signal::{SignalRef, TimeKeeper};

use super::{DriverRef, DEFAULT_CONTEXT};

const POWER_LIMIT_NAME: &str = "MSR::PKG_POWER_LIMIT:PL1_POWER_LIMIT";
const POWER_LIMIT_ENABLE_NAME: &str = "MSR::PKG_POWER_LIMIT:PL1_LIMIT_ENABLE";
const POWER_LIMIT_LOCK_NAME: &str = "MSR::PKG_POWER_LIMIT:LOCK";

struct PushedControl {
    name: String,
    node: ControlRef,
    is_adjusted: bool,
}

pub struct BatchIo {
    driver: DriverRef,
    topo: Rc<PlatformTopo>,
    signals: SignalCatalog,
    controls: ControlCatalog,
    keeper: TimeKeeper,
    pushed_signals: Vec<SignalRef>,
    pushed_controls: Vec<PushedControl>,
    /// Set by the first read_batch or adjust; freezes the pushed set.
    is_active: bool,
    /// Set by read_batch; sampling is illegal before the first one.
    is_read: bool,
    lock_checked: bool,
}

impl BatchIo {
    pub fn new(
        driver: DriverRef,
        topo: Rc<PlatformTopo>,
        signals: SignalCatalog,
        controls: ControlCatalog,
        keeper: TimeKeeper,
    ) -> Self {
        Self {
            driver,
            topo,
            signals,
            controls,
            keeper,
            pushed_signals: Vec::new(),
            pushed_controls: Vec::new(),
            is_active: false,
            is_read: false,
            lock_checked: false,
        }
    }

    pub fn topo(&self) -> &PlatformTopo {
        &self.topo
    }

    pub fn signal_names(&self) -> Vec<String> {
        self.signals.names()
    }

    pub fn control_names(&self) -> Vec<String> {
        self.controls.names()
    }

    /// Add a signal to the batch and return its sample handle. Pushing the
    /// same node again, under any of its names, returns the existing
    /// handle.
    pub fn push_signal(&mut self, name: &str, domain: Domain, domain_idx: usize) -> Result<usize> {
        if self.is_active {
            return Err(MsrflowError::Runtime(
                "cannot push signals after read_batch() or adjust()".to_string(),
            ));
        }
        let node = self.signals.find(name, domain, domain_idx)?;
        if let Some(handle) = self
            .pushed_signals
            .iter()
            .position(|pushed| Rc::ptr_eq(pushed, &node))
        {
            return Ok(handle);
        }
        node.borrow_mut().setup_batch()?;
        self.pushed_signals.push(node);
        Ok(self.pushed_signals.len() - 1)
    }

    /// Add a control to the batch and return its adjust handle, with the
    /// same dedup rule as [`BatchIo::push_signal`].
    pub fn push_control(&mut self, name: &str, domain: Domain, domain_idx: usize) -> Result<usize> {
        if self.is_active {
            return Err(MsrflowError::Runtime(
                "cannot push controls after read_batch() or adjust()".to_string(),
            ));
        }
        let canonical = self.controls.canonical(name).to_string();
        if canonical == POWER_LIMIT_NAME {
            self.check_power_limit_lock()?;
        }
        let node = self.controls.find(name, domain, domain_idx)?;
        if let Some(handle) = self
            .pushed_controls
            .iter()
            .position(|pushed| Rc::ptr_eq(&pushed.node, &node))
        {
            return Ok(handle);
        }
        if canonical == POWER_LIMIT_NAME {
            // Without the enable bit the staged limit is ignored.
            self.write_control(POWER_LIMIT_ENABLE_NAME, domain, domain_idx, 1.0)?;
        }
        node.borrow_mut().setup_batch()?;
        self.pushed_controls.push(PushedControl {
            name: name.to_string(),
            node,
            is_adjusted: false,
        });
        Ok(self.pushed_controls.len() - 1)
    }

    /// One-time probe of the firmware lock bit across every package. A
    /// locked register cannot be written until reset, so the control is
    /// withdrawn from the catalog entirely.
    fn check_power_limit_lock(&mut self) -> Result<()> {
        if self.lock_checked {
            if !self.controls.contains(POWER_LIMIT_NAME) {
                return Err(MsrflowError::NotFound(format!(
                    "control {POWER_LIMIT_NAME:?} is locked by firmware"
                )));
            }
            return Ok(());
        }
        self.lock_checked = true;
        let mut locked = 0.0;
        for idx in 0..self.topo.num_domain(Domain::Package) {
            locked += self.read_signal(POWER_LIMIT_LOCK_NAME, Domain::Package, idx)?;
        }
        if locked != 0.0 {
            tracing::warn!(
                "package power limit is locked by firmware, withdrawing the control"
            );
            self.controls.remove(POWER_LIMIT_NAME);
            return Err(MsrflowError::NotFound(format!(
                "control {POWER_LIMIT_NAME:?} is locked by firmware"
            )));
        }
        Ok(())
    }

    /// Execute the batched reads and latch the batch timestamp.
    pub fn read_batch(&mut self) -> Result<()> {
        self.driver.borrow_mut().read_batch(DEFAULT_CONTEXT)?;
        self.keeper.latch();
        self.is_active = true;
        self.is_read = true;
        Ok(())
    }

    /// Value of a pushed signal from the latest read batch.
    pub fn sample(&mut self, handle: usize) -> Result<f64> {
        if !self.is_read {
            return Err(MsrflowError::Runtime(
                "read_batch() must be called before sample()".to_string(),
            ));
        }
        let node = self.pushed_signals.get(handle).ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "signal handle {handle} out of range (have {})",
                self.pushed_signals.len()
            ))
        })?;
        node.borrow_mut().sample()
    }

    /// Stage a setting for a pushed control.
    pub fn adjust(&mut self, handle: usize, setting: f64) -> Result<()> {
        let num = self.pushed_controls.len();
        let pushed = self.pushed_controls.get_mut(handle).ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "control handle {handle} out of range (have {num})"
            ))
        })?;
        pushed.node.borrow_mut().adjust(setting)?;
        pushed.is_adjusted = true;
        self.is_active = true;
        Ok(())
    }

    /// Commit every staged control setting. Every pushed control must have
    /// been adjusted since the last write batch; forgetting one is a
    /// caller bug worth failing loudly over.
    pub fn write_batch(&mut self) -> Result<()> {
        if let Some(pushed) = self.pushed_controls.iter().find(|p| !p.is_adjusted) {
            return Err(MsrflowError::Runtime(format!(
                "control {:?} was pushed but never adjusted",
                pushed.name
            )));
        }
        self.driver.borrow_mut().write_batch(DEFAULT_CONTEXT)?;
        for pushed in &mut self.pushed_controls {
            pushed.is_adjusted = false;
        }
        Ok(())
    }

    /// Immediate read of any cataloged signal, batched or not. Reading at a
    /// domain coarser than the signal's native domain combines the enclosed
    /// native instances with the family's aggregation function.
    pub fn read_signal(&mut self, name: &str, domain: Domain, domain_idx: usize) -> Result<f64> {
        let native = self.signals.domain(name)?;
        if domain == native {
            let node = self.signals.find(name, domain, domain_idx)?;
            return node.borrow_mut().read();
        }
        if domain > native {
            return Err(MsrflowError::NotImplemented(format!(
                "signal {name:?} has {native} scope; disaggregating it to {domain} \
                 is not implemented"
            )));
        }
        let aggregation = self.signals.aggregation(name)?;
        let outer = self.topo.domain_cpus(domain, domain_idx)?.to_vec();
        let mut samples = Vec::new();
        for idx in 0..self.topo.num_domain(native) {
            let inner = self.topo.domain_cpus(native, idx)?;
            if inner.iter().all(|cpu| outer.contains(cpu)) {
                let node = self.signals.find(name, native, idx)?;
                samples.push(node.borrow_mut().read()?);
            }
        }
        Ok(aggregation.apply(&samples))
    }

    /// Immediate write of any cataloged control.
    pub fn write_control(
        &mut self,
        name: &str,
        domain: Domain,
        domain_idx: usize,
        setting: f64,
    ) -> Result<()> {
        if self.controls.canonical(name) == POWER_LIMIT_NAME {
            self.check_power_limit_lock()?;
        }
        let node = self.controls.find(name, domain, domain_idx)?;
        let result = node.borrow_mut().write(setting);
        result
    }

    /// Capture the current value of every cataloged control.
    pub fn save_controls(&mut self) -> Result<()> {
        for (name, node) in self.controls.all_nodes() {
            node.borrow_mut().save().map_err(|err| {
                MsrflowError::Runtime(format!("saving control {name:?} failed: {err}"))
            })?;
        }
        Ok(())
    }

    /// Write back every value captured by [`BatchIo::save_controls`].
    pub fn restore_controls(&mut self) -> Result<()> {
        for (name, node) in self.controls.all_nodes() {
            if let Err(err) = node.borrow_mut().restore() {
                tracing::warn!("restoring control {name:?} failed: {err}");
            }
        }
        Ok(())
    }
}
