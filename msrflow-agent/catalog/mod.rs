//! Signal and control catalogs
//!
//! The catalogs map names to constructed node trees, one node per domain
//! instance. Register fields get canonical `MSR::<register>:<field>` names;
//! friendlier high-level names are aliases resolving to the very same node
//! instances, so pushing a name and its alias costs one device operation.
//!
//! Optional register families are probed with an immediate read during
//! construction; a family the hardware rejects is excluded with a log line
//! instead of failing the whole catalog.

pub mod metadata;
pub mod msr_data;

pub use metadata::{Aggregation, FieldDef, RegisterDef};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use crate::batchio::DriverRef;
use crate::config::{Domain, PlatformTopo};
use crate::control::{ControlRef, DomainControl, MsrFieldControl};
use crate::error::{MsrflowError, Result};
use crate::signal::{
    DerivativeSignal, DifferenceSignal, MsrFieldSignal, ProductSignal, RawMsrSignal, SignalRef,
    TimeKeeper, TimeSignal,
};

/// Sliding-window size and immediate-read spacing for derivative signals.
const DERIVATIVE_WINDOW: usize = 8;
const DERIVATIVE_INTERVAL: Duration = Duration::from_millis(5);

struct SignalFamily {
    domain: Domain,
    aggregation: Aggregation,
    nodes: Vec<SignalRef>,
}

/// Named, domain-indexed signal trees.
#[derive(Default)]
pub struct SignalCatalog {
    families: BTreeMap<String, SignalFamily>,
    aliases: BTreeMap<String, String>,
}

impl SignalCatalog {
    fn insert(
        &mut self,
        name: impl Into<String>,
        domain: Domain,
        aggregation: Aggregation,
        nodes: Vec<SignalRef>,
    ) {
        self.families.insert(
            name.into(),
            SignalFamily {
                domain,
                aggregation,
                nodes,
            },
        );
    }

    fn add_alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    /// Canonical name behind `name`, whether it is an alias or already
    /// canonical.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.families.contains_key(self.canonical(name))
    }

    /// All resolvable names, aliases included.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .families
            .keys()
            .chain(self.aliases.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn family(&self, name: &str) -> Result<&SignalFamily> {
        self.families
            .get(self.canonical(name))
            .ok_or_else(|| MsrflowError::NotFound(format!("no signal named {name:?}")))
    }

    pub fn domain(&self, name: &str) -> Result<Domain> {
        Ok(self.family(name)?.domain)
    }

    pub fn aggregation(&self, name: &str) -> Result<Aggregation> {
        Ok(self.family(name)?.aggregation)
    }

    /// The node serving `(name, domain, domain_idx)`. Aliases resolve to
    /// the identical node instance.
    pub fn find(&self, name: &str, domain: Domain, domain_idx: usize) -> Result<SignalRef> {
        let family = self.family(name)?;
        if family.domain != domain {
            return Err(MsrflowError::InvalidArgument(format!(
                "signal {name:?} has domain {}, not {}",
                family.domain, domain
            )));
        }
        family.nodes.get(domain_idx).cloned().ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "domain index {domain_idx} out of range for signal {name:?} (have {})",
                family.nodes.len()
            ))
        })
    }

    /// Drop a family and every alias that resolves to it.
    pub fn remove(&mut self, name: &str) {
        let canonical = self.canonical(name).to_string();
        self.families.remove(&canonical);
        self.aliases.retain(|_, target| *target != canonical);
    }
}

struct ControlFamily {
    domain: Domain,
    nodes: Vec<ControlRef>,
}

/// Named, domain-indexed control trees.
#[derive(Default)]
pub struct ControlCatalog {
    families: BTreeMap<String, ControlFamily>,
    aliases: BTreeMap<String, String>,
}

impl ControlCatalog {
    fn insert(&mut self, name: impl Into<String>, domain: Domain, nodes: Vec<ControlRef>) {
        self.families
            .insert(name.into(), ControlFamily { domain, nodes });
    }

    fn add_alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.families.contains_key(self.canonical(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .families
            .keys()
            .chain(self.aliases.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn family(&self, name: &str) -> Result<&ControlFamily> {
        self.families
            .get(self.canonical(name))
            .ok_or_else(|| MsrflowError::NotFound(format!("no control named {name:?}")))
    }

    pub fn domain(&self, name: &str) -> Result<Domain> {
        Ok(self.family(name)?.domain)
    }

    pub fn find(&self, name: &str, domain: Domain, domain_idx: usize) -> Result<ControlRef> {
        let family = self.family(name)?;
        if family.domain != domain {
            return Err(MsrflowError::InvalidArgument(format!(
                "control {name:?} has domain {}, not {}",
                family.domain, domain
            )));
        }
        family.nodes.get(domain_idx).cloned().ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "domain index {domain_idx} out of range for control {name:?} (have {})",
                family.nodes.len()
            ))
        })
    }

    /// Every node of every family, for bulk save/restore.
    pub fn all_nodes(&self) -> Vec<(String, ControlRef)> {
        self.families
            .iter()
            .flat_map(|(name, family)| {
                family
                    .nodes
                    .iter()
                    .map(move |node| (name.clone(), node.clone()))
            })
            .collect()
    }

    pub fn remove(&mut self, name: &str) {
        let canonical = self.canonical(name).to_string();
        self.families.remove(&canonical);
        self.aliases.retain(|_, target| *target != canonical);
    }
}

/// Build both catalogs from validated register definitions.
///
/// When `probe` is set, each register family is checked with one immediate
/// read on its first domain instance; families the device rejects are
/// skipped. Raw register reads are shared: every field of every name backed
/// by the same `(cpu, offset)` samples through one batch operation.
pub fn build_catalogs(
    defs: &[RegisterDef],
    topo: &PlatformTopo,
    driver: &DriverRef,
    keeper: &TimeKeeper,
    probe: bool,
) -> Result<(SignalCatalog, ControlCatalog)> {
    let mut signals = SignalCatalog::default();
    let mut controls = ControlCatalog::default();
    let mut raw_cache: BTreeMap<(u32, u64), SignalRef> = BTreeMap::new();

    for def in defs {
        if probe {
            let cpu = topo.domain_cpu(def.domain, 0)?;
            if let Err(err) = driver.borrow_mut().read_msr(cpu, def.offset) {
                tracing::warn!(
                    "register {} (offset {:#x}) unavailable, skipping: {err}",
                    def.msr_name,
                    def.offset
                );
                continue;
            }
        }
        add_register(def, topo, driver, &mut signals, &mut controls, &mut raw_cache)?;
    }

    add_derived(&mut signals, &mut controls, topo, keeper)?;
    Ok((signals, controls))
}

fn add_register(
    def: &RegisterDef,
    topo: &PlatformTopo,
    driver: &DriverRef,
    signals: &mut SignalCatalog,
    controls: &mut ControlCatalog,
    raw_cache: &mut BTreeMap<(u32, u64), SignalRef>,
) -> Result<()> {
    let num_instance = topo.num_domain(def.domain);
    for field in &def.fields {
        let name = format!("MSR::{}:{}", def.msr_name, field.name);
        let mut nodes: Vec<SignalRef> = Vec::with_capacity(num_instance);
        for idx in 0..num_instance {
            let cpu = topo.domain_cpu(def.domain, idx)?;
            let raw = raw_cache
                .entry((cpu, def.offset))
                .or_insert_with(|| {
                    Rc::new(RefCell::new(RawMsrSignal::new(driver.clone(), cpu, def.offset)))
                })
                .clone();
            let node = MsrFieldSignal::new(
                raw,
                field.begin_bit,
                field.end_bit,
                field.function,
                field.scalar,
            )?;
            nodes.push(Rc::new(RefCell::new(node)));
        }
        signals.insert(name.clone(), def.domain, field.aggregation, nodes);

        if field.writeable {
            let mut nodes: Vec<ControlRef> = Vec::with_capacity(num_instance);
            for idx in 0..num_instance {
                let cpu = topo.domain_cpu(def.domain, idx)?;
                let node = MsrFieldControl::new(
                    driver.clone(),
                    cpu,
                    def.offset,
                    field.begin_bit,
                    field.end_bit,
                    field.function,
                    field.scalar,
                )?;
                nodes.push(Rc::new(RefCell::new(node)));
            }
            controls.insert(name, def.domain, nodes);
        }
    }
    Ok(())
}

/// High-level names layered over the register fields.
fn add_derived(
    signals: &mut SignalCatalog,
    controls: &mut ControlCatalog,
    topo: &PlatformTopo,
    keeper: &TimeKeeper,
) -> Result<()> {
    let time_node: SignalRef = Rc::new(RefCell::new(TimeSignal::new(keeper.clone())));
    signals.insert(
        "TIME",
        Domain::Board,
        Aggregation::ExpectSame,
        vec![time_node.clone()],
    );

    if signals.contains("MSR::PKG_ENERGY_STATUS:ENERGY") {
        signals.add_alias("CPU_ENERGY", "MSR::PKG_ENERGY_STATUS:ENERGY");
        let num_package = topo.num_domain(Domain::Package);
        let mut nodes: Vec<SignalRef> = Vec::with_capacity(num_package);
        for idx in 0..num_package {
            let energy = signals.find("CPU_ENERGY", Domain::Package, idx)?;
            let node = DerivativeSignal::new(
                time_node.clone(),
                energy,
                DERIVATIVE_WINDOW,
                DERIVATIVE_INTERVAL,
            );
            nodes.push(Rc::new(RefCell::new(node)));
        }
        signals.insert("CPU_POWER", Domain::Package, Aggregation::Sum, nodes);
    }

    if signals.contains("MSR::PERF_STATUS:FREQ") {
        // The status field reports a multiple of 100 MHz; expose hertz.
        let num_cpu = topo.num_domain(Domain::Cpu);
        let mut nodes: Vec<SignalRef> = Vec::with_capacity(num_cpu);
        for idx in 0..num_cpu {
            let ratio = signals.find("MSR::PERF_STATUS:FREQ", Domain::Cpu, idx)?;
            nodes.push(Rc::new(RefCell::new(ProductSignal::new(ratio, 1e8))));
        }
        signals.insert(
            "CPU_FREQUENCY_STATUS",
            Domain::Cpu,
            Aggregation::Average,
            nodes,
        );
    }

    if signals.contains("MSR::THERM_STATUS:DIGITAL_READOUT")
        && signals.contains("MSR::TEMPERATURE_TARGET:PROCHOT_MIN")
    {
        // The readout is a margin below prochot; the temperature is the
        // difference, taken per cpu against the cpu's core target.
        let num_cpu = topo.num_domain(Domain::Cpu);
        let mut nodes: Vec<SignalRef> = Vec::with_capacity(num_cpu);
        for idx in 0..num_cpu {
            let readout = signals.find("MSR::THERM_STATUS:DIGITAL_READOUT", Domain::Cpu, idx)?;
            let target = find_enclosing_core_signal(
                signals,
                "MSR::TEMPERATURE_TARGET:PROCHOT_MIN",
                topo,
                idx,
            )?;
            nodes.push(Rc::new(RefCell::new(DifferenceSignal::new(target, readout))));
        }
        signals.insert(
            "CPU_TEMPERATURE",
            Domain::Cpu,
            Aggregation::Average,
            nodes,
        );
    }

    for (alias, canonical) in [
        ("CPU_TIMESTAMP_COUNTER", "MSR::TIME_STAMP_COUNTER:TIMESTAMP_COUNT"),
        ("CPU_POWER_MIN_AVAIL", "MSR::PKG_POWER_INFO:MIN_POWER"),
        ("CPU_POWER_MAX_AVAIL", "MSR::PKG_POWER_INFO:MAX_POWER"),
        ("CPU_POWER_LIMIT_DEFAULT", "MSR::PKG_POWER_INFO:THERMAL_SPEC_POWER"),
    ] {
        if signals.contains(canonical) {
            signals.add_alias(alias, canonical);
        }
    }

    if controls.contains("MSR::PKG_POWER_LIMIT:PL1_POWER_LIMIT") {
        controls.add_alias("CPU_POWER_LIMIT_CONTROL", "MSR::PKG_POWER_LIMIT:PL1_POWER_LIMIT");
    }
    if controls.contains("MSR::PKG_POWER_LIMIT:PL1_TIME_WINDOW") {
        controls.add_alias(
            "CPU_POWER_TIME_WINDOW_CONTROL",
            "MSR::PKG_POWER_LIMIT:PL1_TIME_WINDOW",
        );
    }

    if controls.contains("MSR::PERF_CTL:FREQ") {
        // Package-scope frequency cap fanned out to every cpu of the
        // package.
        let num_package = topo.num_domain(Domain::Package);
        let mut nodes: Vec<ControlRef> = Vec::with_capacity(num_package);
        for idx in 0..num_package {
            let mut children = Vec::new();
            for &cpu in topo.domain_cpus(Domain::Package, idx)? {
                let cpu_idx = topo
                    .cpus()
                    .iter()
                    .position(|&c| c == cpu)
                    .ok_or_else(|| MsrflowError::Runtime(format!("cpu {cpu} not in topology")))?;
                children.push(controls.find("MSR::PERF_CTL:FREQ", Domain::Cpu, cpu_idx)?);
            }
            nodes.push(Rc::new(RefCell::new(DomainControl::new(children))) as ControlRef);
        }
        controls.insert(
            "CPU_FREQUENCY_MAX_CONTROL",
            Domain::Package,
            nodes,
        );
    }

    Ok(())
}

/// Core-domain node that encloses cpu instance `cpu_idx`.
fn find_enclosing_core_signal(
    signals: &SignalCatalog,
    name: &str,
    topo: &PlatformTopo,
    cpu_idx: usize,
) -> Result<SignalRef> {
    let cpu = topo.domain_cpu(Domain::Cpu, cpu_idx)?;
    for core_idx in 0..topo.num_domain(Domain::Core) {
        if topo.domain_cpus(Domain::Core, core_idx)?.contains(&cpu) {
            return signals.find(name, Domain::Core, core_idx);
        }
    }
    Err(MsrflowError::NotFound(format!(
        "no core encloses cpu index {cpu_idx}"
    )))
}
