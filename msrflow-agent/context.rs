//! Platform wiring
//!
//! One constructor call turns register metadata plus a device into a ready
//! [`BatchIo`] facade: detect (or synthesize) the topology, open the
//! device, build the catalogs, and share the batch timestamp keeper
//! between them.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::batchio::{BatchIo, DriverRef, MsrBatchDriver, RegisterDevice, SimDevice};
use crate::catalog::{self, msr_data, RegisterDef};
use crate::config::PlatformTopo;
use crate::error::Result;
use crate::signal::TimeKeeper;

pub struct PlatformContext {
    topo: Rc<PlatformTopo>,
    driver: DriverRef,
    io: Rc<RefCell<BatchIo>>,
}

impl PlatformContext {
    /// Open the real register devices for every online cpu. Register
    /// families the hardware rejects are probed away.
    pub fn detect(msr_json: Option<&Path>) -> Result<Self> {
        let topo = Rc::new(PlatformTopo::detect());
        let driver = MsrBatchDriver::open_all(&topo)?;
        Self::build(topo, Rc::new(RefCell::new(driver)), msr_json, true)
    }

    /// Run against the in-memory register device instead of hardware.
    pub fn simulated(
        num_package: u32,
        cpus_per_package: u32,
        msr_json: Option<&Path>,
    ) -> Result<Self> {
        let topo = Rc::new(PlatformTopo::with_layout(num_package, cpus_per_package));
        let device: Box<dyn RegisterDevice> = Box::new(SimDevice::with_baseline(&topo));
        let driver = Rc::new(RefCell::new(MsrBatchDriver::new(device)));
        Self::build(topo, driver, msr_json, true)
    }

    fn build(
        topo: Rc<PlatformTopo>,
        driver: DriverRef,
        msr_json: Option<&Path>,
        probe: bool,
    ) -> Result<Self> {
        let defs = load_register_defs(msr_json)?;
        let keeper = TimeKeeper::new();
        let (signals, controls) =
            catalog::build_catalogs(&defs, &topo, &driver, &keeper, probe)?;
        let io = BatchIo::new(
            driver.clone(),
            topo.clone(),
            signals,
            controls,
            keeper,
        );
        Ok(Self {
            topo,
            driver,
            io: Rc::new(RefCell::new(io)),
        })
    }

    pub fn topo(&self) -> &PlatformTopo {
        &self.topo
    }

    pub fn is_batch_capable(&self) -> bool {
        self.driver.borrow().is_batch_capable()
    }

    pub fn io(&self) -> Rc<RefCell<BatchIo>> {
        self.io.clone()
    }
}

/// Built-in register metadata, or a user document overriding it.
fn load_register_defs(msr_json: Option<&Path>) -> Result<Vec<RegisterDef>> {
    match msr_json {
        Some(path) => {
            tracing::info!("loading register metadata from {}", path.display());
            catalog::metadata::parse_document(&std::fs::read_to_string(path)?)
        }
        None => catalog::metadata::parse_document(msr_data::BASELINE_MSR_JSON),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Domain;

    #[test]
    fn test_simulated_context_is_ready() {
        let ctx = PlatformContext::simulated(2, 2, None).unwrap();
        assert_eq!(ctx.topo().num_domain(Domain::Package), 2);
        assert!(ctx.is_batch_capable());
        let io = ctx.io();
        assert_eq!(
            io.borrow_mut()
                .read_signal("CPU_POWER_LIMIT_DEFAULT", Domain::Package, 1)
                .unwrap(),
            120.0
        );
    }

    #[test]
    fn test_user_metadata_overrides_baseline() {
        let doc = r#"{
            "msrs": {
                "PKG_ENERGY_STATUS": {
                    "offset": "0x611",
                    "domain": "package",
                    "fields": {
                        "ENERGY": {
                            "begin_bit": 0,
                            "end_bit": 31,
                            "function": "overflow",
                            "units": "joules",
                            "scalar": 6.103515625e-05,
                            "writeable": false,
                            "aggregation": "sum"
                        }
                    }
                }
            }
        }"#;
        let dir = std::env::temp_dir().join("msrflow-context-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("msr.json");
        std::fs::write(&path, doc).unwrap();

        let ctx = PlatformContext::simulated(1, 2, Some(&path)).unwrap();
        let io = ctx.io();
        let names = io.borrow().signal_names();
        assert!(names.contains(&"MSR::PKG_ENERGY_STATUS:ENERGY".to_string()));
        // Nothing from the baseline document leaks in.
        assert!(!names.contains(&"MSR::PERF_STATUS:FREQ".to_string()));
        std::fs::remove_file(&path).ok();
    }
}
