//! Fan-out control over every child in a domain instance

use crate::error::Result;

use super::{not_setup, Control, ControlRef};

/// Applies one setting to every child control, e.g. a package-scope
/// frequency cap written to each cpu of the package.
pub struct DomainControl {
    children: Vec<ControlRef>,
    is_batch_ready: bool,
}

impl DomainControl {
    pub fn new(children: Vec<ControlRef>) -> Self {
        Self {
            children,
            is_batch_ready: false,
        }
    }
}

impl Control for DomainControl {
    fn setup_batch(&mut self) -> Result<()> {
        if !self.is_batch_ready {
            for child in &self.children {
                child.borrow_mut().setup_batch()?;
            }
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn adjust(&mut self, setting: f64) -> Result<()> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        for child in &self.children {
            child.borrow_mut().adjust(setting)?;
        }
        Ok(())
    }

    fn write(&mut self, setting: f64) -> Result<()> {
        for child in &self.children {
            child.borrow_mut().write(setting)?;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        for child in &self.children {
            child.borrow_mut().save()?;
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        for child in &self.children {
            child.borrow_mut().restore()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchio::{DriverRef, MsrBatchDriver, SimDevice, DEFAULT_CONTEXT};
    use crate::control::MsrFieldControl;
    use msrflow_raw::field::Function;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn frequency_fanout(cpus: &[u32]) -> (DomainControl, DriverRef) {
        let mut dev = SimDevice::new();
        for &cpu in cpus {
            dev.set(cpu, 0x199, 0x1500);
        }
        let driver: DriverRef = Rc::new(RefCell::new(MsrBatchDriver::new(Box::new(dev))));
        let children = cpus
            .iter()
            .map(|&cpu| {
                let ctl = MsrFieldControl::new(
                    driver.clone(),
                    cpu,
                    0x199,
                    8,
                    15,
                    Function::Scale,
                    1e8,
                )
                .unwrap();
                Rc::new(RefCell::new(ctl)) as ControlRef
            })
            .collect();
        (DomainControl::new(children), driver)
    }

    #[test]
    fn test_fanout_writes_every_cpu() {
        let (mut ctl, driver) = frequency_fanout(&[0, 1, 2, 3]);
        ctl.setup_batch().unwrap();
        ctl.adjust(1.8e9).unwrap();
        driver.borrow_mut().write_batch(DEFAULT_CONTEXT).unwrap();
        for cpu in 0..4 {
            assert_eq!(driver.borrow_mut().read_msr(cpu, 0x199).unwrap(), 0x1200);
        }
    }

    #[test]
    fn test_fanout_save_restore() {
        let (mut ctl, driver) = frequency_fanout(&[0, 1]);
        ctl.save().unwrap();
        ctl.write(2.8e9).unwrap();
        assert_eq!(driver.borrow_mut().read_msr(1, 0x199).unwrap(), 0x1C00);
        ctl.restore().unwrap();
        assert_eq!(driver.borrow_mut().read_msr(1, 0x199).unwrap(), 0x1500);
    }

    #[test]
    fn test_adjust_before_setup_fails() {
        let (mut ctl, _driver) = frequency_fanout(&[0]);
        assert!(ctl.adjust(1e9).is_err());
    }
}
