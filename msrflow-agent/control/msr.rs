//! Register-field control leaf

use msrflow_raw::field::{self, Function};

use crate::batchio::{DriverRef, DEFAULT_CONTEXT};
use crate::error::{MsrflowError, Result};

use super::{not_setup, Control};

/// Control over one bitfield of one register on one cpu.
pub struct MsrFieldControl {
    driver: DriverRef,
    cpu: u32,
    offset: u64,
    mask: u64,
    shift: u32,
    function: Function,
    scalar: f64,
    ctx: usize,
    slot: Option<usize>,
    saved: Option<u64>,
}

impl MsrFieldControl {
    pub fn new(
        driver: DriverRef,
        cpu: u32,
        offset: u64,
        begin_bit: u32,
        end_bit: u32,
        function: Function,
        scalar: f64,
    ) -> Result<Self> {
        let mask = field::field_mask(begin_bit, end_bit)?;
        Ok(Self {
            driver,
            cpu,
            offset,
            mask,
            shift: begin_bit,
            function,
            scalar,
            ctx: DEFAULT_CONTEXT,
            slot: None,
            saved: None,
        })
    }

    /// Encode `setting` and place it at the field's bit position, verifying
    /// the encoded value fits the field.
    fn encode_shifted(&self, setting: f64) -> Result<u64> {
        let encoded = field::encode(setting, self.function, self.scalar)?;
        let shifted = encoded << self.shift;
        if shifted & !self.mask != 0 {
            return Err(MsrflowError::Overflow(format!(
                "setting {setting} encodes to {encoded:#x}, wider than the field at offset {:#x}",
                self.offset
            )));
        }
        Ok(shifted)
    }
}

impl Control for MsrFieldControl {
    fn setup_batch(&mut self) -> Result<()> {
        if self.slot.is_none() {
            let slot = self
                .driver
                .borrow_mut()
                .add_write(self.cpu, self.offset, self.ctx)?;
            self.slot = Some(slot);
        }
        Ok(())
    }

    fn adjust(&mut self, setting: f64) -> Result<()> {
        let slot = self.slot.ok_or_else(not_setup)?;
        let shifted = self.encode_shifted(setting)?;
        self.driver
            .borrow_mut()
            .adjust(slot, shifted, self.mask, self.ctx)
    }

    fn write(&mut self, setting: f64) -> Result<()> {
        let shifted = self.encode_shifted(setting)?;
        self.driver
            .borrow_mut()
            .write_msr(self.cpu, self.offset, shifted, self.mask)
    }

    fn save(&mut self) -> Result<()> {
        let raw = self.driver.borrow_mut().read_msr(self.cpu, self.offset)?;
        self.saved = Some(raw & self.mask);
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        let saved = self.saved.ok_or_else(|| {
            MsrflowError::Runtime("restore() called before save()".to_string())
        })?;
        self.driver
            .borrow_mut()
            .write_msr(self.cpu, self.offset, saved, self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchio::{MsrBatchDriver, SimDevice};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn power_limit_control(initial: u64) -> (MsrFieldControl, DriverRef) {
        let mut dev = SimDevice::new();
        dev.set(0, 0x610, initial);
        let driver: DriverRef = Rc::new(RefCell::new(MsrBatchDriver::new(Box::new(dev))));
        let ctl =
            MsrFieldControl::new(driver.clone(), 0, 0x610, 0, 14, Function::Scale, 0.125).unwrap();
        (ctl, driver)
    }

    #[test]
    fn test_adjust_before_setup_fails() {
        let (mut ctl, _driver) = power_limit_control(0);
        assert!(matches!(ctl.adjust(100.0), Err(MsrflowError::Runtime(_))));
    }

    #[test]
    fn test_batched_write_encodes_and_masks() {
        let (mut ctl, driver) = power_limit_control(0xDEAD_0000_0000_8000);
        ctl.setup_batch().unwrap();
        ctl.adjust(100.0).unwrap();
        driver.borrow_mut().write_batch(DEFAULT_CONTEXT).unwrap();
        assert_eq!(
            driver.borrow_mut().read_msr(0, 0x610).unwrap(),
            0xDEAD_0000_0000_8320
        );
    }

    #[test]
    fn test_immediate_write() {
        let (mut ctl, driver) = power_limit_control(0x8000);
        ctl.write(50.0).unwrap();
        assert_eq!(driver.borrow_mut().read_msr(0, 0x610).unwrap(), 0x8190);
    }

    #[test]
    fn test_setting_wider_than_field_is_rejected() {
        let (mut ctl, _driver) = power_limit_control(0);
        ctl.setup_batch().unwrap();
        // 0.125 W granularity over 15 bits tops out at 4095.875 W.
        assert!(ctl.adjust(5000.0).is_err());
    }

    #[test]
    fn test_save_restore_round_trip() {
        let (mut ctl, driver) = power_limit_control(0x8000 | 960);
        ctl.save().unwrap();
        ctl.write(50.0).unwrap();
        assert_eq!(driver.borrow_mut().read_msr(0, 0x610).unwrap(), 0x8190);
        ctl.restore().unwrap();
        assert_eq!(driver.borrow_mut().read_msr(0, 0x610).unwrap(), 0x8000 | 960);
    }

    #[test]
    fn test_restore_before_save_fails() {
        let (mut ctl, _driver) = power_limit_control(0);
        assert!(ctl.restore().is_err());
    }
}
