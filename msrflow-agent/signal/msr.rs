//! Register-backed leaf and field-decode signals

use msrflow_raw::field::{self, Function};
use msrflow_raw::msr::{field_to_signal, signal_to_field};

use crate::batchio::{DriverRef, DEFAULT_CONTEXT};
use crate::error::Result;

use super::{not_setup, Signal, SignalRef};

/// Whole-register leaf signal. Samples carry the raw 64-bit register value
/// bit-for-bit inside the `f64` transport encoding; one instance is shared
/// by every field signal reading the same `(cpu, offset)`.
pub struct RawMsrSignal {
    driver: DriverRef,
    cpu: u32,
    offset: u64,
    ctx: usize,
    slot: Option<usize>,
}

impl RawMsrSignal {
    pub fn new(driver: DriverRef, cpu: u32, offset: u64) -> Self {
        Self {
            driver,
            cpu,
            offset,
            ctx: DEFAULT_CONTEXT,
            slot: None,
        }
    }

    pub fn with_context(driver: DriverRef, cpu: u32, offset: u64, ctx: usize) -> Self {
        Self {
            driver,
            cpu,
            offset,
            ctx,
            slot: None,
        }
    }
}

impl Signal for RawMsrSignal {
    fn setup_batch(&mut self) -> Result<()> {
        if self.slot.is_none() {
            let slot = self
                .driver
                .borrow_mut()
                .add_read(self.cpu, self.offset, self.ctx)?;
            self.slot = Some(slot);
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        let slot = self.slot.ok_or_else(not_setup)?;
        let raw = self.driver.borrow().sample(slot, self.ctx)?;
        Ok(field_to_signal(raw))
    }

    fn read(&mut self) -> Result<f64> {
        let raw = self.driver.borrow_mut().read_msr(self.cpu, self.offset)?;
        Ok(field_to_signal(raw))
    }
}

/// Decoded view of one bitfield of a raw register signal.
///
/// For `overflow` counters the decode is stateful: each observation updates
/// the last-seen field, and a backwards step is taken as a wrap of the
/// field's range and accumulated into the reported count.
pub struct MsrFieldSignal {
    raw: SignalRef,
    mask: u64,
    shift: u32,
    function: Function,
    scalar: f64,
    is_batch_ready: bool,
    last_field: u64,
    num_wrap: u64,
}

impl MsrFieldSignal {
    pub fn new(
        raw: SignalRef,
        begin_bit: u32,
        end_bit: u32,
        function: Function,
        scalar: f64,
    ) -> Result<Self> {
        let mask = field::field_mask(begin_bit, end_bit)?;
        Ok(Self {
            raw,
            mask,
            shift: begin_bit,
            function,
            scalar,
            is_batch_ready: false,
            last_field: 0,
            num_wrap: 0,
        })
    }

    fn decode(&mut self, raw: u64) -> f64 {
        let field = field::extract(raw, self.mask, self.shift);
        let value = match self.function {
            Function::Overflow => {
                if field < self.last_field {
                    self.num_wrap += 1;
                }
                let span = (self.mask >> self.shift) as f64 + 1.0;
                (field as f64 + span * self.num_wrap as f64) * self.scalar
            }
            function => field::decode(field, function, self.scalar),
        };
        self.last_field = field;
        value
    }
}

impl Signal for MsrFieldSignal {
    fn setup_batch(&mut self) -> Result<()> {
        if !self.is_batch_ready {
            self.raw.borrow_mut().setup_batch()?;
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        let raw = signal_to_field(self.raw.borrow_mut().sample()?);
        Ok(self.decode(raw))
    }

    fn read(&mut self) -> Result<f64> {
        let raw = signal_to_field(self.raw.borrow_mut().read()?);
        Ok(self.decode(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchio::{MsrBatchDriver, SimDevice};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn driver_with(cpu: u32, offset: u64, value: u64) -> DriverRef {
        let mut dev = SimDevice::new();
        dev.set(cpu, offset, value);
        Rc::new(RefCell::new(MsrBatchDriver::new(Box::new(dev))))
    }

    fn field_signal(
        driver: &DriverRef,
        offset: u64,
        begin: u32,
        end: u32,
        function: Function,
        scalar: f64,
    ) -> MsrFieldSignal {
        let raw: SignalRef = Rc::new(RefCell::new(RawMsrSignal::new(driver.clone(), 0, offset)));
        MsrFieldSignal::new(raw, begin, end, function, scalar).unwrap()
    }

    #[test]
    fn test_sample_before_setup_fails() {
        let driver = driver_with(0, 0x611, 0);
        let mut sig = field_signal(&driver, 0x611, 0, 31, Function::Scale, 1.0);
        assert!(sig.sample().is_err());
    }

    #[test]
    fn test_batched_field_decode() {
        let driver = driver_with(0, 0x610, 0x83C0);
        let mut sig = field_signal(&driver, 0x610, 0, 14, Function::Scale, 0.125);
        sig.setup_batch().unwrap();
        driver.borrow_mut().read_batch(0).unwrap();
        assert_eq!(sig.sample().unwrap(), 120.0);
    }

    #[test]
    fn test_immediate_read_needs_no_setup() {
        let driver = driver_with(0, 0x610, 0x83C0);
        let mut sig = field_signal(&driver, 0x610, 0, 14, Function::Scale, 0.125);
        assert_eq!(sig.read().unwrap(), 120.0);
    }

    #[test]
    fn test_overflow_wrap_accumulates() {
        let driver = driver_with(0, 0x611, 100);
        let mut sig = field_signal(&driver, 0x611, 0, 7, Function::Overflow, 1.0);
        assert_eq!(sig.read().unwrap(), 100.0);

        // Counter wraps the 8-bit field: 250 -> 10 reads as 256 + 10.
        driver.borrow_mut().write_msr(0, 0x611, 250, u64::MAX).unwrap();
        assert_eq!(sig.read().unwrap(), 250.0);
        driver.borrow_mut().write_msr(0, 0x611, 10, u64::MAX).unwrap();
        assert_eq!(sig.read().unwrap(), 266.0);
        driver.borrow_mut().write_msr(0, 0x611, 5, u64::MAX).unwrap();
        assert_eq!(sig.read().unwrap(), 517.0);
    }

    #[test]
    fn test_shared_raw_registers_one_read_op() {
        let driver = driver_with(0, 0x606, 0x000A_0E03);
        let raw: SignalRef =
            Rc::new(RefCell::new(RawMsrSignal::new(driver.clone(), 0, 0x606)));
        let mut power = MsrFieldSignal::new(raw.clone(), 0, 3, Function::LogHalf, 1.0).unwrap();
        let mut energy = MsrFieldSignal::new(raw.clone(), 8, 12, Function::LogHalf, 1.0).unwrap();
        power.setup_batch().unwrap();
        energy.setup_batch().unwrap();

        driver.borrow_mut().read_batch(0).unwrap();
        assert_eq!(power.sample().unwrap(), 0.125);
        assert_eq!(energy.sample().unwrap(), 1.0 / 16384.0);
        // Both fields resolved to the same slot in the same op.
        assert_eq!(driver.borrow().sample(0, 0).unwrap(), 0x000A_0E03);
        assert!(driver.borrow().sample(1, 0).is_err());
    }
}
