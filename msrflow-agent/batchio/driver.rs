//! Batched register driver with read-modify-write semantics
//!
//! The driver owns independent batch contexts. Each context accumulates read
//! and write operations during a configuration phase, then executes them
//! repeatedly. Writes never clobber bits outside the union of adjusted
//! masks: a write batch first reads the current register values, merges the
//! staged fields in, and only then commits.

use std::collections::HashMap;

use msrflow_raw::ioctl::BatchOp;

use crate::config::PlatformTopo;
use crate::error::{Direction, MsrflowError, Result};

use super::device::{MsrDevice, RegisterDevice};

/// The default context every caller shares unless it asks for its own.
pub const DEFAULT_CONTEXT: usize = 0;

#[derive(Default)]
struct BatchContext {
    read_ops: Vec<BatchOp>,
    read_idx: HashMap<(u32, u64), usize>,
    write_ops: Vec<BatchOp>,
    write_idx: HashMap<(u32, u64), usize>,
    /// Staged field value and mask per write op, merged at write_batch time.
    write_val: Vec<u64>,
    write_mask: Vec<u64>,
    /// Whether the read results are valid: set by read_batch, cleared by any
    /// mutation of the read operation list.
    is_read: bool,
}

/// Batch driver over a swappable register device backend.
pub struct MsrBatchDriver {
    device: Box<dyn RegisterDevice>,
    contexts: Vec<BatchContext>,
}

impl MsrBatchDriver {
    /// Wrap a device backend. Context 0 always exists.
    pub fn new(device: Box<dyn RegisterDevice>) -> Self {
        Self {
            device,
            contexts: vec![BatchContext::default()],
        }
    }

    /// Open the hardware backend for every cpu of the topology.
    pub fn open_all(topo: &PlatformTopo) -> Result<Self> {
        Ok(Self::new(Box::new(MsrDevice::open_all(topo.cpus())?)))
    }

    /// Create an independent batch context and return its index.
    pub fn create_context(&mut self) -> usize {
        self.contexts.push(BatchContext::default());
        self.contexts.len() - 1
    }

    fn context_mut(&mut self, ctx: usize) -> Result<&mut BatchContext> {
        let num = self.contexts.len();
        self.contexts.get_mut(ctx).ok_or_else(|| {
            MsrflowError::InvalidArgument(format!("context {ctx} out of range (have {num})"))
        })
    }

    fn context(&self, ctx: usize) -> Result<&BatchContext> {
        self.contexts.get(ctx).ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "context {ctx} out of range (have {})",
                self.contexts.len()
            ))
        })
    }

    /// Register `(cpu, offset)` for batched reading in `ctx` and return the
    /// result slot. Repeated registration of the same register coalesces to
    /// one operation and one slot.
    pub fn add_read(&mut self, cpu: u32, offset: u64, ctx: usize) -> Result<usize> {
        let context = self.context_mut(ctx)?;
        if let Some(&slot) = context.read_idx.get(&(cpu, offset)) {
            return Ok(slot);
        }
        let slot = context.read_ops.len();
        context.read_ops.push(BatchOp::read(cpu as u16, offset as u32));
        context.read_idx.insert((cpu, offset), slot);
        context.is_read = false;
        Ok(slot)
    }

    /// Register `(cpu, offset)` for batched writing in `ctx` and return the
    /// adjust slot. Duplicate registrations share one operation; their
    /// staged fields are merged by mask union.
    pub fn add_write(&mut self, cpu: u32, offset: u64, ctx: usize) -> Result<usize> {
        let context = self.context_mut(ctx)?;
        if let Some(&slot) = context.write_idx.get(&(cpu, offset)) {
            return Ok(slot);
        }
        let slot = context.write_ops.len();
        context
            .write_ops
            .push(BatchOp::write(cpu as u16, offset as u32, 0));
        context.write_idx.insert((cpu, offset), slot);
        context.write_val.push(0);
        context.write_mask.push(0);
        Ok(slot)
    }

    /// Stage `value` under `mask` for the write op at `slot`. Bits of
    /// `value` outside `mask` are rejected. Repeated adjusts union masks;
    /// the later value wins on mask overlap.
    pub fn adjust(&mut self, slot: usize, value: u64, mask: u64, ctx: usize) -> Result<()> {
        let context = self.context_mut(ctx)?;
        if slot >= context.write_ops.len() {
            return Err(MsrflowError::InvalidArgument(format!(
                "write slot {slot} out of range (have {})",
                context.write_ops.len()
            )));
        }
        if value & !mask != 0 {
            return Err(MsrflowError::InvalidArgument(format!(
                "adjust value {value:#x} has bits outside mask {mask:#x}"
            )));
        }
        context.write_val[slot] = (context.write_val[slot] & !mask) | value;
        context.write_mask[slot] |= mask;
        Ok(())
    }

    /// Execute every registered read in one batch.
    pub fn read_batch(&mut self, ctx: usize) -> Result<()> {
        self.context(ctx)?;
        let context = &mut self.contexts[ctx];
        let mut ops = std::mem::take(&mut context.read_ops);
        let result = self.device.submit(&mut ops, Direction::Read);
        let context = &mut self.contexts[ctx];
        context.read_ops = ops;
        result?;
        context.is_read = true;
        Ok(())
    }

    /// Commit every staged write in two batch phases: read the current
    /// register values, merge the staged fields under their masks, write
    /// back. Bits no adjust touched are preserved.
    pub fn write_batch(&mut self, ctx: usize) -> Result<()> {
        self.context(ctx)?;
        let context = &mut self.contexts[ctx];
        if context.write_ops.is_empty() {
            return Ok(());
        }
        let mut ops = std::mem::take(&mut context.write_ops);
        let vals = context.write_val.clone();
        let masks = context.write_mask.clone();

        for op in ops.iter_mut() {
            op.is_read = 1;
            op.write_mask = 0;
        }
        let read_result = self.device.submit(&mut ops, Direction::Read);
        if let Err(err) = read_result {
            self.contexts[ctx].write_ops = ops;
            return Err(err);
        }

        for (i, op) in ops.iter_mut().enumerate() {
            op.data = (op.data & !masks[i]) | (vals[i] & masks[i]);
            op.write_mask = masks[i];
            op.is_read = 0;
        }
        let write_result = self.device.submit(&mut ops, Direction::Write);

        let context = &mut self.contexts[ctx];
        context.write_ops = ops;
        write_result?;
        // Staged fields are consumed; the next write batch starts clean.
        context.write_val.iter_mut().for_each(|v| *v = 0);
        context.write_mask.iter_mut().for_each(|m| *m = 0);
        Ok(())
    }

    /// Read result for `slot`, valid only after a read_batch that followed
    /// the last mutation of the context's read list.
    pub fn sample(&self, slot: usize, ctx: usize) -> Result<u64> {
        let context = self.context(ctx)?;
        if !context.is_read {
            return Err(MsrflowError::Runtime(
                "sample() called before read_batch()".to_string(),
            ));
        }
        context
            .read_ops
            .get(slot)
            .map(|op| op.data)
            .ok_or_else(|| {
                MsrflowError::InvalidArgument(format!(
                    "read slot {slot} out of range (have {})",
                    context.read_ops.len()
                ))
            })
    }

    /// Immediate read of one register, independent of any batch context.
    pub fn read_msr(&mut self, cpu: u32, offset: u64) -> Result<u64> {
        self.device.read(cpu, offset)
    }

    /// Immediate masked write of one register: read, merge under `mask`,
    /// write back.
    pub fn write_msr(&mut self, cpu: u32, offset: u64, value: u64, mask: u64) -> Result<()> {
        if value & !mask != 0 {
            return Err(MsrflowError::InvalidArgument(format!(
                "write value {value:#x} has bits outside mask {mask:#x}"
            )));
        }
        let old = self.device.read(cpu, offset)?;
        self.device.write(cpu, offset, (old & !mask) | value)
    }

    pub fn is_batch_capable(&self) -> bool {
        self.device.is_batch_capable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batchio::sim::SimDevice;

    fn sim_driver(seed: &[(u32, u64, u64)]) -> MsrBatchDriver {
        let mut dev = SimDevice::new();
        for &(cpu, offset, value) in seed {
            dev.set(cpu, offset, value);
        }
        MsrBatchDriver::new(Box::new(dev))
    }

    #[test]
    fn test_add_read_coalesces_duplicates() {
        let mut driver = sim_driver(&[(0, 0x611, 42)]);
        let a = driver.add_read(0, 0x611, DEFAULT_CONTEXT).unwrap();
        let b = driver.add_read(0, 0x611, DEFAULT_CONTEXT).unwrap();
        assert_eq!(a, b);
        let c = driver.add_read(1, 0x611, DEFAULT_CONTEXT).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_sample_before_read_batch_fails() {
        let mut driver = sim_driver(&[(0, 0x611, 42)]);
        let slot = driver.add_read(0, 0x611, DEFAULT_CONTEXT).unwrap();
        assert!(matches!(
            driver.sample(slot, DEFAULT_CONTEXT),
            Err(MsrflowError::Runtime(_))
        ));
        driver.read_batch(DEFAULT_CONTEXT).unwrap();
        assert_eq!(driver.sample(slot, DEFAULT_CONTEXT).unwrap(), 42);
    }

    #[test]
    fn test_new_read_invalidates_results() {
        let mut driver = sim_driver(&[(0, 0x611, 42), (0, 0x10, 7)]);
        let slot = driver.add_read(0, 0x611, DEFAULT_CONTEXT).unwrap();
        driver.read_batch(DEFAULT_CONTEXT).unwrap();
        driver.sample(slot, DEFAULT_CONTEXT).unwrap();
        driver.add_read(0, 0x10, DEFAULT_CONTEXT).unwrap();
        assert!(matches!(
            driver.sample(slot, DEFAULT_CONTEXT),
            Err(MsrflowError::Runtime(_))
        ));
    }

    #[test]
    fn test_write_batch_preserves_unmasked_bits() {
        let mut driver = sim_driver(&[(0, 0x610, 0xABCD_0000_0000_8123)]);
        let slot = driver.add_write(0, 0x610, DEFAULT_CONTEXT).unwrap();
        driver.adjust(slot, 0x3C0, 0x7FFF, DEFAULT_CONTEXT).unwrap();
        driver.write_batch(DEFAULT_CONTEXT).unwrap();
        let raw = driver.read_msr(0, 0x610).unwrap();
        assert_eq!(raw, 0xABCD_0000_0000_83C0);
    }

    #[test]
    fn test_adjust_mask_union_on_shared_op() {
        let mut driver = sim_driver(&[(0, 0x610, 0)]);
        let a = driver.add_write(0, 0x610, DEFAULT_CONTEXT).unwrap();
        let b = driver.add_write(0, 0x610, DEFAULT_CONTEXT).unwrap();
        assert_eq!(a, b);
        driver.adjust(a, 0x00F0, 0x00FF, DEFAULT_CONTEXT).unwrap();
        driver.adjust(b, 0xAB00, 0xFF00, DEFAULT_CONTEXT).unwrap();
        driver.write_batch(DEFAULT_CONTEXT).unwrap();
        assert_eq!(driver.read_msr(0, 0x610).unwrap(), 0xABF0);
    }

    #[test]
    fn test_adjust_rejects_value_outside_mask() {
        let mut driver = sim_driver(&[(0, 0x610, 0)]);
        let slot = driver.add_write(0, 0x610, DEFAULT_CONTEXT).unwrap();
        assert!(matches!(
            driver.adjust(slot, 0x100, 0xFF, DEFAULT_CONTEXT),
            Err(MsrflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_batch_consumes_staged_fields() {
        let mut driver = sim_driver(&[(0, 0x610, 0xFF)]);
        let slot = driver.add_write(0, 0x610, DEFAULT_CONTEXT).unwrap();
        driver.adjust(slot, 0x0F, 0x0F, DEFAULT_CONTEXT).unwrap();
        driver.write_batch(DEFAULT_CONTEXT).unwrap();
        assert_eq!(driver.read_msr(0, 0x610).unwrap(), 0xFF);
        // Second batch with nothing staged leaves the register alone.
        driver.write_msr(0, 0x610, 0xA0, 0xF0).unwrap();
        driver.write_batch(DEFAULT_CONTEXT).unwrap();
        assert_eq!(driver.read_msr(0, 0x610).unwrap(), 0xAF);
    }

    #[test]
    fn test_contexts_are_independent() {
        let mut driver = sim_driver(&[(0, 0x611, 5), (0, 0x10, 9)]);
        let ctx = driver.create_context();
        let a = driver.add_read(0, 0x611, DEFAULT_CONTEXT).unwrap();
        let b = driver.add_read(0, 0x10, ctx).unwrap();
        driver.read_batch(DEFAULT_CONTEXT).unwrap();
        assert_eq!(driver.sample(a, DEFAULT_CONTEXT).unwrap(), 5);
        // The other context has not executed yet.
        assert!(driver.sample(b, ctx).is_err());
        driver.read_batch(ctx).unwrap();
        assert_eq!(driver.sample(b, ctx).unwrap(), 9);
    }

    #[test]
    fn test_immediate_masked_write() {
        let mut driver = sim_driver(&[(0, 0x1A0, 0xFFFF)]);
        driver.write_msr(0, 0x1A0, 0x00A0, 0x00F0).unwrap();
        assert_eq!(driver.read_msr(0, 0x1A0).unwrap(), 0xFFAF);
        assert!(driver.write_msr(0, 0x1A0, 0xF00, 0xFF).is_err());
    }
}
