//! In-memory register backend for tests and dry runs
//!
//! Registers live in a map keyed by `(cpu, offset)`; unseeded registers read
//! as an error the way an unsupported MSR does on hardware, so catalog
//! probing behaves the same against the simulator as against a machine that
//! lacks a register family.

use std::collections::HashMap;

use msrflow_raw::ioctl::BatchOp;

use crate::config::PlatformTopo;
use crate::error::{Direction, MsrflowError, Result};

use super::device::RegisterDevice;

/// Simulated register store.
pub struct SimDevice {
    regs: HashMap<(u32, u64), u64>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            regs: HashMap::new(),
        }
    }

    /// Seed a register value.
    pub fn set(&mut self, cpu: u32, offset: u64, value: u64) -> &mut Self {
        self.regs.insert((cpu, offset), value);
        self
    }

    /// Current register value, for assertions.
    pub fn get(&self, cpu: u32, offset: u64) -> Option<u64> {
        self.regs.get(&(cpu, offset)).copied()
    }

    /// Populate the architectural baseline register set for every cpu of the
    /// topology, with plausible power-on values: RAPL units of 1/8 W,
    /// 1/2^14 J and 1/1024 s, a 120 W thermal-spec package power with a
    /// 40-200 W limit range, an unlocked 120 W PL1, and a 2.1 GHz ratio.
    pub fn with_baseline(topo: &PlatformTopo) -> Self {
        let mut dev = Self::new();
        for &cpu in topo.cpus() {
            dev.set(cpu, 0x10, 0); // TIME_STAMP_COUNTER
            dev.set(cpu, 0xE7, 0); // MPERF
            dev.set(cpu, 0xE8, 0); // APERF
            dev.set(cpu, 0x198, 0x1500); // PERF_STATUS, ratio 21
            dev.set(cpu, 0x199, 0x1500); // PERF_CTL
            dev.set(cpu, 0x19C, 0x88250000); // THERM_STATUS, readout 37
            dev.set(cpu, 0x1A2, 0x640000); // TEMPERATURE_TARGET, prochot 100
            dev.set(cpu, 0x606, 0x000A_0E03); // RAPL_POWER_UNIT
            dev.set(cpu, 0x610, 0x0000_8000_0000_83C0); // PKG_POWER_LIMIT, 120 W enabled
            dev.set(cpu, 0x611, 0); // PKG_ENERGY_STATUS
            // PKG_POWER_INFO: tdp 120 W, min 40 W, max 200 W
            dev.set(cpu, 0x614, (200u64 * 8) << 32 | (40u64 * 8) << 16 | 120 * 8);
        }
        dev
    }

    fn load(&self, cpu: u32, offset: u64, direction: Direction) -> Result<u64> {
        self.regs.get(&(cpu, offset)).copied().ok_or_else(|| {
            MsrflowError::DeviceIo {
                offset,
                direction,
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            }
        })
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterDevice for SimDevice {
    fn is_batch_capable(&self) -> bool {
        true
    }

    fn read(&mut self, cpu: u32, offset: u64) -> Result<u64> {
        self.load(cpu, offset, Direction::Read)
    }

    fn write(&mut self, cpu: u32, offset: u64, value: u64) -> Result<()> {
        self.load(cpu, offset, Direction::Write)?;
        self.regs.insert((cpu, offset), value);
        Ok(())
    }

    fn submit(&mut self, ops: &mut [BatchOp], direction: Direction) -> Result<()> {
        for op in ops {
            match direction {
                Direction::Read => {
                    op.data = self.load(op.cpu as u32, op.msr as u64, direction)?;
                }
                Direction::Write => {
                    // The kernel applies the write mask on top of whatever
                    // merge the driver performed.
                    let old = self.load(op.cpu as u32, op.msr as u64, direction)?;
                    let merged = (old & !op.write_mask) | (op.data & op.write_mask);
                    self.regs.insert((op.cpu as u32, op.msr as u64), merged);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseeded_register_errors() {
        let mut dev = SimDevice::new();
        assert!(matches!(
            dev.read(0, 0x123),
            Err(MsrflowError::DeviceIo { offset: 0x123, .. })
        ));
    }

    #[test]
    fn test_submit_applies_write_mask() {
        let mut dev = SimDevice::new();
        dev.set(0, 0x610, 0xFFFF_0000);
        let mut op = BatchOp::write(0, 0x610, 0x00FF);
        op.data = 0x00AB;
        dev.submit(std::slice::from_mut(&mut op), Direction::Write)
            .unwrap();
        assert_eq!(dev.get(0, 0x610), Some(0xFFFF_00AB));
    }

    #[test]
    fn test_baseline_seeds_every_cpu() {
        let topo = PlatformTopo::with_layout(2, 2);
        let mut dev = SimDevice::with_baseline(&topo);
        assert_eq!(dev.read(3, 0x606).unwrap(), 0x000A_0E03);
        assert_eq!(dev.read(0, 0x614).unwrap() & 0x7FFF, 960);
    }
}
