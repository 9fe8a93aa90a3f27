//! Register device backends
//!
//! [`RegisterDevice`] is the seam between the batch driver and the kernel:
//! the production backend talks to the msr_safe (or stock msr) character
//! devices, and a simulated backend stands in for hardware in tests and dry
//! runs. The driver addresses registers by `(cpu, offset)` and never cares
//! which backend is underneath.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;

use msrflow_raw::ioctl::{BatchArray, BatchOp, MSR_BATCH_IOC_NR, MSR_BATCH_IOC_TYPE};
use msrflow_raw::msr::{msr_path, DriverKind, DRIVER_FALLBACK_ORDER, MSR_BATCH_PATH};

use crate::error::{Direction, MsrflowError, Result};

use super::uring::{self, SubmissionQueue};

nix::ioctl_readwrite!(msr_batch_ioctl, MSR_BATCH_IOC_TYPE, MSR_BATCH_IOC_NR, BatchArray);

/// One backend capable of moving register values for a set of cpus.
pub trait RegisterDevice {
    /// Whether [`RegisterDevice::submit`] uses a single kernel round trip.
    fn is_batch_capable(&self) -> bool;

    /// Immediate read of one register.
    fn read(&mut self, cpu: u32, offset: u64) -> Result<u64>;

    /// Immediate full-width write of one register. Masked merging is the
    /// caller's job.
    fn write(&mut self, cpu: u32, offset: u64, value: u64) -> Result<()>;

    /// Execute every op in place. `direction` describes the batch phase so
    /// per-op failures are attributed correctly; read results land in each
    /// op's `data` field.
    fn submit(&mut self, ops: &mut [BatchOp], direction: Direction) -> Result<()>;
}

/// Backend over the per-cpu MSR character devices and, when present, the
/// shared batch ioctl device.
pub struct MsrDevice {
    files: HashMap<u32, File>,
    driver_kind: DriverKind,
    batch: Option<File>,
    /// Submission queue for the per-register paths; io_uring when the
    /// kernel offers it, serial otherwise.
    queue: Box<dyn SubmissionQueue>,
}

impl MsrDevice {
    /// Open a device file for every cpu listed, preferring the msr_safe
    /// driver and falling back to the stock msr driver. The shared batch
    /// device is optional; without it every batch degrades to serial
    /// per-register access.
    pub fn open_all(cpus: &[u32]) -> Result<Self> {
        let mut driver_kind = None;
        let mut files = HashMap::with_capacity(cpus.len());
        for &cpu in cpus {
            let (file, kind) = Self::open_cpu(cpu)?;
            match driver_kind {
                None => driver_kind = Some(kind),
                Some(first) if first != kind => {
                    tracing::warn!("cpu {cpu} opened via {kind:?} but cpu 0 via {first:?}");
                }
                Some(_) => {}
            }
            files.insert(cpu, file);
        }
        let driver_kind = driver_kind.unwrap_or(DriverKind::Safe);

        let batch = match OpenOptions::new().read(true).write(true).open(MSR_BATCH_PATH) {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!(
                    "batch device {MSR_BATCH_PATH} unavailable ({err}), \
                     falling back to per-register access"
                );
                None
            }
        };

        tracing::info!(
            "opened {} register devices via {:?} driver, batch ioctl {}",
            files.len(),
            driver_kind,
            if batch.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            files,
            driver_kind,
            batch,
            queue: uring::make_queue(),
        })
    }

    fn open_cpu(cpu: u32) -> Result<(File, DriverKind)> {
        let mut last_err = None;
        for kind in DRIVER_FALLBACK_ORDER {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .open(msr_path(cpu, kind))
            {
                Ok(file) => return Ok((file, kind)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(MsrflowError::DeviceOpen {
            cpu,
            source: last_err
                .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound)),
        })
    }

    pub fn driver_kind(&self) -> DriverKind {
        self.driver_kind
    }

    fn file(&self, cpu: u32) -> Result<&File> {
        self.files.get(&cpu).ok_or_else(|| {
            MsrflowError::InvalidArgument(format!("no register device open for cpu {cpu}"))
        })
    }

    fn submit_ioctl(&mut self, ops: &mut [BatchOp]) -> Result<()> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| MsrflowError::Runtime("batch device not open".to_string()))?;
        let mut array = BatchArray {
            num_ops: ops.len() as u32,
            ops: ops.as_mut_ptr(),
        };
        // SAFETY: `array.ops` points at `ops.len()` live BatchOp records and
        // the kernel only touches that range.
        let ret = unsafe { msr_batch_ioctl(batch.as_raw_fd(), &mut array) };
        match ret {
            Ok(_) => Ok(()),
            // The driver reports per-op errors both through errno and the
            // embedded err fields; prefer the per-op detail below.
            Err(nix::Error::EIO) => Ok(()),
            Err(errno) => Err(MsrflowError::Nix(errno)),
        }
    }

    fn check_op_errors(ops: &[BatchOp]) -> Result<()> {
        for op in ops {
            if op.err != 0 {
                let direction = if op.is_read != 0 {
                    Direction::Read
                } else {
                    Direction::Write
                };
                return Err(MsrflowError::DeviceIo {
                    offset: op.msr as u64,
                    direction,
                    source: std::io::Error::from_raw_os_error(op.err.abs()),
                });
            }
        }
        Ok(())
    }
}

impl RegisterDevice for MsrDevice {
    fn is_batch_capable(&self) -> bool {
        self.batch.is_some()
    }

    fn read(&mut self, cpu: u32, offset: u64) -> Result<u64> {
        let fd = self.file(cpu)?.as_raw_fd();
        self.queue.prep_read(fd, offset);
        Ok(self.queue.submit()?[0])
    }

    fn write(&mut self, cpu: u32, offset: u64, value: u64) -> Result<()> {
        let fd = self.file(cpu)?.as_raw_fd();
        self.queue.prep_write(fd, offset, value);
        self.queue.submit()?;
        Ok(())
    }

    fn submit(&mut self, ops: &mut [BatchOp], direction: Direction) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if self.batch.is_some() {
            self.submit_ioctl(ops)?;
            return Self::check_op_errors(ops);
        }

        // Fallback: submit the whole batch through the per-cpu files.
        let mut fds = Vec::with_capacity(ops.len());
        for op in ops.iter() {
            fds.push(self.file(op.cpu as u32)?.as_raw_fd());
        }
        for (op, fd) in ops.iter().zip(fds) {
            match direction {
                Direction::Read => self.queue.prep_read(fd, op.msr as u64),
                Direction::Write => self.queue.prep_write(fd, op.msr as u64, op.data),
            }
        }
        let results = self.queue.submit()?;
        if direction == Direction::Read {
            for (op, value) in ops.iter_mut().zip(results) {
                op.data = value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn device_over(files: HashMap<u32, File>) -> MsrDevice {
        MsrDevice {
            files,
            driver_kind: DriverKind::Safe,
            batch: None,
            queue: uring::make_queue(),
        }
    }

    #[test]
    fn test_missing_cpu_is_invalid_argument() {
        let mut dev = device_over(HashMap::new());
        assert!(matches!(
            dev.read(0, 0x10),
            Err(MsrflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_batch_without_ioctl_device_uses_submission_queue() {
        // Regular files stand in for the per-cpu register devices; without
        // the batch ioctl device the whole batch goes through the
        // submission queue.
        let mut files = HashMap::new();
        for cpu in 0..2u32 {
            let mut file = tempfile();
            file.write_all(&[0u8; 64]).unwrap();
            files.insert(cpu, file);
        }
        let mut dev = device_over(files);
        assert!(!dev.is_batch_capable());

        let mut writes = [BatchOp::write(0, 8, !0), BatchOp::write(1, 16, !0)];
        writes[0].data = 0x0123;
        writes[1].data = 0x4567;
        dev.submit(&mut writes, Direction::Write).unwrap();

        let mut reads = [BatchOp::read(0, 8), BatchOp::read(1, 16), BatchOp::read(1, 0)];
        dev.submit(&mut reads, Direction::Read).unwrap();
        assert_eq!(reads[0].data, 0x0123);
        assert_eq!(reads[1].data, 0x4567);
        assert_eq!(reads[2].data, 0);
    }

    fn tempfile() -> File {
        let path = std::env::temp_dir().join(format!(
            "msrflow-device-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        file
    }

    #[test]
    fn test_op_error_surfaces_offset_and_direction() {
        let mut op = BatchOp::read(0, 0x611);
        op.err = -(libc::EPERM);
        let err = MsrDevice::check_op_errors(&[op]).unwrap_err();
        match err {
            MsrflowError::DeviceIo {
                offset, direction, ..
            } => {
                assert_eq!(offset, 0x611);
                assert_eq!(direction, Direction::Read);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
