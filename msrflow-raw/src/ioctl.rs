//! Fixed-layout request structures for the msr_batch ioctl
//!
//! The kernel consumes an array of per-register operations in one ioctl;
//! each op names the cpu, the register offset, the transfer direction, and
//! for writes the mask of bits the driver permits to change. The kernel
//! reports per-op failures through the embedded `err` field, so a successful
//! ioctl return does not by itself mean every op succeeded.

/// One register operation inside a batch request.
///
/// Layout matches `struct msr_batch_op` in the msr_safe kernel module.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOp {
    /// Cpu index to run the access on.
    pub cpu: u16,
    /// Non-zero for a read, zero for a write.
    pub is_read: u16,
    /// Per-op errno filled in by the kernel.
    pub err: i32,
    /// Register offset.
    pub msr: u32,
    /// Read result or value to write.
    pub data: u64,
    /// Writable-bit mask; for reads the kernel reports the allowed mask.
    pub write_mask: u64,
}

/// Batch request header passed to the ioctl.
///
/// Layout matches `struct msr_batch_array` in the msr_safe kernel module.
#[repr(C)]
#[derive(Debug)]
pub struct BatchArray {
    /// Number of operations at `ops`.
    pub num_ops: u32,
    /// Pointer to the first operation.
    pub ops: *mut BatchOp,
}

/// Ioctl identity: `_IOWR('c', 0xA2, struct msr_batch_array)`.
pub const MSR_BATCH_IOC_TYPE: u8 = b'c';
pub const MSR_BATCH_IOC_NR: u8 = 0xA2;

impl BatchOp {
    /// Read op template for `(cpu, offset)`.
    pub fn read(cpu: u16, msr: u32) -> Self {
        Self {
            cpu,
            is_read: 1,
            err: 0,
            msr,
            data: 0,
            write_mask: 0,
        }
    }

    /// Write op template; the data payload is committed separately after the
    /// read-modify-write merge.
    pub fn write(cpu: u16, msr: u32, write_mask: u64) -> Self {
        Self {
            cpu,
            is_read: 0,
            err: 0,
            msr,
            data: 0,
            write_mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_layout() {
        // The kernel ABI fixes the op record at 32 bytes.
        assert_eq!(std::mem::size_of::<BatchOp>(), 32);
        assert_eq!(std::mem::align_of::<BatchOp>(), 8);
    }

    #[test]
    fn test_op_templates() {
        let rd = BatchOp::read(3, 0x611);
        assert_eq!(rd.is_read, 1);
        assert_eq!(rd.write_mask, 0);

        let wr = BatchOp::write(0, 0x610, 0x7FFF);
        assert_eq!(wr.is_read, 0);
        assert_eq!(wr.write_mask, 0x7FFF);
    }
}
