//! MSR character-device paths and raw field transport helpers
//!
//! Two mutually exclusive per-cpu driver variants exist: `msr_safe`, which
//! enforces a kernel-side allowlist and write masks, and the stock `msr`
//! driver, which performs no checking and requires CAP_SYS_RAWIO. The batch
//! ioctl is only served by the shared `msr_batch` device, which may be absent
//! even when the per-cpu devices are present.

/// Shared batch-ioctl device served by the msr_safe driver.
pub const MSR_BATCH_PATH: &str = "/dev/cpu/msr_batch";

/// Which MSR character-device driver backs a per-cpu file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// The allowlist-checked msr_safe driver.
    Safe,
    /// The stock unchecked msr driver.
    Raw,
}

/// Preference order when opening per-cpu devices.
pub const DRIVER_FALLBACK_ORDER: [DriverKind; 2] = [DriverKind::Safe, DriverKind::Raw];

/// Per-cpu register device path for the given driver variant.
pub fn msr_path(cpu: u32, kind: DriverKind) -> String {
    match kind {
        DriverKind::Safe => format!("/dev/cpu/{cpu}/msr_safe"),
        DriverKind::Raw => format!("/dev/cpu/{cpu}/msr"),
    }
}

/// Pass a raw 64-bit register value through a signal channel bit-for-bit.
///
/// Raw-register leaf signals traffic in `f64` like every other signal; the
/// register bits ride the mantissa/exponent unchanged and are recovered with
/// [`signal_to_field`] by whichever field decode sits on top.
pub fn field_to_signal(raw: u64) -> f64 {
    f64::from_bits(raw)
}

/// Inverse of [`field_to_signal`].
pub fn signal_to_field(signal: f64) -> u64 {
    signal.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msr_paths() {
        assert_eq!(msr_path(0, DriverKind::Safe), "/dev/cpu/0/msr_safe");
        assert_eq!(msr_path(17, DriverKind::Raw), "/dev/cpu/17/msr");
    }

    #[test]
    fn test_field_transport_round_trip() {
        for raw in [0u64, 1, 0xDEADBEEF, u64::MAX, 1 << 63] {
            assert_eq!(signal_to_field(field_to_signal(raw)), raw);
        }
    }
}
