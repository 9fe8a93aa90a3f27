//! # msrflow-raw
//!
//! Hardware ABI layer for batched model-specific-register access.
//!
//! This crate carries the pieces that are fixed by the kernel and the
//! hardware rather than by policy: the MSR character-device paths (both the
//! safety-checked `msr_safe` driver and the raw `msr` driver), the
//! fixed-layout request passed to the `msr_batch` ioctl, and the bitfield
//! codecs used to translate between register fields and physical values.
//!
//! ## Usage
//!
//! ```ignore
//! use msrflow_raw::field::{self, Function};
//!
//! let mask = field::field_mask(8, 14)?;
//! let raw = field::extract(0x2800, mask, 8);
//! let watts = field::decode(raw, Function::Scale, 0.125);
//! ```

pub mod field;
pub mod ioctl;
pub mod msr;

pub use field::{FieldError, Function};
pub use ioctl::{BatchArray, BatchOp};
pub use msr::{field_to_signal, msr_path, signal_to_field, DriverKind};
