//! Composable write-side control tree
//!
//! A control is the write-side dual of a signal: leaves encode physical
//! values into register fields and stage them with the batch driver, inner
//! nodes fan a setting out to children. Every control supports the batched
//! path (`setup_batch` once, `adjust` per iteration, committed by the
//! driver's write batch) and the immediate path (`write`), plus
//! save/restore of the field it governs.

mod domain;
mod msr;

pub use domain::DomainControl;
pub use msr::MsrFieldControl;

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{MsrflowError, Result};

/// Shared handle to a control node.
pub type ControlRef = Rc<RefCell<dyn Control>>;

pub trait Control {
    /// Register this node's device operations with the batch driver.
    /// Idempotent; repeated calls do not add operations.
    fn setup_batch(&mut self) -> Result<()>;

    /// Stage `setting` for the next write batch. Fails with a runtime error
    /// until `setup_batch` has been called.
    fn adjust(&mut self, setting: f64) -> Result<()>;

    /// Immediate masked write of `setting`, bypassing the batch machinery.
    fn write(&mut self, setting: f64) -> Result<()>;

    /// Capture the governed field's current value for later restore.
    fn save(&mut self) -> Result<()>;

    /// Write back the value captured by the last save.
    fn restore(&mut self) -> Result<()>;
}

pub(crate) fn not_setup() -> MsrflowError {
    MsrflowError::Runtime("setup_batch() must be called before adjust()".to_string())
}
