//! Batched register transport: device backends, batch driver, and the
//! push/sample/adjust facade layered on top.

pub mod device;
pub mod driver;
pub mod facade;
pub mod sim;
pub mod uring;

pub use device::{MsrDevice, RegisterDevice};
pub use driver::{MsrBatchDriver, DEFAULT_CONTEXT};
pub use facade::BatchIo;
pub use sim::SimDevice;

use std::cell::RefCell;
use std::rc::Rc;

/// Shared handle to the batch driver; signals and controls hold one each.
pub type DriverRef = Rc<RefCell<MsrBatchDriver>>;
