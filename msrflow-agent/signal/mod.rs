//! Composable read-side signal tree
//!
//! A signal is a node that produces an `f64`: leaves sample raw registers
//! through the batch driver, inner nodes combine child samples. Every node
//! supports two read paths: the batched path (`setup_batch` once, then
//! `sample` after each driver round trip) and the immediate path (`read`,
//! which performs its own device access and works without any setup).
//!
//! Nodes are shared: the same leaf may sit under several parents, so
//! `setup_batch` must tolerate repeated invocation and register device
//! operations exactly once.

mod combined;
mod derivative;
mod msr;
mod time;

pub use combined::{DifferenceSignal, ProductSignal, RatioSignal};
pub use derivative::DerivativeSignal;
pub use msr::{MsrFieldSignal, RawMsrSignal};
pub use time::{TimeKeeper, TimeSignal};

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{MsrflowError, Result};

/// Shared handle to a signal node.
pub type SignalRef = Rc<RefCell<dyn Signal>>;

pub trait Signal {
    /// Register this node's device operations with the batch driver.
    /// Idempotent; repeated calls do not add operations.
    fn setup_batch(&mut self) -> Result<()>;

    /// Value from the latest batch round trip. Fails with a runtime error
    /// until `setup_batch` has been called.
    fn sample(&mut self) -> Result<f64>;

    /// Immediate value, bypassing the batch machinery.
    fn read(&mut self) -> Result<f64>;
}

pub(crate) fn not_setup() -> MsrflowError {
    MsrflowError::Runtime("setup_batch() must be called before sample()".to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::Cell;

    /// Scripted child signal that counts lifecycle calls.
    pub struct MockSignal {
        pub value: Rc<Cell<f64>>,
        pub setup_count: Rc<Cell<usize>>,
        is_batch_ready: bool,
    }

    impl MockSignal {
        pub fn new(value: f64) -> Self {
            Self {
                value: Rc::new(Cell::new(value)),
                setup_count: Rc::new(Cell::new(0)),
                is_batch_ready: false,
            }
        }

        pub fn shared(value: f64) -> (Rc<RefCell<MockSignal>>, Rc<Cell<f64>>, Rc<Cell<usize>>) {
            let mock = MockSignal::new(value);
            let value = mock.value.clone();
            let count = mock.setup_count.clone();
            (Rc::new(RefCell::new(mock)), value, count)
        }
    }

    impl Signal for MockSignal {
        fn setup_batch(&mut self) -> Result<()> {
            if !self.is_batch_ready {
                self.setup_count.set(self.setup_count.get() + 1);
                self.is_batch_ready = true;
            }
            Ok(())
        }

        fn sample(&mut self) -> Result<f64> {
            if !self.is_batch_ready {
                return Err(not_setup());
            }
            Ok(self.value.get())
        }

        fn read(&mut self) -> Result<f64> {
            Ok(self.value.get())
        }
    }
}
