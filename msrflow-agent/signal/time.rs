//! Monotonic time as a signal
//!
//! The batched path reports the timestamp latched by the facade once per
//! read batch, so every signal derived from time within one batch observes
//! the same instant. The immediate path reports the live clock.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use crate::error::Result;

use super::{not_setup, Signal};

/// Clock shared between the facade and its time signals.
#[derive(Clone)]
pub struct TimeKeeper {
    zero: Instant,
    batch_time: Rc<Cell<f64>>,
}

impl TimeKeeper {
    pub fn new() -> Self {
        Self {
            zero: Instant::now(),
            batch_time: Rc::new(Cell::new(0.0)),
        }
    }

    /// Seconds since the keeper was created.
    pub fn now(&self) -> f64 {
        self.zero.elapsed().as_secs_f64()
    }

    /// Latch the current time as the batch timestamp.
    pub fn latch(&self) {
        self.batch_time.set(self.now());
    }

    /// The latched batch timestamp.
    pub fn batch_time(&self) -> f64 {
        self.batch_time.get()
    }
}

impl Default for TimeKeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal view of the shared clock.
pub struct TimeSignal {
    keeper: TimeKeeper,
    is_batch_ready: bool,
}

impl TimeSignal {
    pub fn new(keeper: TimeKeeper) -> Self {
        Self {
            keeper,
            is_batch_ready: false,
        }
    }
}

impl Signal for TimeSignal {
    fn setup_batch(&mut self) -> Result<()> {
        self.is_batch_ready = true;
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        Ok(self.keeper.batch_time())
    }

    fn read(&mut self) -> Result<f64> {
        Ok(self.keeper.now())
    }
}
