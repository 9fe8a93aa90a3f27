//! Time-derivative of a child signal over a sliding window
//!
//! The batched path keeps a ring of `(time, value)` observations, one per
//! distinct batch timestamp, and reports the least-squares slope of the
//! window. The immediate path collects its own short burst of reads spaced
//! by a minimum interval.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Result;

use super::{not_setup, Signal, SignalRef};

pub struct DerivativeSignal {
    time: SignalRef,
    value: SignalRef,
    window: usize,
    min_interval: Duration,
    history: VecDeque<(f64, f64)>,
    last_result: f64,
    is_batch_ready: bool,
}

impl DerivativeSignal {
    /// `window` is the maximum number of observations regressed over;
    /// `min_interval` spaces the immediate-path burst.
    pub fn new(time: SignalRef, value: SignalRef, window: usize, min_interval: Duration) -> Self {
        Self {
            time,
            value,
            window: window.max(2),
            min_interval,
            history: VecDeque::new(),
            last_result: f64::NAN,
            is_batch_ready: false,
        }
    }

    /// Least-squares slope of the observations; NaN below two points or for
    /// a degenerate time spread.
    fn slope(history: &VecDeque<(f64, f64)>) -> f64 {
        let n = history.len();
        if n < 2 {
            return f64::NAN;
        }
        let n_f = n as f64;
        let (mut sum_t, mut sum_v) = (0.0, 0.0);
        for &(t, v) in history {
            sum_t += t;
            sum_v += v;
        }
        let (mean_t, mean_v) = (sum_t / n_f, sum_v / n_f);
        let (mut num, mut den) = (0.0, 0.0);
        for &(t, v) in history {
            num += (t - mean_t) * (v - mean_v);
            den += (t - mean_t) * (t - mean_t);
        }
        if den == 0.0 {
            f64::NAN
        } else {
            num / den
        }
    }

    fn push(history: &mut VecDeque<(f64, f64)>, window: usize, time: f64, value: f64) {
        if history.len() == window {
            history.pop_front();
        }
        history.push_back((time, value));
    }
}

impl Signal for DerivativeSignal {
    fn setup_batch(&mut self) -> Result<()> {
        if !self.is_batch_ready {
            self.time.borrow_mut().setup_batch()?;
            self.value.borrow_mut().setup_batch()?;
            self.is_batch_ready = true;
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        if !self.is_batch_ready {
            return Err(not_setup());
        }
        let time = self.time.borrow_mut().sample()?;
        // Repeated samples within one batch return the cached result rather
        // than double-counting the observation.
        if self.history.back().is_some_and(|&(t, _)| t == time) {
            return Ok(self.last_result);
        }
        let value = self.value.borrow_mut().sample()?;
        Self::push(&mut self.history, self.window, time, value);
        self.last_result = Self::slope(&self.history);
        Ok(self.last_result)
    }

    fn read(&mut self) -> Result<f64> {
        let mut burst = VecDeque::new();
        for i in 0..self.window {
            let time = self.time.borrow_mut().read()?;
            let value = self.value.borrow_mut().read()?;
            Self::push(&mut burst, self.window, time, value);
            if i + 1 < self.window {
                std::thread::sleep(self.min_interval);
            }
        }
        Ok(Self::slope(&burst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::testing::MockSignal;
    use std::cell::Cell;
    use std::rc::Rc;

    fn derivative(window: usize) -> (DerivativeSignal, (Rc<Cell<f64>>, Rc<Cell<f64>>)) {
        let (time, time_value, _) = MockSignal::shared(0.0);
        let (value, value_value, _) = MockSignal::shared(0.0);
        let sig = DerivativeSignal::new(time, value, window, Duration::from_millis(0));
        (sig, (time_value, value_value))
    }

    #[test]
    fn test_fewer_than_two_points_is_nan() {
        let (mut sig, (time, _value)) = derivative(8);
        sig.setup_batch().unwrap();
        time.set(1.0);
        assert!(sig.sample().unwrap().is_nan());
    }

    #[test]
    fn test_slope_of_linear_series() {
        let (mut sig, (time, value)) = derivative(8);
        sig.setup_batch().unwrap();
        for i in 0..5 {
            time.set(i as f64);
            value.set(3.0 * i as f64 + 7.0);
            let result = sig.sample().unwrap();
            if i > 0 {
                assert!((result - 3.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_window_evicts_old_points() {
        let (mut sig, (time, value)) = derivative(3);
        sig.setup_batch().unwrap();
        // Slope 1 for the first points, then slope 5; a window of 3 forgets
        // the old regime after three new points.
        for i in 0..4 {
            time.set(i as f64);
            value.set(i as f64);
            sig.sample().unwrap();
        }
        for i in 4..7 {
            time.set(i as f64);
            value.set(5.0 * i as f64);
            sig.sample().unwrap();
        }
        time.set(7.0);
        value.set(35.0);
        assert!((sig.sample().unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_timestamp_returns_cached_result() {
        let (mut sig, (time, value)) = derivative(8);
        sig.setup_batch().unwrap();
        time.set(0.0);
        value.set(0.0);
        sig.sample().unwrap();
        time.set(1.0);
        value.set(2.0);
        let first = sig.sample().unwrap();
        // Same batch timestamp, changed child value: no new observation.
        value.set(1000.0);
        assert_eq!(sig.sample().unwrap(), first);
        assert_eq!(first, 2.0);
    }

    #[test]
    fn test_immediate_read_regresses_own_burst() {
        let (time, time_value, _) = MockSignal::shared(0.0);
        let (value, _, _) = MockSignal::shared(5.0);
        let mut sig = DerivativeSignal::new(time, value, 4, Duration::from_millis(0));
        // Constant value over a degenerate zero-width time base is NaN.
        let _ = time_value;
        assert!(sig.read().unwrap().is_nan());
    }
}
