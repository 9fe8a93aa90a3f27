//! Per-package power balancing arithmetic
//!
//! One balancer tracks one package: the cap handed down from above, the
//! limit currently requested below the cap, and a filtered runtime
//! measurement. Runtime samples are collected until enough exist for a
//! median, which discards outlier epochs. Once a target runtime arrives
//! the limit tracks it proportionally: running faster than the slowest
//! peer means spare power, so the limit shrinks by the observed ratio; a
//! node that overshoots the target grows back toward the cap.

/// Relative runtime tolerance within which the target counts as met.
const RUNTIME_FRACTION: f64 = 0.03;
/// Number of epoch runtimes filtered into one measurement.
const MIN_NUM_SAMPLE: usize = 5;

pub struct PowerBalancer {
    runtime_fraction: f64,
    min_num_sample: usize,
    power_cap: f64,
    power_limit: f64,
    target_runtime: f64,
    runtimes: Vec<f64>,
    runtime_sample: f64,
}

impl PowerBalancer {
    pub fn new() -> Self {
        Self::with_params(RUNTIME_FRACTION, MIN_NUM_SAMPLE)
    }

    pub fn with_params(runtime_fraction: f64, min_num_sample: usize) -> Self {
        Self {
            runtime_fraction,
            min_num_sample: min_num_sample.max(1),
            power_cap: f64::NAN,
            power_limit: f64::NAN,
            target_runtime: f64::NAN,
            runtimes: Vec::new(),
            runtime_sample: f64::NAN,
        }
    }

    /// Reset to a fresh cap: the limit rises to the cap and measurement
    /// state is discarded.
    pub fn set_power_cap(&mut self, cap: f64) {
        self.power_cap = cap;
        self.power_limit = cap;
        self.target_runtime = f64::NAN;
        self.runtimes.clear();
        self.runtime_sample = f64::NAN;
    }

    pub fn power_cap(&self) -> f64 {
        self.power_cap
    }

    pub fn power_limit(&self) -> f64 {
        self.power_limit
    }

    /// Record the limit actually applied, which may have been clamped by
    /// the platform bounds.
    pub fn power_limit_adjusted(&mut self, limit: f64) {
        self.power_limit = limit;
    }

    /// Feed one epoch runtime; true once enough samples exist for a stable
    /// median.
    pub fn is_runtime_stable(&mut self, measured: f64) -> bool {
        if measured.is_finite() && measured > 0.0 {
            self.runtimes.push(measured);
        }
        if self.runtimes.len() >= self.min_num_sample {
            self.runtime_sample = crate::agg::median(&self.runtimes);
            true
        } else {
            false
        }
    }

    /// Median epoch runtime, NaN until stable.
    pub fn runtime_sample(&self) -> f64 {
        self.runtime_sample
    }

    pub fn set_target_runtime(&mut self, target: f64) {
        self.target_runtime = target;
        self.runtimes.clear();
    }

    pub fn target_runtime(&self) -> f64 {
        self.target_runtime
    }

    /// Feed one epoch runtime while chasing the target. Returns true when
    /// the measurement lies within the tolerance band; otherwise the limit
    /// moves proportionally to `measured / target` and stays below the
    /// cap. The caller clamps against the platform floor.
    pub fn is_target_met(&mut self, measured: f64) -> bool {
        if !self.target_runtime.is_finite() || self.target_runtime <= 0.0 {
            return true;
        }
        if !measured.is_finite() || measured <= 0.0 {
            return false;
        }
        let ratio = measured / self.target_runtime;
        if (ratio - 1.0).abs() <= self.runtime_fraction {
            return true;
        }
        self.power_limit = (self.power_limit * ratio).min(self.power_cap);
        false
    }

    /// Power handed back to the tree: the gap between the cap and the
    /// limit actually needed.
    pub fn power_slack(&self) -> f64 {
        let slack = self.power_cap - self.power_limit;
        if slack.is_finite() {
            slack.max(0.0)
        } else {
            0.0
        }
    }
}

impl Default for PowerBalancer {
    fn default() -> Self {
        Self::new()
    }
}
