//! Control agents
//!
//! An agent couples the batch I/O loop to a decision policy. Agents are
//! arranged in a balanced tree spanning the job: policies flow down through
//! `split_policy`, samples flow up through `aggregate_sample`, and only
//! level-zero (leaf) agents touch the platform through `adjust_platform`
//! and `sample_platform`. A single-node job runs one leaf agent that plays
//! both ends of the tree.

pub mod balancer;
pub mod power_balancer;

pub use balancer::PowerBalancer;
pub use power_balancer::PowerBalancerAgent;

use std::time::{Duration, Instant};

use crate::error::Result;

pub trait Agent {
    /// Place the agent in the tree: its level, the fan-in at each level
    /// below it, and whether it is the root of its level.
    fn init(&mut self, level: usize, fan_in: &[usize], is_level_root: bool) -> Result<()>;

    /// Check a policy vector in place: NaN fields become defaults,
    /// out-of-range fields are clamped or rejected.
    fn validate_policy(&self, policy: &mut [f64]) -> Result<()>;

    /// Distribute the parent policy to each child; returns via
    /// [`Agent::do_send_policy`] whether the children must be updated.
    fn split_policy(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<()>;

    fn do_send_policy(&self) -> bool;

    /// Combine child samples into the sample reported upward; returns via
    /// [`Agent::do_send_sample`] whether the parent must be updated.
    fn aggregate_sample(&mut self, in_sample: &[Vec<f64>], out_sample: &mut [f64]) -> Result<()>;

    fn do_send_sample(&self) -> bool;

    /// Leaf only: stage control settings for the policy.
    fn adjust_platform(&mut self, in_policy: &[f64]) -> Result<()>;

    /// Whether the last adjust staged anything worth committing.
    fn do_write_batch(&self) -> bool;

    /// Leaf only: derive the upward sample from the latest read batch.
    fn sample_platform(&mut self, out_sample: &mut [f64]) -> Result<()>;

    /// Block until the next control interval.
    fn wait(&mut self);

    fn policy_names(&self) -> Vec<String>;
    fn sample_names(&self) -> Vec<String>;
}

/// Fixed-period waiter. Spins rather than sleeping the whole interval so
/// the wakeup jitter stays well below the control period.
pub struct Waiter {
    period: Duration,
    target: Instant,
}

impl Waiter {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            target: Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn wait(&mut self) {
        while Instant::now() < self.target {
            std::hint::spin_loop();
        }
        self.target += self.period;
        // After a stall, schedule relative to now instead of burning
        // through the backlog.
        if self.target < Instant::now() {
            self.target = Instant::now() + self.period;
        }
    }
}
