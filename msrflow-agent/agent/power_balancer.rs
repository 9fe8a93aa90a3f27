//! Power-balancing agent
//!
//! Balances a job-wide power budget across nodes so the slowest node runs
//! as fast as possible. The tree repeats a three-step cycle driven by an
//! absolute step counter (step kind = counter mod 3):
//!
//! 1. `SendDownLimit` - the budget, plus any slack recovered in the last
//!    cycle, flows down and is spread over the packages of each node.
//! 2. `MeasureRuntime` - each leaf measures its epoch runtime under the
//!    current limit until a median-filtered sample stabilizes; the maximum
//!    flows back up.
//! 3. `ReduceLimit` - leaves faster than the job-wide maximum shed power
//!    proportionally until they match it; the recovered slack flows up and
//!    seeds the next cycle.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::agg;
use crate::batchio::BatchIo;
use crate::config::Domain;
use crate::error::{MsrflowError, Result};

use super::balancer::PowerBalancer;
use super::{Agent, Waiter};

pub const POLICY_POWER_LIMIT: usize = 0;
pub const POLICY_STEP_COUNT: usize = 1;
pub const POLICY_MAX_EPOCH_RUNTIME: usize = 2;
pub const POLICY_POWER_SLACK: usize = 3;
pub const NUM_POLICY: usize = 4;

pub const SAMPLE_STEP_COUNT: usize = 0;
pub const SAMPLE_MAX_EPOCH_RUNTIME: usize = 1;
pub const SAMPLE_SUM_POWER_SLACK: usize = 2;
pub const SAMPLE_MIN_POWER_HEADROOM: usize = 3;
pub const NUM_SAMPLE: usize = 4;

/// Aggregation applied per sample field when children combine.
const SAMPLE_AGG: [fn(&[f64]) -> f64; NUM_SAMPLE] = [agg::min, agg::max, agg::sum, agg::min];

/// Control period of the leaf loop.
const WAIT_PERIOD: Duration = Duration::from_millis(5);
/// RAPL averaging window written at startup.
const TIME_WINDOW: f64 = 0.015;

/// One phase of the balancing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SendDownLimit,
    MeasureRuntime,
    ReduceLimit,
}

impl Step {
    pub const COUNT: i64 = 3;

    pub fn from_count(step_count: i64) -> Self {
        match step_count.rem_euclid(Self::COUNT) {
            0 => Self::SendDownLimit,
            1 => Self::MeasureRuntime,
            _ => Self::ReduceLimit,
        }
    }
}

fn policy_out_of_sync() -> MsrflowError {
    MsrflowError::InvalidArgument("policy step is out of sync with agent step".to_string())
}

// ---------------------------------------------------------------------------
// Leaf role

struct PackageState {
    limit_handle: usize,
    epoch_handle: Option<usize>,
    last_epoch_count: f64,
    last_epoch_time: f64,
    runtime: f64,
    power_slack: f64,
    power_headroom: f64,
    actual_limit: f64,
    is_out_of_bounds: bool,
    is_step_complete: bool,
}

struct LeafRole {
    io: Rc<RefCell<BatchIo>>,
    time_handle: usize,
    packages: Vec<PackageState>,
    balancers: Vec<PowerBalancer>,
    policy: Vec<f64>,
    step_count: i64,
    min_power: f64,
    max_power: f64,
    is_single_node: bool,
    is_first_policy: bool,
    /// Synthetic epoch counter for runs without an epoch signal; each
    /// sample pass counts as one epoch.
    tick: f64,
}

impl LeafRole {
    fn new(
        io: Rc<RefCell<BatchIo>>,
        epoch_signal: Option<&str>,
        min_power: f64,
        max_power: f64,
        is_single_node: bool,
    ) -> Result<Self> {
        let num_package = io.borrow().topo().num_domain(Domain::Package);
        let time_handle = io.borrow_mut().push_signal("TIME", Domain::Board, 0)?;
        let mut packages = Vec::with_capacity(num_package);
        for pkg_idx in 0..num_package {
            let mut io = io.borrow_mut();
            let epoch_handle = match epoch_signal {
                Some(name) => Some(io.push_signal(name, Domain::Package, pkg_idx)?),
                None => None,
            };
            let limit_handle =
                io.push_control("CPU_POWER_LIMIT_CONTROL", Domain::Package, pkg_idx)?;
            packages.push(PackageState {
                limit_handle,
                epoch_handle,
                last_epoch_count: 0.0,
                last_epoch_time: 0.0,
                runtime: 0.0,
                power_slack: 0.0,
                power_headroom: 0.0,
                actual_limit: f64::NAN,
                is_out_of_bounds: false,
                is_step_complete: true,
            });
        }
        Ok(Self {
            io,
            time_handle,
            packages,
            balancers: (0..num_package).map(|_| PowerBalancer::new()).collect(),
            policy: vec![0.0; NUM_POLICY],
            step_count: 0,
            min_power,
            max_power,
            is_single_node,
            is_first_policy: true,
            tick: 0.0,
        })
    }

    fn step(&self) -> Step {
        Step::from_count(self.step_count)
    }

    fn set_steps_complete(&mut self, is_complete: bool) {
        for pkg in &mut self.packages {
            pkg.is_step_complete = is_complete;
        }
    }

    fn are_steps_complete(&self) -> bool {
        self.packages.iter().all(|pkg| pkg.is_step_complete)
    }

    /// Feed the completed step's result back into the policy a parent
    /// would have produced; single-node runs are their own tree.
    fn self_advance_policy(&mut self) {
        match self.step() {
            Step::SendDownLimit => {
                self.policy[POLICY_POWER_LIMIT] = 0.0;
            }
            Step::MeasureRuntime => {}
            Step::ReduceLimit => {}
        }
        self.policy[POLICY_STEP_COUNT] += 1.0;
    }

    fn adjust_platform(&mut self, in_policy: &[f64]) -> Result<bool> {
        if self.is_single_node {
            if self.is_first_policy {
                self.policy = in_policy.to_vec();
                self.is_first_policy = false;
            } else if self.are_steps_complete() {
                self.self_advance_policy();
            }
        } else {
            self.policy = in_policy.to_vec();
        }

        if self.policy[POLICY_POWER_LIMIT] != 0.0 {
            // Fresh budget from above, restart the cycle.
            self.step_count = 0;
            let pkg_limit = self.policy[POLICY_POWER_LIMIT] / self.packages.len() as f64;
            for balancer in &mut self.balancers {
                balancer.set_power_cap(pkg_limit);
            }
            self.set_steps_complete(true);
        } else if self.policy[POLICY_STEP_COUNT] != self.step_count as f64 {
            self.step_count += 1;
            self.set_steps_complete(false);
            if self.policy[POLICY_STEP_COUNT] != self.step_count as f64 {
                return Err(policy_out_of_sync());
            }
            self.enter_step()?;
        }

        let mut result = false;
        for (pkg, balancer) in self.packages.iter_mut().zip(&mut self.balancers) {
            let mut request = balancer.power_limit();
            if request.is_nan() || request == 0.0 {
                continue;
            }
            if request < self.min_power {
                pkg.is_out_of_bounds = true;
                request = self.min_power;
            }
            if request != pkg.actual_limit {
                balancer.power_limit_adjusted(request);
                pkg.actual_limit = request;
                result = true;
            }
        }
        if result {
            // The write batch commits every pushed control, so every
            // package restages its limit even when only one moved.
            for pkg in &self.packages {
                self.io.borrow_mut().adjust(pkg.limit_handle, pkg.actual_limit)?;
            }
        }
        Ok(result)
    }

    fn enter_step(&mut self) -> Result<()> {
        match self.step() {
            Step::SendDownLimit => self.distribute_slack(),
            Step::MeasureRuntime => {}
            Step::ReduceLimit => {
                let target = self.policy[POLICY_MAX_EPOCH_RUNTIME];
                for balancer in &mut self.balancers {
                    balancer.set_target_runtime(target);
                }
            }
        }
        Ok(())
    }

    /// Spread the slack granted by the tree over the packages, giving more
    /// to packages with more headroom, without exceeding the platform
    /// maximum on any of them.
    fn distribute_slack(&mut self) {
        let mut slack = self.policy[POLICY_POWER_SLACK];
        let num_package = self.packages.len() as f64;
        let min_headroom = self
            .balancers
            .iter()
            .map(|b| self.max_power - b.power_limit())
            .fold(f64::MAX, f64::min);
        let mut even_slack = slack / num_package;
        if even_slack < min_headroom {
            slack = 0.0;
        } else {
            even_slack = min_headroom;
            slack -= even_slack * num_package;
        }
        let total_headroom: f64 = self
            .balancers
            .iter()
            .map(|b| self.max_power - (b.power_limit() + even_slack))
            .sum();
        for balancer in &mut self.balancers {
            let headroom = self.max_power - (balancer.power_limit() + even_slack);
            let factor = if total_headroom != 0.0 {
                headroom / total_headroom
            } else {
                1.0
            };
            let cap = balancer.power_limit() + even_slack + factor * slack;
            balancer.set_power_cap(cap);
        }
        self.set_steps_complete(true);
    }

    fn epoch_count(io: &mut BatchIo, pkg: &PackageState, tick: f64) -> Result<f64> {
        match pkg.epoch_handle {
            Some(handle) => io.sample(handle),
            None => Ok(tick),
        }
    }

    fn sample_platform(&mut self, out_sample: &mut [f64]) -> Result<bool> {
        if out_sample.len() != NUM_SAMPLE {
            return Err(MsrflowError::InvalidArgument(
                "sample vector incorrectly sized".to_string(),
            ));
        }
        self.tick += 1.0;
        let time = self.io.borrow_mut().sample(self.time_handle)?;
        match self.step() {
            Step::SendDownLimit => {}
            Step::MeasureRuntime => {
                for (pkg, balancer) in self.packages.iter_mut().zip(&mut self.balancers) {
                    let epoch_count =
                        Self::epoch_count(&mut self.io.borrow_mut(), pkg, self.tick)?;
                    if epoch_count > 1.0
                        && epoch_count != pkg.last_epoch_count
                        && !pkg.is_step_complete
                    {
                        let epoch_runtime = time - pkg.last_epoch_time;
                        pkg.is_step_complete = balancer.is_runtime_stable(epoch_runtime);
                        if pkg.is_step_complete {
                            pkg.runtime = balancer.runtime_sample();
                        }
                    }
                    if epoch_count != pkg.last_epoch_count {
                        pkg.last_epoch_time = time;
                    }
                    pkg.last_epoch_count = epoch_count;
                }
            }
            Step::ReduceLimit => {
                for (pkg, balancer) in self.packages.iter_mut().zip(&mut self.balancers) {
                    let epoch_count =
                        Self::epoch_count(&mut self.io.borrow_mut(), pkg, self.tick)?;
                    if epoch_count > 1.0
                        && epoch_count != pkg.last_epoch_count
                        && !pkg.is_step_complete
                    {
                        let epoch_runtime = time - pkg.last_epoch_time;
                        pkg.is_step_complete =
                            pkg.is_out_of_bounds || balancer.is_target_met(epoch_runtime);
                        pkg.power_slack = balancer.power_slack();
                        pkg.is_out_of_bounds = false;
                        pkg.power_headroom = self.max_power - balancer.power_limit();
                    }
                    if epoch_count != pkg.last_epoch_count {
                        pkg.last_epoch_time = time;
                    }
                    pkg.last_epoch_count = epoch_count;
                }
            }
        }

        let mut runtime = 0.0;
        let mut power_slack = 0.0;
        let mut power_headroom = 0.0;
        for pkg in &self.packages {
            runtime = f64::max(runtime, pkg.runtime);
            power_slack += pkg.power_slack;
            power_headroom += pkg.power_headroom;
        }
        out_sample[SAMPLE_STEP_COUNT] = self.step_count as f64;
        out_sample[SAMPLE_MAX_EPOCH_RUNTIME] = runtime;
        out_sample[SAMPLE_SUM_POWER_SLACK] = power_slack;
        out_sample[SAMPLE_MIN_POWER_HEADROOM] = power_headroom;

        let result = self.are_steps_complete();
        if self.is_single_node && result {
            self.policy[POLICY_MAX_EPOCH_RUNTIME] = runtime;
            self.policy[POLICY_POWER_SLACK] = f64::min(power_slack, power_headroom);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tree and root roles

struct TreeRole {
    num_children: usize,
    step_count: i64,
    is_step_complete: bool,
    policy: Vec<f64>,
}

impl TreeRole {
    fn new(level: usize, fan_in: &[usize]) -> Result<Self> {
        let num_children = *fan_in.get(level - 1).ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "level {level} exceeds the fan-in description {fan_in:?}"
            ))
        })?;
        Ok(Self {
            num_children,
            step_count: 0,
            is_step_complete: true,
            policy: vec![0.0; NUM_POLICY],
        })
    }

    fn descend(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<bool> {
        if out_policy.len() != self.num_children {
            return Err(MsrflowError::InvalidArgument(
                "child policy vectors incorrectly sized".to_string(),
            ));
        }
        if self.is_step_complete && in_policy[POLICY_STEP_COUNT] != self.step_count as f64 {
            if in_policy[POLICY_STEP_COUNT] == 0.0 {
                self.step_count = 0;
            } else if in_policy[POLICY_STEP_COUNT] == (self.step_count + 1) as f64 {
                self.step_count += 1;
            } else {
                return Err(policy_out_of_sync());
            }
            self.is_step_complete = false;
            for child in out_policy.iter_mut() {
                *child = in_policy.to_vec();
            }
            self.policy = in_policy.to_vec();
            return Ok(true);
        }
        Ok(false)
    }

    fn ascend(&mut self, in_sample: &[Vec<f64>], out_sample: &mut [f64]) -> Result<bool> {
        if in_sample.len() != self.num_children || out_sample.len() != NUM_SAMPLE {
            return Err(MsrflowError::InvalidArgument(
                "sample vectors incorrectly sized".to_string(),
            ));
        }
        for (field, agg_fn) in SAMPLE_AGG.iter().enumerate() {
            let column: Vec<f64> = in_sample.iter().map(|child| child[field]).collect();
            out_sample[field] = agg_fn(&column);
        }
        // The step is complete once the slowest child has caught up.
        if !self.is_step_complete && out_sample[SAMPLE_STEP_COUNT] == self.step_count as f64 {
            self.is_step_complete = true;
            return Ok(true);
        }
        Ok(false)
    }
}

struct RootRole {
    tree: TreeRole,
    root_cap: f64,
    min_power: f64,
    max_power: f64,
    num_node: usize,
}

impl RootRole {
    fn new(level: usize, fan_in: &[usize], min_power: f64, max_power: f64) -> Result<Self> {
        let mut tree = TreeRole::new(level, fan_in)?;
        tree.is_step_complete = false;
        Ok(Self {
            tree,
            root_cap: f64::NAN,
            min_power,
            max_power,
            num_node: fan_in.iter().product(),
        })
    }

    fn descend(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<bool> {
        if out_policy.len() != self.tree.num_children {
            return Err(MsrflowError::InvalidArgument(
                "child policy vectors incorrectly sized".to_string(),
            ));
        }
        let mut result = false;
        if in_policy[POLICY_POWER_LIMIT] != self.root_cap
            && !(in_policy[POLICY_POWER_LIMIT].is_nan() && self.root_cap.is_nan())
        {
            // New budget from the resource manager, restart the cycle.
            self.tree.step_count = 0;
            self.root_cap = in_policy[POLICY_POWER_LIMIT];
            self.tree.policy = vec![self.root_cap, 0.0, 0.0, 0.0];
            if self.root_cap > self.max_power || self.root_cap < self.min_power {
                return Err(MsrflowError::InvalidArgument(format!(
                    "invalid power budget: {}",
                    self.root_cap
                )));
            }
            result = true;
        } else if (self.tree.step_count + 1) as f64 == self.tree.policy[POLICY_STEP_COUNT] {
            self.tree.step_count += 1;
            self.tree.is_step_complete = false;
            result = true;
        } else if self.tree.step_count as f64 != self.tree.policy[POLICY_STEP_COUNT] {
            return Err(policy_out_of_sync());
        }
        if result {
            for child in out_policy.iter_mut() {
                *child = self.tree.policy.clone();
            }
        }
        Ok(result)
    }

    fn ascend(&mut self, in_sample: &[Vec<f64>], out_sample: &mut [f64]) -> Result<bool> {
        let result = self.tree.ascend(in_sample, out_sample)?;
        if result {
            if self.tree.step_count as f64 != self.tree.policy[POLICY_STEP_COUNT] {
                return Err(policy_out_of_sync());
            }
            match Step::from_count(self.tree.step_count) {
                Step::SendDownLimit => {
                    self.tree.policy[POLICY_POWER_LIMIT] = 0.0;
                }
                Step::MeasureRuntime => {
                    self.tree.policy[POLICY_MAX_EPOCH_RUNTIME] =
                        out_sample[SAMPLE_MAX_EPOCH_RUNTIME];
                }
                Step::ReduceLimit => {
                    let slack = out_sample[SAMPLE_SUM_POWER_SLACK] / self.num_node as f64;
                    let headroom = out_sample[SAMPLE_MIN_POWER_HEADROOM];
                    self.tree.policy[POLICY_POWER_SLACK] = f64::min(slack, headroom);
                }
            }
            self.tree.policy[POLICY_STEP_COUNT] = (self.tree.step_count + 1) as f64;
        }
        Ok(result)
    }
}

enum Role {
    Leaf(LeafRole),
    Tree(TreeRole),
    Root(RootRole),
}

// ---------------------------------------------------------------------------
// Outer agent

pub struct PowerBalancerAgent {
    io: Rc<RefCell<BatchIo>>,
    role: Option<Role>,
    epoch_signal: Option<String>,
    min_power: f64,
    max_power: f64,
    power_tdp: f64,
    do_send_policy: bool,
    do_send_sample: bool,
    do_write_batch: bool,
    waiter: Waiter,
}

impl PowerBalancerAgent {
    /// Platform power bounds are read immediately; the role is fixed later
    /// by [`Agent::init`].
    pub fn new(io: Rc<RefCell<BatchIo>>) -> Result<Self> {
        let (min_power, max_power, power_tdp) = {
            let mut io = io.borrow_mut();
            (
                io.read_signal("CPU_POWER_MIN_AVAIL", Domain::Package, 0)?,
                io.read_signal("CPU_POWER_MAX_AVAIL", Domain::Package, 0)?,
                io.read_signal("CPU_POWER_LIMIT_DEFAULT", Domain::Package, 0)?,
            )
        };
        Ok(Self {
            io,
            role: None,
            epoch_signal: None,
            min_power,
            max_power,
            power_tdp,
            do_send_policy: false,
            do_send_sample: false,
            do_write_batch: false,
            waiter: Waiter::new(WAIT_PERIOD),
        })
    }

    /// Use a pushed signal as the epoch counter instead of treating every
    /// control interval as an epoch.
    pub fn with_epoch_signal(mut self, name: impl Into<String>) -> Self {
        self.epoch_signal = Some(name.into());
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.waiter = Waiter::new(period);
        self
    }

    fn role_mut(&mut self) -> Result<&mut Role> {
        self.role
            .as_mut()
            .ok_or_else(|| MsrflowError::Runtime("init() has not been called".to_string()))
    }
}

impl Agent for PowerBalancerAgent {
    fn init(&mut self, level: usize, fan_in: &[usize], _is_level_root: bool) -> Result<()> {
        let is_tree_root = level == fan_in.len();
        if level == 0 {
            let role = LeafRole::new(
                self.io.clone(),
                self.epoch_signal.as_deref(),
                self.min_power,
                self.max_power,
                is_tree_root,
            )?;
            {
                let mut io = self.io.borrow_mut();
                for pkg_idx in 0..io.topo().num_domain(Domain::Package) {
                    io.write_control(
                        "CPU_POWER_TIME_WINDOW_CONTROL",
                        Domain::Package,
                        pkg_idx,
                        TIME_WINDOW,
                    )?;
                }
            }
            self.role = Some(Role::Leaf(role));
        } else if is_tree_root {
            self.role = Some(Role::Root(RootRole::new(
                level,
                fan_in,
                self.min_power,
                self.max_power,
            )?));
        } else {
            self.role = Some(Role::Tree(TreeRole::new(level, fan_in)?));
        }
        Ok(())
    }

    fn validate_policy(&self, policy: &mut [f64]) -> Result<()> {
        if policy.len() != NUM_POLICY {
            return Err(MsrflowError::InvalidArgument(
                "policy vector incorrectly sized".to_string(),
            ));
        }
        if policy[POLICY_POWER_LIMIT].is_nan() {
            policy[POLICY_POWER_LIMIT] = self.power_tdp;
        }
        for field in [POLICY_STEP_COUNT, POLICY_MAX_EPOCH_RUNTIME, POLICY_POWER_SLACK] {
            if policy[field].is_nan() {
                policy[field] = 0.0;
            }
        }
        // Zero is a valid limit outside the send-down step.
        if policy[POLICY_POWER_LIMIT] != 0.0 {
            policy[POLICY_POWER_LIMIT] =
                policy[POLICY_POWER_LIMIT].clamp(self.min_power, self.max_power);
        }
        if policy.iter().all(|&field| field == 0.0) {
            return Err(MsrflowError::InvalidArgument(
                "policy of all zeros is not valid".to_string(),
            ));
        }
        Ok(())
    }

    fn split_policy(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<()> {
        self.do_send_policy = match self.role_mut()? {
            Role::Tree(tree) => tree.descend(in_policy, out_policy)?,
            Role::Root(root) => root.descend(in_policy, out_policy)?,
            Role::Leaf(_) => {
                return Err(MsrflowError::Runtime(
                    "split_policy() called on a leaf agent".to_string(),
                ))
            }
        };
        Ok(())
    }

    fn do_send_policy(&self) -> bool {
        self.do_send_policy
    }

    fn aggregate_sample(&mut self, in_sample: &[Vec<f64>], out_sample: &mut [f64]) -> Result<()> {
        self.do_send_sample = match self.role_mut()? {
            Role::Tree(tree) => tree.ascend(in_sample, out_sample)?,
            Role::Root(root) => root.ascend(in_sample, out_sample)?,
            Role::Leaf(_) => {
                return Err(MsrflowError::Runtime(
                    "aggregate_sample() called on a leaf agent".to_string(),
                ))
            }
        };
        Ok(())
    }

    fn do_send_sample(&self) -> bool {
        self.do_send_sample
    }

    fn adjust_platform(&mut self, in_policy: &[f64]) -> Result<()> {
        if in_policy.len() != NUM_POLICY {
            return Err(MsrflowError::InvalidArgument(
                "policy vector incorrectly sized".to_string(),
            ));
        }
        self.do_write_batch = match self.role_mut()? {
            Role::Leaf(leaf) => leaf.adjust_platform(in_policy)?,
            _ => {
                return Err(MsrflowError::Runtime(
                    "adjust_platform() called on a non-leaf agent".to_string(),
                ))
            }
        };
        Ok(())
    }

    fn do_write_batch(&self) -> bool {
        self.do_write_batch
    }

    fn sample_platform(&mut self, out_sample: &mut [f64]) -> Result<()> {
        self.do_send_sample = match self.role_mut()? {
            Role::Leaf(leaf) => leaf.sample_platform(out_sample)?,
            _ => {
                return Err(MsrflowError::Runtime(
                    "sample_platform() called on a non-leaf agent".to_string(),
                ))
            }
        };
        Ok(())
    }

    fn wait(&mut self) {
        self.waiter.wait();
    }

    fn policy_names(&self) -> Vec<String> {
        ["CPU_POWER_LIMIT", "STEP_COUNT", "MAX_EPOCH_RUNTIME", "POWER_SLACK"]
            .map(String::from)
            .to_vec()
    }

    fn sample_names(&self) -> Vec<String> {
        ["STEP_COUNT", "MAX_EPOCH_RUNTIME", "SUM_POWER_SLACK", "MIN_POWER_HEADROOM"]
            .map(String::from)
            .to_vec()
    }
}
