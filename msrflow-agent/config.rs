//! Platform topology detection and domain addressing
//!
//! Signals and controls are addressed by `(domain, domain_idx)` rather than
//! by raw cpu number. The topology maps a domain instance to the cpus that
//! belong to it and, for register access, to the cpu a per-domain register
//! is reached through (the first cpu of the instance).

use std::collections::BTreeMap;

use crate::error::{MsrflowError, Result};

/// Hardware scope of a signal or control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    /// The whole node.
    Board,
    /// One processor package / socket.
    Package,
    /// One physical core.
    Core,
    /// One logical cpu.
    Cpu,
}

impl Domain {
    /// Parse the domain name used by metadata documents and control files.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "board" => Ok(Self::Board),
            "package" => Ok(Self::Package),
            "core" => Ok(Self::Core),
            "cpu" => Ok(Self::Cpu),
            _ => Err(MsrflowError::Parse(format!("unknown domain name: {name:?}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Package => "package",
            Self::Core => "core",
            Self::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Node topology: online cpus and their package/core membership.
#[derive(Debug, Clone)]
pub struct PlatformTopo {
    cpus: Vec<u32>,
    /// package id -> cpus, ordered by package id.
    packages: BTreeMap<u32, Vec<u32>>,
    /// (package id, core id) -> cpus, ordered.
    cores: BTreeMap<(u32, u32), Vec<u32>>,
}

impl PlatformTopo {
    /// Detect the topology from sysfs.
    pub fn detect() -> Self {
        let cpus = Self::detect_online_cpus();
        let mut packages: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut cores: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();

        for &cpu in &cpus {
            let package = Self::read_topology_id(cpu, "physical_package_id").unwrap_or(0);
            let core = Self::read_topology_id(cpu, "core_id").unwrap_or(cpu);
            packages.entry(package).or_default().push(cpu);
            cores.entry((package, core)).or_default().push(cpu);
        }

        tracing::info!(
            "detected {} packages, {} cores, {} cpus",
            packages.len(),
            cores.len(),
            cpus.len()
        );

        Self {
            cpus,
            packages,
            cores,
        }
    }

    /// Build a synthetic topology, used by the simulated device and tests.
    pub fn with_layout(num_package: u32, cpus_per_package: u32) -> Self {
        let mut cpus = Vec::new();
        let mut packages: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut cores: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
        for package in 0..num_package {
            for local in 0..cpus_per_package {
                let cpu = package * cpus_per_package + local;
                cpus.push(cpu);
                packages.entry(package).or_default().push(cpu);
                cores.entry((package, local)).or_default().push(cpu);
            }
        }
        Self {
            cpus,
            packages,
            cores,
        }
    }

    /// Detect online CPUs from /sys/devices/system/cpu/online
    pub fn detect_online_cpus() -> Vec<u32> {
        std::fs::read_to_string("/sys/devices/system/cpu/online")
            .ok()
            .and_then(|s| Self::parse_cpu_list(&s))
            .unwrap_or_else(|| {
                tracing::warn!("failed to detect online CPUs, using default: 0-7");
                (0..8).collect()
            })
    }

    /// Parse a CPU list like "0-3,8-11".
    fn parse_cpu_list(s: &str) -> Option<Vec<u32>> {
        let mut cpus = Vec::new();
        for part in s.trim().split(',') {
            if let Some((start, end)) = part.split_once('-') {
                let start: u32 = start.parse().ok()?;
                let end: u32 = end.parse().ok()?;
                cpus.extend(start..=end);
            } else {
                cpus.push(part.parse().ok()?);
            }
        }
        Some(cpus)
    }

    fn read_topology_id(cpu: u32, leaf: &str) -> Option<u32> {
        let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/{leaf}");
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    pub fn cpus(&self) -> &[u32] {
        &self.cpus
    }

    /// Number of instances of a domain on this node.
    pub fn num_domain(&self, domain: Domain) -> usize {
        match domain {
            Domain::Board => 1,
            Domain::Package => self.packages.len(),
            Domain::Core => self.cores.len(),
            Domain::Cpu => self.cpus.len(),
        }
    }

    /// All cpus belonging to instance `domain_idx` of `domain`.
    pub fn domain_cpus(&self, domain: Domain, domain_idx: usize) -> Result<&[u32]> {
        let out = match domain {
            Domain::Board => Some(self.cpus.as_slice()),
            Domain::Package => self
                .packages
                .values()
                .nth(domain_idx)
                .map(|v| v.as_slice()),
            Domain::Core => self.cores.values().nth(domain_idx).map(|v| v.as_slice()),
            Domain::Cpu => self
                .cpus
                .get(domain_idx)
                .map(std::slice::from_ref),
        };
        out.ok_or_else(|| {
            MsrflowError::InvalidArgument(format!(
                "domain index {domain_idx} out of range for {domain} (have {})",
                self.num_domain(domain)
            ))
        })
    }

    /// The cpu a per-domain register of instance `domain_idx` is reached
    /// through: the first cpu of the instance.
    pub fn domain_cpu(&self, domain: Domain, domain_idx: usize) -> Result<u32> {
        let cpus = self.domain_cpus(domain, domain_idx)?;
        cpus.first().copied().ok_or_else(|| {
            MsrflowError::InvalidArgument(format!("{domain} instance {domain_idx} has no cpus"))
        })
    }
}
