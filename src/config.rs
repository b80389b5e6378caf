use std::env;
use std::fs;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::unistd::{sysconf, SysconfVar};

use crate::capabilities::CapabilitySet;

/// Executor-wide settings shared by every launch
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  /// Parent of every task cgroup, relative to the hierarchy root
  pub(crate) cgroup_parent: String,
  /// Memory ceiling used when a task leaves its own unset (MB)
  pub(crate) default_memory_mb: u64,
  pub(crate) capability_basis: CapabilitySet,
  pub(crate) allowed_capabilities: Vec<String>,
  pub(crate) host_cpu: HostCpu,
  pub(crate) shutdown_signal: Signal,
  /// How long to wait for the process after the final kill
  pub(crate) kill_timeout: Duration,
  /// Attempts made against a busy cgroup filesystem
  pub(crate) cgroup_retries: u32,
  /// Confine with chroot instead of pivot_root, for hosts whose root is a
  /// ramdisk. A nested chroot can escape this, so it is off by default.
  pub(crate) no_pivot_root: bool,
}

/// Host compute capacity, used to turn CPU shares into a CFS quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCpu {
  pub cores: u64,
  pub total_compute_mhz: u64,
}

impl ExecutorConfig {
  pub fn new() -> Self {
    let basis = CapabilitySet::defaults();
    ExecutorConfig {
      cgroup_parent: "isoexec".to_string(),
      default_memory_mb: 300,
      allowed_capabilities: basis.to_vec(),
      capability_basis: basis,
      host_cpu: HostCpu::detect(),
      shutdown_signal: Signal::SIGINT,
      kill_timeout: Duration::from_secs(15),
      cgroup_retries: 3,
      no_pivot_root: false,
    }
  }

  /// Defaults overridden by `ISOEXEC_CGROUP`, `ISOEXEC_DEFAULT_MEMORY_MB`
  /// and `ISOEXEC_NO_PIVOT_ROOT`
  pub fn from_env() -> Self {
    let mut config = Self::new();
    if let Ok(parent) = env::var("ISOEXEC_CGROUP") {
      config.cgroup_parent = parent;
    }
    if let Ok(memory) = env::var("ISOEXEC_DEFAULT_MEMORY_MB") {
      match memory.parse::<u64>() {
        Ok(mb) if mb > 0 => config.default_memory_mb = mb,
        _ => warn!("Ignore invalid ISOEXEC_DEFAULT_MEMORY_MB={}", memory),
      }
    }
    if let Ok(flag) = env::var("ISOEXEC_NO_PIVOT_ROOT") {
      config.no_pivot_root = matches!(flag.as_str(), "1" | "true");
    }
    config
  }

  pub fn cgroup_parent<S: Into<String>>(mut self, parent: S) -> Self {
    self.cgroup_parent = parent.into();
    self
  }

  pub fn default_memory_mb(mut self, mb: u64) -> Self {
    self.default_memory_mb = mb;
    self
  }

  pub fn capability_basis(mut self, basis: CapabilitySet) -> Self {
    self.capability_basis = basis;
    self
  }

  pub fn allowed_capabilities<S: Into<String>>(mut self, allowed: Vec<S>) -> Self {
    self.allowed_capabilities = allowed.into_iter().map(|s| s.into()).collect();
    self
  }

  pub fn host_cpu(mut self, host_cpu: HostCpu) -> Self {
    self.host_cpu = host_cpu;
    self
  }

  pub fn shutdown_signal(mut self, signal: Signal) -> Self {
    self.shutdown_signal = signal;
    self
  }

  pub fn kill_timeout(mut self, timeout: Duration) -> Self {
    self.kill_timeout = timeout;
    self
  }

  pub fn cgroup_retries(mut self, retries: u32) -> Self {
    self.cgroup_retries = retries.max(1);
    self
  }

  pub fn no_pivot_root(mut self, flag: bool) -> Self {
    self.no_pivot_root = flag;
    self
  }
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self::new()
  }
}

impl HostCpu {
  pub fn new(cores: u64, mhz_per_core: u64) -> Self {
    HostCpu {
      cores: cores.max(1),
      total_compute_mhz: cores.max(1) * mhz_per_core.max(1),
    }
  }

  /// Online cores from sysconf and the clock of the first core in /proc/cpuinfo
  pub fn detect() -> Self {
    let cores = match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
      Ok(Some(n)) if n > 0 => n as u64,
      _ => 1,
    };
    let mhz = fs::read_to_string("/proc/cpuinfo")
      .ok()
      .and_then(|text| parse_cpu_mhz(&text))
      .unwrap_or(1000);
    debug!("Detected {} cores at {} MHz", cores, mhz);
    HostCpu::new(cores, mhz)
  }
}

fn parse_cpu_mhz(cpuinfo: &str) -> Option<u64> {
  cpuinfo
    .lines()
    .filter_map(|line| line.split_once(':'))
    .find(|(key, _)| key.trim() == "cpu MHz")
    .and_then(|(_, value)| value.trim().parse::<f64>().ok())
    .map(|mhz| mhz.round() as u64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_first_cpu_clock() {
    let cpuinfo = "processor\t: 0\nmodel name\t: Fake CPU\ncpu MHz\t\t: 2399.996\n\nprocessor\t: 1\ncpu MHz\t\t: 1200.000\n";
    assert_eq!(parse_cpu_mhz(cpuinfo), Some(2400));
    assert_eq!(parse_cpu_mhz("processor : 0\n"), None);
  }

  #[test]
  fn host_cpu_total_compute() {
    let cpu = HostCpu::new(4, 2500);
    assert_eq!(cpu.total_compute_mhz, 10000);
    assert_eq!(HostCpu::new(0, 0).cores, 1);
  }

  #[test]
  fn defaults_allow_the_basis() {
    let config = ExecutorConfig::new();
    assert_eq!(config.allowed_capabilities, config.capability_basis.to_vec());
    assert_eq!(config.default_memory_mb, 300);
    assert_eq!(config.shutdown_signal, Signal::SIGINT);
    assert!(!config.no_pivot_root);
    assert!(config.no_pivot_root(true).no_pivot_root);
  }
}
