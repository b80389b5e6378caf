use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::cpu::CpuController;
use cgroups_rs::cpuacct::CpuAcctController;
use cgroups_rs::memory::MemController;
use cgroups_rs::pid::PidController;
use cgroups_rs::{Cgroup, CgroupPid, Hierarchy, MaxValue};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use nix::unistd::Pid;

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::translate::CgroupSpec;
use crate::utils::retry;

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// The cgroup owned by one task
pub struct TaskCgroup {
  name: String,
  cgroup: Cgroup,
  v2: bool,
  retries: u32,
  deleted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
  pub rss: u64,
  pub cache: u64,
  pub swap: u64,
  pub usage: u64,
  pub max_usage: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuUsage {
  pub user_usec: u64,
  pub system_usec: u64,
  pub total_usec: u64,
  pub throttled_periods: u64,
  pub throttled_usec: u64,
}

/// One sample of a task's resource consumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsage {
  pub memory: MemoryUsage,
  pub cpu: CpuUsage,
  pub pids: u64,
  pub timestamp: DateTime<Local>,
}

/// Deterministic location of a task cgroup, so a restarted executor finds it again
pub fn cgroup_name(parent: &str, alloc_id: &str, task_name: &str) -> String {
  format!("{}/{}.{}", parent.trim_matches('/'), alloc_id, task_name)
}

fn has_controller(hierarchy: &dyn Hierarchy, name: &str) -> bool {
  hierarchy
    .subsystems()
    .iter()
    .any(|subsystem| subsystem.controller_name() == name)
}

/// Whether v2 swap limits can be written, judged by our own cgroup
fn v2_swap_accounting(hierarchy: &dyn Hierarchy) -> bool {
  let own = match fs::read_to_string("/proc/self/cgroup") {
    Ok(own) => own,
    Err(_) => return false,
  };
  own
    .lines()
    .find_map(|line| line.strip_prefix("0::"))
    .map(|path| {
      hierarchy
        .root()
        .join(path.trim().trim_start_matches('/'))
        .join("memory.swap.max")
        .exists()
    })
    .unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
struct Controllers {
  v2: bool,
  swap: bool,
  cpu: bool,
  cpuacct: bool,
  memory: bool,
  pids: bool,
  devices: bool,
}

impl Controllers {
  fn detect(hierarchy: &dyn Hierarchy) -> Self {
    Controllers {
      v2: hierarchy.v2(),
      swap: hierarchy.v2() && v2_swap_accounting(hierarchy),
      cpu: has_controller(hierarchy, "cpu"),
      cpuacct: has_controller(hierarchy, "cpuacct"),
      memory: has_controller(hierarchy, "memory"),
      pids: has_controller(hierarchy, "pids"),
      devices: has_controller(hierarchy, "devices"),
    }
  }

  fn builder(&self, name: &str, spec: &CgroupSpec, limits: bool) -> CgroupBuilder {
    let mut builder = CgroupBuilder::new(name);
    if limits {
      if self.memory {
        let mut memory = builder.memory();
        if !self.v2 {
          memory = memory.swappiness(spec.memory.swappiness);
        }
        if let Some(hard) = spec.memory.hard_limit {
          memory = memory.memory_hard_limit(hard);
          // v2 has no swappiness, the ceiling only holds with swap off
          if self.swap {
            memory = memory.memory_swap_limit(0);
          }
        }
        if let Some(soft) = spec.memory.soft_limit {
          memory = memory.memory_soft_limit(soft);
        }
        builder = memory.done();
      }
      if self.cpu {
        let shares = if self.v2 { spec.cpu.weight } else { spec.cpu.shares };
        let mut cpu = builder.cpu().shares(shares);
        if let (Some(quota), Some(period)) = (spec.cpu.quota_us, spec.cpu.period_us) {
          cpu = cpu.quota(quota).period(period);
        }
        builder = cpu.done();
      }
      if self.pids {
        let max = match spec.pids_max {
          Some(max) => MaxValue::Value(max),
          None => MaxValue::Max,
        };
        builder = builder.pid().maximum_number_of_processes(max).done();
      }
      if self.devices && !self.v2 {
        let mut devices = builder.devices();
        for rule in &spec.devices {
          devices = devices.device(
            rule.major.unwrap_or(-1),
            rule.minor.unwrap_or(-1),
            rule.device_type(),
            rule.allow,
            rule.device_permissions(),
          );
        }
        builder = devices.done();
      }
    }

    builder.set_specified_controllers(self.controller_names())
  }

  /// Controllers the task cgroup is created in
  fn controller_names(&self) -> Vec<String> {
    let mut supported_controller = vec![];
    if self.cpu {
      supported_controller.push("cpu".to_string());
    }
    if self.cpuacct && !self.v2 {
      supported_controller.push("cpuacct".to_string());
    }
    if self.memory {
      supported_controller.push("memory".to_string());
    }
    if self.pids {
      supported_controller.push("pids".to_string());
    }
    if self.devices && !self.v2 {
      supported_controller.push("devices".to_string());
    }
    supported_controller
  }

  fn warn_missing(&self, name: &str, limits: bool) {
    if !self.cpu {
      warn!("cgroup cpu is not supported");
    }
    if !self.memory {
      warn!("cgroup memory is not supported");
    }
    if !self.pids {
      warn!("cgroup pids is not supported");
    }
    if limits && (self.v2 || !self.devices) {
      warn!("cgroup devices is not supported, device rules of {} are not enforced", name);
    }
  }
}

impl TaskCgroup {
  /// Create the cgroup with limits applied. `limits` false gives an accounting-only group.
  pub fn create(config: &ExecutorConfig, name: &str, spec: &CgroupSpec, limits: bool) -> Result<Self> {
    debug!("Init cgroup {}", name);

    let hierarchy = cgroups_rs::hierarchies::auto();
    let controllers = Controllers::detect(hierarchy.as_ref());
    controllers.warn_missing(name, limits);

    let cgroup = retry("Build cgroup", config.cgroup_retries, RETRY_DELAY, || {
      controllers
        .builder(name, spec, limits)
        .build(cgroups_rs::hierarchies::auto())
    })
    .map_err(|err| {
      error!("Build cgroup fails: {}", err);
      ExecutorError::unavailable(format!("cgroup {}", name), err.to_string())
    })?;

    info!("Created cgroup {}", name);
    Ok(TaskCgroup {
      name: name.to_string(),
      cgroup,
      v2: controllers.v2,
      retries: config.cgroup_retries,
      deleted: false,
    })
  }

  /// Re-open a cgroup created by an earlier executor
  pub fn reattach(config: &ExecutorConfig, name: &str) -> Result<Self> {
    let hierarchy = cgroups_rs::hierarchies::auto();
    let v2 = hierarchy.v2();
    let cgroup = Cgroup::load(hierarchy, name);
    let exists = cgroup
      .subsystems()
      .iter()
      .any(|subsystem| subsystem.to_controller().path().exists());
    if !exists {
      return Err(ExecutorError::unavailable(format!("cgroup {}", name), "does not exist"));
    }
    debug!("Reattached cgroup {}", name);
    Ok(TaskCgroup {
      name: name.to_string(),
      cgroup,
      v2,
      retries: config.cgroup_retries,
      deleted: false,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_v2(&self) -> bool {
    self.v2
  }

  /// Move a process, with all its threads, into the cgroup
  pub fn attach(&self, pid: Pid) -> Result<()> {
    retry("Attach to cgroup", self.retries, RETRY_DELAY, || {
      self.cgroup.add_task_by_tgid(CgroupPid::from(pid.as_raw() as u64))
    })
    .map_err(|err| ExecutorError::cgroup(format!("attach {} to {}: {}", pid, self.name, err)))?;
    debug!("Attached process {} to cgroup {}", pid, self.name);
    Ok(())
  }

  /// Directories of the cgroup, one per mounted controller (a single one on v2)
  pub fn paths(&self) -> Vec<PathBuf> {
    let mut paths = self
      .cgroup
      .subsystems()
      .iter()
      .map(|subsystem| subsystem.to_controller().path().to_path_buf())
      .collect::<Vec<PathBuf>>();
    paths.sort();
    paths.dedup();
    paths
  }

  /// Every process currently in the cgroup
  pub fn pids(&self) -> Vec<Pid> {
    self
      .cgroup
      .procs()
      .into_iter()
      .map(|pid| Pid::from_raw(pid.pid as i32))
      .collect()
  }

  pub fn stats(&self) -> ResourceUsage {
    let mut memory = MemoryUsage::default();
    if let Some(controller) = self.cgroup.controller_of::<MemController>() {
      let stat = controller.memory_stat();
      let memswap = controller.memswap();
      memory = MemoryUsage {
        rss: stat.stat.rss,
        cache: stat.stat.cache,
        swap: memswap.usage_in_bytes.saturating_sub(stat.usage_in_bytes),
        usage: stat.usage_in_bytes,
        max_usage: stat.max_usage_in_bytes,
      };
    }

    let mut cpu = CpuUsage::default();
    if let Some(controller) = self.cgroup.controller_of::<CpuController>() {
      cpu = parse_cpu_stat(&controller.cpu().stat);
    }
    if let Some(controller) = self.cgroup.controller_of::<CpuAcctController>() {
      let acct = controller.cpuacct();
      cpu.total_usec = acct.usage / 1000;
      cpu.user_usec = acct.usage_user / 1000;
      cpu.system_usec = acct.usage_sys / 1000;
    }

    let pids = match self.cgroup.controller_of::<PidController>() {
      Some(controller) => controller.get_pid_current().unwrap_or(0),
      None => self.pids().len() as u64,
    };

    ResourceUsage {
      memory,
      cpu,
      pids,
      timestamp: Local::now(),
    }
  }

  /// Remove the cgroup. Safe to call more than once.
  pub fn destroy(&mut self) -> Result<()> {
    if self.deleted {
      return Ok(());
    }
    debug!("Delete created cgroup {}", self.name);
    // killed processes may take a moment to leave the group
    retry("Delete cgroup", self.retries, RETRY_DELAY, || self.cgroup.delete())
    .map_err(|err| ExecutorError::cgroup(format!("delete {}: {}", self.name, err)))?;
    self.deleted = true;
    Ok(())
  }
}

impl Drop for TaskCgroup {
  fn drop(&mut self) {
    if let Err(err) = self.destroy() {
      error!("{}", err);
    }
  }
}

/// Parse the key/value lines of `cpu.stat`, v1 and v2 spellings
pub(crate) fn parse_cpu_stat(stat: &str) -> CpuUsage {
  let mut usage = CpuUsage::default();
  for line in stat.lines() {
    let mut parts = line.split_whitespace();
    let (key, value) = match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
      (Some(key), Some(value)) => (key, value),
      _ => continue,
    };
    match key {
      "nr_throttled" => usage.throttled_periods = value,
      "throttled_time" => usage.throttled_usec = value / 1000,
      "throttled_usec" => usage.throttled_usec = value,
      "usage_usec" => usage.total_usec = value,
      "user_usec" => usage.user_usec = value,
      "system_usec" => usage.system_usec = value,
      _ => {}
    }
  }
  usage
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cgroup_name_is_deterministic() {
    assert_eq!(cgroup_name("isoexec", "a1", "web"), "isoexec/a1.web");
    assert_eq!(cgroup_name("/nomad/", "a1", "web"), "nomad/a1.web");
  }

  fn controllers(v2: bool) -> Controllers {
    Controllers {
      v2,
      swap: false,
      cpu: true,
      cpuacct: !v2,
      memory: true,
      pids: true,
      devices: !v2,
    }
  }

  #[test]
  fn v1_task_joins_the_devices_controller() {
    assert_eq!(
      controllers(false).controller_names(),
      vec!["cpu", "cpuacct", "memory", "pids", "devices"]
    );
  }

  #[test]
  fn v2_task_has_no_devices_controller() {
    let mut v2 = controllers(true);
    v2.devices = true;
    assert_eq!(v2.controller_names(), vec!["cpu", "memory", "pids"]);
  }

  #[test]
  fn parse_v1_cpu_stat() {
    let usage = parse_cpu_stat("nr_periods 10\nnr_throttled 4\nthrottled_time 5000000\n");
    assert_eq!(usage.throttled_periods, 4);
    assert_eq!(usage.throttled_usec, 5000);
  }

  #[test]
  fn parse_v2_cpu_stat() {
    let usage = parse_cpu_stat(
      "usage_usec 9000\nuser_usec 6000\nsystem_usec 3000\nnr_periods 2\nnr_throttled 1\nthrottled_usec 250\n",
    );
    assert_eq!(
      usage,
      CpuUsage {
        user_usec: 6000,
        system_usec: 3000,
        total_usec: 9000,
        throttled_periods: 1,
        throttled_usec: 250,
      }
    );
  }
}
