//! Resource usage from `/proc/<pid>`, for tasks that run without a cgroup.

use std::fs;

use chrono::Local;
use nix::unistd::{sysconf, Pid, SysconfVar};

use crate::cgroup::{CpuUsage, MemoryUsage, ResourceUsage};
use crate::error::Result;

pub(crate) fn usage(pid: Pid) -> Result<ResourceUsage> {
  let status = fs::read_to_string(format!("/proc/{}/status", pid))?;
  let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
  let ticks = match sysconf(SysconfVar::CLK_TCK) {
    Ok(Some(ticks)) if ticks > 0 => ticks as u64,
    _ => 100,
  };
  Ok(ResourceUsage {
    memory: parse_status(&status),
    cpu: parse_stat(&stat, ticks),
    pids: 1,
    timestamp: Local::now(),
  })
}

fn parse_status(status: &str) -> MemoryUsage {
  let kb = |key: &str| {
    status
      .lines()
      .filter_map(|line| line.split_once(':'))
      .find(|(k, _)| *k == key)
      .and_then(|(_, v)| v.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
      .map(|v| v * 1024)
      .unwrap_or(0)
  };
  MemoryUsage {
    rss: kb("RssAnon"),
    cache: kb("RssFile") + kb("RssShmem"),
    swap: kb("VmSwap"),
    usage: kb("VmRSS"),
    max_usage: kb("VmHWM"),
  }
}

fn parse_stat(stat: &str, ticks: u64) -> CpuUsage {
  // the command name may contain spaces, fields start after its closing paren
  let fields = match stat.rfind(')') {
    Some(end) => stat[end + 1..].split_whitespace().collect::<Vec<&str>>(),
    None => return CpuUsage::default(),
  };
  let field = |n: usize| {
    fields
      .get(n - 3)
      .and_then(|v| v.parse::<u64>().ok())
      .unwrap_or(0)
  };
  let user_usec = field(14) * 1_000_000 / ticks;
  let system_usec = field(15) * 1_000_000 / ticks;
  CpuUsage {
    user_usec,
    system_usec,
    total_usec: user_usec + system_usec,
    throttled_periods: 0,
    throttled_usec: 0,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_memory_from_status() {
    let status = "Name:\tsleep\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\nRssAnon:\t     256 kB\nRssFile:\t     768 kB\nRssShmem:\t       0 kB\nVmSwap:\t       4 kB\n";
    let memory = parse_status(status);
    assert_eq!(memory.usage, 1024 * 1024);
    assert_eq!(memory.max_usage, 2048 * 1024);
    assert_eq!(memory.rss, 256 * 1024);
    assert_eq!(memory.cache, 768 * 1024);
    assert_eq!(memory.swap, 4 * 1024);
  }

  #[test]
  fn parse_cpu_from_stat() {
    let stat = "1234 (my (odd) cmd) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0 100 1000 200";
    let cpu = parse_stat(stat, 100);
    assert_eq!(cpu.user_usec, 2_500_000);
    assert_eq!(cpu.system_usec, 500_000);
    assert_eq!(cpu.total_usec, 3_000_000);
  }

  #[test]
  fn own_usage() {
    let usage = usage(nix::unistd::getpid()).unwrap();
    assert!(usage.memory.usage > 0);
  }
}
