//! Turns abstract resource requests into kernel-level settings.
//!
//! Everything here is pure except for the `stat` of declared device nodes and
//! the existence check of mount sources.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use cgroups_rs::devices::{DevicePermissions, DeviceType};
use log::debug;
use nix::mount::MsFlags;
use nix::sys::stat::{major, minor, stat, SFlag};

use crate::config::{ExecutorConfig, HostCpu};
use crate::error::{ExecutorError, Result};
use crate::task::{DeviceSpec, MountSpec, Propagation, Resources};

pub const MIN_CPU_SHARES: u64 = 2;
pub const MAX_CPU_SHARES: u64 = 262144;
pub const CPU_PERIOD_US: u64 = 100000;
pub const MIN_CPU_QUOTA_US: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
  pub cgroup: CgroupSpec,
  pub mounts: Vec<BindMount>,
  /// Declared devices only, these get a node inside the task root
  pub devices: Vec<DeviceRule>,
}

/// Controller settings for one task cgroup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupSpec {
  pub cpu: CpuLimits,
  pub memory: MemoryLimits,
  /// None means no ceiling
  pub pids_max: Option<i64>,
  /// Full device list in write order: deny-all, defaults, declared
  pub devices: Vec<DeviceRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLimits {
  /// cgroup v1 `cpu.shares`
  pub shares: u64,
  /// cgroup v2 `cpu.weight`
  pub weight: u64,
  pub quota_us: Option<i64>,
  pub period_us: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
  pub hard_limit: Option<i64>,
  pub soft_limit: Option<i64>,
  pub swappiness: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
  pub source: PathBuf,
  /// Absolute path inside the task root
  pub target: PathBuf,
  pub flags: MsFlags,
  pub propagation: MsFlags,
  pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
  All,
  Char,
  Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
  pub kind: DeviceKind,
  /// None is the `*` wildcard
  pub major: Option<i64>,
  pub minor: Option<i64>,
  pub permissions: String,
  pub allow: bool,
  pub host_path: Option<PathBuf>,
  pub task_path: Option<PathBuf>,
}

/// Device nodes every task may use: (type, major, minor)
const DEFAULT_DEVICES: [(DeviceKind, Option<i64>, Option<i64>); 9] = [
  (DeviceKind::Char, Some(1), Some(3)),   // null
  (DeviceKind::Char, Some(1), Some(5)),   // zero
  (DeviceKind::Char, Some(1), Some(7)),   // full
  (DeviceKind::Char, Some(1), Some(8)),   // random
  (DeviceKind::Char, Some(1), Some(9)),   // urandom
  (DeviceKind::Char, Some(5), Some(0)),   // tty
  (DeviceKind::Char, Some(5), Some(1)),   // console
  (DeviceKind::Char, Some(5), Some(2)),   // ptmx
  (DeviceKind::Char, Some(136), None),    // pts
];

pub fn translate(
  config: &ExecutorConfig,
  resources: &Resources,
  mounts: &[MountSpec],
  devices: &[DeviceSpec],
) -> Result<Translation> {
  let cpu = cpu_limits(resources, &config.host_cpu)?;
  let memory = memory_limits(resources, config.default_memory_mb)?;
  let pids_max = if resources.pids_max == 0 {
    None
  } else {
    Some(resources.pids_max as i64)
  };

  let declared = devices
    .iter()
    .map(device_rule)
    .collect::<Result<Vec<DeviceRule>>>()?;
  let mut device_list = vec![DeviceRule::deny_all()];
  device_list.extend(default_device_rules());
  device_list.extend(declared.iter().cloned());

  let mounts = mounts
    .iter()
    .map(bind_mount)
    .collect::<Result<Vec<BindMount>>>()?;

  debug!(
    "Translated resources: cpu {:?}, memory {:?}, pids {:?}, {} mounts, {} devices",
    cpu,
    memory,
    pids_max,
    mounts.len(),
    declared.len()
  );

  Ok(Translation {
    cgroup: CgroupSpec {
      cpu,
      memory,
      pids_max,
      devices: device_list,
    },
    mounts,
    devices: declared,
  })
}

/// CPU shares to v1 shares, v2 weight and, for hard limits, a CFS quota
pub fn cpu_limits(resources: &Resources, host: &HostCpu) -> Result<CpuLimits> {
  if resources.cpu_shares < MIN_CPU_SHARES {
    return Err(ExecutorError::InvalidResourceConfig(format!(
      "cpu shares {} below the minimum of {}",
      resources.cpu_shares, MIN_CPU_SHARES
    )));
  }
  let shares = resources.cpu_shares.min(MAX_CPU_SHARES);
  let weight = 1 + ((shares - 2) * 9999) / (MAX_CPU_SHARES - 2);

  let (quota_us, period_us) = if resources.cpu_hard_limit {
    let total = host.total_compute_mhz.max(1);
    let quota = (shares * CPU_PERIOD_US * host.cores.max(1)) / total;
    (Some((quota as i64).max(MIN_CPU_QUOTA_US)), Some(CPU_PERIOD_US))
  } else {
    (None, None)
  };

  Ok(CpuLimits {
    shares,
    weight,
    quota_us,
    period_us,
  })
}

pub fn memory_limits(resources: &Resources, default_mb: u64) -> Result<MemoryLimits> {
  if resources.memory_unlimited {
    return Ok(MemoryLimits {
      hard_limit: None,
      soft_limit: None,
      swappiness: 0,
    });
  }
  let memory_mb = if resources.memory_mb == 0 {
    default_mb
  } else {
    resources.memory_mb
  };
  if memory_mb == 0 {
    return Err(ExecutorError::InvalidResourceConfig(
      "memory ceiling is zero and no default is configured".to_string(),
    ));
  }
  let (hard_mb, soft_mb) = if resources.memory_max_mb > memory_mb {
    (resources.memory_max_mb, Some(memory_mb))
  } else {
    (memory_mb, None)
  };
  Ok(MemoryLimits {
    hard_limit: Some(mb_to_bytes(hard_mb)?),
    soft_limit: soft_mb.map(mb_to_bytes).transpose()?,
    swappiness: 0,
  })
}

fn mb_to_bytes(mb: u64) -> Result<i64> {
  mb.checked_mul(1024 * 1024)
    .and_then(|bytes| i64::try_from(bytes).ok())
    .ok_or_else(|| ExecutorError::InvalidResourceConfig(format!("memory {} MB is too large", mb)))
}

/// Validate a permission string: non-empty, only `r`, `w` and `m`
pub fn check_permissions(path: &Path, permissions: &str) -> Result<()> {
  if permissions.is_empty() {
    return Err(ExecutorError::device(path, "empty permissions"));
  }
  match permissions.chars().find(|c| !matches!(c, 'r' | 'w' | 'm')) {
    Some(c) => Err(ExecutorError::device(
      path,
      format!("invalid permission {:?} in {:?}, expected a combination of r, w and m", c, permissions),
    )),
    None => Ok(()),
  }
}

/// Stat a declared device node and build its cgroup rule
pub fn device_rule(device: &DeviceSpec) -> Result<DeviceRule> {
  let permissions = device.permissions.clone().unwrap_or_else(|| "rwm".to_string());
  check_permissions(&device.host_path, &permissions)?;

  let info = stat(&device.host_path)
    .map_err(|err| ExecutorError::device(&device.host_path, format!("cannot stat: {}", err)))?;
  let kind = match SFlag::from_bits_truncate(info.st_mode) & SFlag::S_IFMT {
    SFlag::S_IFCHR => DeviceKind::Char,
    SFlag::S_IFBLK => DeviceKind::Block,
    _ => return Err(ExecutorError::device(&device.host_path, "not a device node")),
  };

  Ok(DeviceRule {
    kind,
    major: Some(major(info.st_rdev) as i64),
    minor: Some(minor(info.st_rdev) as i64),
    permissions,
    allow: true,
    host_path: Some(device.host_path.clone()),
    task_path: Some(device.target().to_path_buf()),
  })
}

pub fn default_device_rules() -> Vec<DeviceRule> {
  DEFAULT_DEVICES
    .iter()
    .map(|(kind, major, minor)| DeviceRule {
      kind: *kind,
      major: *major,
      minor: *minor,
      permissions: "rwm".to_string(),
      allow: true,
      host_path: None,
      task_path: None,
    })
    .collect()
}

pub fn bind_mount(mount: &MountSpec) -> Result<BindMount> {
  if !mount.host_path.exists() {
    return Err(ExecutorError::unavailable(
      format!("mount source {}", mount.host_path.display()),
      "no such file or directory",
    ));
  }
  let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
  if mount.read_only {
    flags |= MsFlags::MS_RDONLY;
  }
  Ok(BindMount {
    source: mount.host_path.clone(),
    target: mount.task_path.clone(),
    flags,
    propagation: propagation_flags(mount.propagation),
    read_only: mount.read_only,
  })
}

pub fn propagation_flags(propagation: Propagation) -> MsFlags {
  let mode = match propagation {
    Propagation::Private => MsFlags::MS_PRIVATE,
    Propagation::HostToTask => MsFlags::MS_SLAVE,
    Propagation::Bidirectional => MsFlags::MS_SHARED,
  };
  mode | MsFlags::MS_REC
}

impl DeviceRule {
  pub fn deny_all() -> Self {
    DeviceRule {
      kind: DeviceKind::All,
      major: None,
      minor: None,
      permissions: "rwm".to_string(),
      allow: false,
      host_path: None,
      task_path: None,
    }
  }

  pub fn device_type(&self) -> DeviceType {
    match self.kind {
      DeviceKind::All => DeviceType::All,
      DeviceKind::Char => DeviceType::Char,
      DeviceKind::Block => DeviceType::Block,
    }
  }

  pub fn device_permissions(&self) -> Vec<DevicePermissions> {
    self
      .permissions
      .chars()
      .filter_map(|c| match c {
        'r' => Some(DevicePermissions::Read),
        'w' => Some(DevicePermissions::Write),
        'm' => Some(DevicePermissions::MkNod),
        _ => None,
      })
      .collect()
  }
}

impl DeviceKind {
  pub fn as_char(&self) -> char {
    match self {
      DeviceKind::All => 'a',
      DeviceKind::Char => 'c',
      DeviceKind::Block => 'b',
    }
  }
}

/// Same text the v1 devices controller accepts, e.g. `c 1:3 rwm`
impl Display for DeviceRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let number = |n: Option<i64>| n.map(|n| n.to_string()).unwrap_or_else(|| "*".to_string());
    write!(
      f,
      "{} {}:{} {}",
      self.kind.as_char(),
      number(self.major),
      number(self.minor),
      self.permissions
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn host() -> HostCpu {
    HostCpu::new(4, 2500)
  }

  #[test]
  fn dev_null_defaults_to_rwm() {
    let rule = device_rule(&DeviceSpec::new("/dev/null")).unwrap();
    assert_eq!(rule.to_string(), "c 1:3 rwm");
    assert_eq!(rule.task_path, Some(PathBuf::from("/dev/null")));
    assert_eq!(rule.device_permissions().len(), 3);
  }

  #[test]
  fn explicit_permissions_are_kept() {
    let rule = device_rule(&DeviceSpec::new("/dev/zero").permissions("r")).unwrap();
    assert_eq!(rule.to_string(), "c 1:5 r");
  }

  #[test]
  fn invalid_permissions_are_rejected() {
    for perms in ["rwx", "", "RW"] {
      let err = device_rule(&DeviceSpec::new("/dev/null").permissions(perms)).unwrap_err();
      assert!(matches!(err, ExecutorError::InvalidDeviceConfig { .. }), "{}", perms);
    }
  }

  #[test]
  fn missing_or_regular_file_is_not_a_device() {
    let err = device_rule(&DeviceSpec::new("/dev/does-not-exist")).unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidDeviceConfig { .. }));

    let file = tempfile::NamedTempFile::new().unwrap();
    let err = device_rule(&DeviceSpec::new(file.path())).unwrap_err();
    assert!(err.to_string().contains("not a device node"));
  }

  #[test]
  fn device_list_starts_with_deny_all() {
    let config = ExecutorConfig::new().host_cpu(host());
    let translation = translate(
      &config,
      &Resources::default(),
      &[],
      &[DeviceSpec::new("/dev/null").task_path("/dev/mynull")],
    )
    .unwrap();
    let list = &translation.cgroup.devices;
    assert_eq!(list[0].to_string(), "a *:* rwm");
    assert!(!list[0].allow);
    assert!(list.iter().any(|rule| rule.to_string() == "c 136:* rwm"));
    assert_eq!(list.len(), 1 + DEFAULT_DEVICES.len() + 1);
    assert_eq!(translation.devices.len(), 1);
    assert_eq!(translation.devices[0].task_path, Some(PathBuf::from("/dev/mynull")));
  }

  #[test]
  fn bind_mount_flags() {
    let dir = tempfile::tempdir().unwrap();
    let rw = bind_mount(&MountSpec::new(dir.path(), "/data")).unwrap();
    assert!(rw.flags.contains(MsFlags::MS_BIND));
    assert!(!rw.flags.contains(MsFlags::MS_RDONLY));
    assert_eq!(rw.propagation, MsFlags::MS_PRIVATE | MsFlags::MS_REC);

    let ro = bind_mount(&MountSpec::new(dir.path(), "/data").read_only(true)).unwrap();
    assert!(ro.flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY));

    let shared = bind_mount(&MountSpec::new(dir.path(), "/data").propagation(Propagation::Bidirectional)).unwrap();
    assert_eq!(shared.propagation, MsFlags::MS_SHARED | MsFlags::MS_REC);
  }

  #[test]
  fn missing_mount_source_is_unavailable() {
    let err = bind_mount(&MountSpec::new("/no/such/source", "/data")).unwrap_err();
    assert!(matches!(err, ExecutorError::ResourceUnavailable { .. }));
  }

  #[test]
  fn cpu_shares_bounds() {
    let low = Resources {
      cpu_shares: 1,
      ..Resources::default()
    };
    assert!(matches!(
      cpu_limits(&low, &host()),
      Err(ExecutorError::InvalidResourceConfig(_))
    ));

    let min = cpu_limits(&Resources { cpu_shares: 2, ..Resources::default() }, &host()).unwrap();
    assert_eq!(min.weight, 1);

    let max = cpu_limits(&Resources { cpu_shares: 1 << 20, ..Resources::default() }, &host()).unwrap();
    assert_eq!(max.shares, MAX_CPU_SHARES);
    assert_eq!(max.weight, 10000);
    assert_eq!(max.quota_us, None);
  }

  #[test]
  fn cpu_hard_limit_quota() {
    let resources = Resources {
      cpu_shares: 2500,
      cpu_hard_limit: true,
      ..Resources::default()
    };
    // one core worth of MHz on a 4 core host
    let limits = cpu_limits(&resources, &host()).unwrap();
    assert_eq!(limits.period_us, Some(CPU_PERIOD_US));
    assert_eq!(limits.quota_us, Some(100000));

    let tiny = Resources {
      cpu_shares: 2,
      cpu_hard_limit: true,
      ..Resources::default()
    };
    assert_eq!(cpu_limits(&tiny, &host()).unwrap().quota_us, Some(MIN_CPU_QUOTA_US));
  }

  #[test]
  fn memory_defaults_and_ceilings() {
    let default = memory_limits(&Resources::default(), 300).unwrap();
    assert_eq!(default.hard_limit, Some(300 * 1024 * 1024));
    assert_eq!(default.soft_limit, None);
    assert_eq!(default.swappiness, 0);

    let oversubscribed = Resources {
      memory_mb: 128,
      memory_max_mb: 512,
      ..Resources::default()
    };
    let limits = memory_limits(&oversubscribed, 300).unwrap();
    assert_eq!(limits.hard_limit, Some(512 * 1024 * 1024));
    assert_eq!(limits.soft_limit, Some(128 * 1024 * 1024));

    let unlimited = Resources {
      memory_unlimited: true,
      ..Resources::default()
    };
    assert_eq!(memory_limits(&unlimited, 300).unwrap().hard_limit, None);
  }

  #[test]
  fn pids_zero_means_no_ceiling() {
    let config = ExecutorConfig::new().host_cpu(host());
    let none = translate(&config, &Resources::default(), &[], &[]).unwrap();
    assert_eq!(none.cgroup.pids_max, None);
    let some = translate(
      &config,
      &Resources {
        pids_max: 64,
        ..Resources::default()
      },
      &[],
      &[],
    )
    .unwrap();
    assert_eq!(some.cgroup.pids_max, Some(64));
  }
}
