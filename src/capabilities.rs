use std::collections::BTreeSet;
use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use lazy_static::lazy_static;
use log::{debug, warn};
use nix::libc;
use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

use crate::error::{ExecutorError, Result};

lazy_static! {
  /// Capabilities granted to non-privileged tasks unless dropped
  pub static ref DEFAULT_CAPABILITIES: Vec<&'static str> = vec![
    "audit_write",
    "chown",
    "dac_override",
    "fowner",
    "fsetid",
    "kill",
    "mknod",
    "net_bind_service",
    "setfcap",
    "setgid",
    "setpcap",
    "setuid",
    "sys_chroot",
  ];
}

/// Sorted set of normalized capability names (lowercase, no `cap_` prefix)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<String>);

/// Normalize a capability name: `CAP_NET_RAW`, `cap_net_raw` and `net_raw` are the same
pub fn normalize(name: &str) -> String {
  let lower = name.trim().to_lowercase();
  match lower.strip_prefix("cap_") {
    Some(rest) => rest.to_string(),
    None => lower,
  }
}

fn to_capability(name: &str) -> Option<Capability> {
  Capability::from_str(&format!("CAP_{}", name.to_uppercase())).ok()
}

impl CapabilitySet {
  pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
    CapabilitySet(names.iter().map(|n| normalize(n.as_ref())).collect())
  }

  /// The default set for non-privileged tasks
  pub fn defaults() -> Self {
    Self::new(DEFAULT_CAPABILITIES.as_slice())
  }

  /// Every capability this kernel supports and the executor still holds, for privileged tasks
  pub fn privileged() -> Self {
    let mut held = caps::runtime::thread_all_supported();
    for set in [CapSet::Bounding, CapSet::Permitted] {
      match caps::read(None, set) {
        Ok(current) => held.retain(|cap| current.contains(cap)),
        Err(err) => warn!("Read {:?} capabilities fails: {}", set, err),
      }
    }
    CapabilitySet(held.iter().map(|cap| normalize(&cap.to_string())).collect())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.0.contains(&normalize(name))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &String> {
    self.0.iter()
  }

  /// Names in kernel form, e.g. `CAP_NET_BIND_SERVICE`
  pub fn kernel_names(&self) -> Vec<String> {
    self
      .0
      .iter()
      .map(|name| format!("CAP_{}", name.to_uppercase()))
      .collect()
  }

  pub fn to_vec(&self) -> Vec<String> {
    self.0.iter().cloned().collect()
  }

  /// Convert to the kernel representation, rejecting names the platform does not know
  pub fn to_caps(&self) -> Result<CapsHashSet> {
    self
      .0
      .iter()
      .map(|name| to_capability(name).ok_or_else(|| ExecutorError::UnknownCapability(name.clone())))
      .collect()
  }

  fn check_known(&self) -> Result<()> {
    let unknown = self
      .0
      .iter()
      .filter(|name| name.as_str() != "all" && to_capability(name).is_none())
      .cloned()
      .collect::<Vec<String>>();
    if unknown.is_empty() {
      Ok(())
    } else {
      Err(ExecutorError::UnknownCapability(unknown.join(", ")))
    }
  }
}

impl FromIterator<String> for CapabilitySet {
  fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
    CapabilitySet(iter.into_iter().map(|n| normalize(&n)).collect())
  }
}

/// Compute the effective capability set of a non-privileged task.
///
/// `drop` applies to `basis` first (`"all"` empties it), then `add` is merged
/// in (`"all"` means the whole allow-list), and the result never leaves
/// `allowed`. The returned names are sorted.
pub fn calculate<S: AsRef<str>>(
  basis: &CapabilitySet,
  allowed: &[S],
  add: &[S],
  drop: &[S],
) -> Result<Vec<String>> {
  let allow = CapabilitySet::new(allowed);
  let adds = CapabilitySet::new(add);
  let drops = CapabilitySet::new(drop);
  allow.check_known()?;
  adds.check_known()?;
  drops.check_known()?;

  let missing = adds
    .iter()
    .filter(|name| name.as_str() != "all" && !allow.contains(name))
    .cloned()
    .collect::<Vec<String>>();
  if !missing.is_empty() {
    return Err(ExecutorError::UnknownCapability(format!(
      "not in allow-list: {}",
      missing.join(", ")
    )));
  }

  let mut effective = if drops.contains("all") {
    BTreeSet::new()
  } else {
    basis
      .0
      .iter()
      .filter(|name| !drops.contains(name))
      .cloned()
      .collect()
  };

  if adds.contains("all") {
    effective.extend(allow.0.iter().cloned());
  } else {
    effective.extend(adds.0.iter().cloned());
  }

  let effective = effective
    .into_iter()
    .filter(|name| allow.contains(name))
    .collect::<Vec<String>>();
  debug!("Calculated capabilities: {}", effective.join(","));
  Ok(effective)
}

/// Capability changes the task process makes before exec, worked out in the
/// executor so the cloned child only issues the syscalls.
#[derive(Debug, Clone)]
pub(crate) struct CapabilityPlan {
  keep: CapsHashSet,
  drop_bounding: Vec<Capability>,
}

impl CapabilityPlan {
  /// Plan to keep exactly `wanted`. Fails when the executor does not hold all of it.
  pub fn new(wanted: CapsHashSet) -> Result<Self> {
    let permitted = caps::read(None, CapSet::Permitted).map_err(caps_error)?;
    let mut missing = wanted
      .difference(&permitted)
      .map(|cap| normalize(&cap.to_string()))
      .collect::<Vec<String>>();
    if !missing.is_empty() {
      missing.sort();
      return Err(ExecutorError::UnknownCapability(format!(
        "not held by the executor: {}",
        missing.join(", ")
      )));
    }

    let bounding = caps::read(None, CapSet::Bounding).map_err(caps_error)?;
    let drop_bounding = bounding.difference(&wanted).copied().collect::<Vec<Capability>>();
    debug!(
      "Capability plan keeps {} and drops {} from the bounding set",
      wanted.len(),
      drop_bounding.len()
    );
    Ok(CapabilityPlan {
      keep: wanted,
      drop_bounding,
    })
  }

  pub fn keeps(&self) -> &CapsHashSet {
    &self.keep
  }

  /// Switch to the task user while retaining exactly the planned set in every
  /// capability set. Runs in the child before exec.
  ///
  /// The bounding set is trimmed while we still hold CAP_SETPCAP, keep-caps
  /// carries the permitted set across setuid, and the ambient set makes the
  /// capabilities survive exec for non-root users. Effective shrinks before
  /// permitted since the kernel rejects an effective set wider than permitted.
  pub fn apply(&self, user: Option<(Uid, Gid)>) -> Result<()> {
    for cap in &self.drop_bounding {
      caps::drop(None, CapSet::Bounding, *cap).map_err(caps_error)?;
    }

    if let Some((uid, gid)) = user {
      if unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) } != 0 {
        return Err(ExecutorError::Child("prctl(PR_SET_KEEPCAPS) failed".to_string()));
      }
      setgroups(&[gid])?;
      setgid(gid)?;
      setuid(uid)?;
    }

    caps::set(None, CapSet::Effective, &self.keep).map_err(caps_error)?;
    caps::set(None, CapSet::Permitted, &self.keep).map_err(caps_error)?;
    caps::set(None, CapSet::Inheritable, &self.keep).map_err(caps_error)?;
    caps::set(None, CapSet::Ambient, &self.keep).map_err(caps_error)?;
    Ok(())
  }
}

fn caps_error(err: caps::errors::CapsError) -> ExecutorError {
  ExecutorError::Child(format!("capabilities: {}", err))
}
