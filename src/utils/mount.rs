//! Mount operations for the task root.
//!
//! The plan is built by the executor. Everything that touches the mount table
//! runs in the task process inside its new mount namespace and must not log.

use std::fs::{create_dir_all, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, chroot, pivot_root};

use crate::error::Result;
use crate::resolve::clean_rooted;
use crate::translate::{BindMount, DeviceRule};

/// Host nodes bound into every task's `/dev` when present
pub const DEFAULT_DEVICE_NODES: [&str; 6] = [
  "/dev/null",
  "/dev/zero",
  "/dev/full",
  "/dev/random",
  "/dev/urandom",
  "/dev/tty",
];

/// One bind mount with both ends resolved on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootMount {
  pub source: PathBuf,
  /// Host path under the task root
  pub target: PathBuf,
  pub source_is_dir: bool,
  pub flags: MsFlags,
  pub read_only: bool,
  pub propagation: Option<MsFlags>,
}

/// Host location of a path inside the task root
pub fn target_in_root(root: &Path, task_path: &Path) -> PathBuf {
  let cleaned = clean_rooted(task_path);
  match cleaned.strip_prefix("/") {
    Ok(relative) if !relative.as_os_str().is_empty() => root.join(relative),
    _ => root.to_path_buf(),
  }
}

/// Resolve the task's bind mounts against its root
pub fn plan_binds(root: &Path, binds: &[BindMount]) -> Vec<RootMount> {
  binds
    .iter()
    .map(|bind| {
      let target = target_in_root(root, &bind.target);
      debug!("Plan mount {:?} -> {:?}", bind.source, target);
      RootMount {
        source: bind.source.clone(),
        source_is_dir: bind.source.is_dir(),
        target,
        flags: MsFlags::MS_BIND | MsFlags::MS_REC,
        read_only: bind.read_only,
        propagation: Some(bind.propagation),
      }
    })
    .collect()
}

/// The default device nodes that exist on this host, then the declared ones
pub fn plan_devices(root: &Path, declared: &[DeviceRule]) -> Vec<RootMount> {
  let defaults = DEFAULT_DEVICE_NODES
    .into_iter()
    .map(Path::new)
    .filter(|host| host.exists())
    .map(|host| (host, host));
  let declared = declared.iter().filter_map(|rule| match (&rule.host_path, &rule.task_path) {
    (Some(host), Some(task_path)) => Some((host.as_path(), task_path.as_path())),
    _ => None,
  });

  defaults
    .chain(declared)
    .map(|(host, task_path)| {
      let target = target_in_root(root, task_path);
      debug!("Plan device {:?} -> {:?}", host, target);
      RootMount {
        source: host.to_path_buf(),
        target,
        source_is_dir: false,
        flags: MsFlags::MS_BIND,
        read_only: false,
        propagation: None,
      }
    })
    .collect()
}

/// Stop mount events from leaking back to the host, then make the task root
/// a mount point of its own so it can be pivoted into
pub fn private_root(root: &Path) -> Result<()> {
  mount::<str, str, str, str>(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None)?;
  mount::<Path, Path, str, str>(Some(root), root, None, MsFlags::MS_BIND | MsFlags::MS_REC, None)?;
  Ok(())
}

/// Create an empty file or directory to mount over, matching the source
fn mount_point_for(source_is_dir: bool, target: &Path) -> Result<()> {
  if source_is_dir {
    create_dir_all(target)?;
  } else {
    if let Some(parent) = target.parent() {
      create_dir_all(parent)?;
    }
    if !target.exists() {
      OpenOptions::new().create(true).write(true).open(target)?;
    }
  }
  Ok(())
}

pub fn apply(mounts: &[RootMount]) -> Result<()> {
  for entry in mounts {
    mount_point_for(entry.source_is_dir, &entry.target)?;
    mount::<Path, Path, str, str>(Some(entry.source.as_path()), &entry.target, None, entry.flags, None)?;
    if entry.read_only {
      // MS_RDONLY is ignored on the initial bind, it needs a remount
      mount::<str, Path, str, str>(
        None,
        &entry.target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
        None,
      )?;
    }
    if let Some(propagation) = entry.propagation {
      mount::<str, Path, str, str>(None, &entry.target, None, propagation, None)?;
    }
  }
  Ok(())
}

/// A fresh procfs, showing the task's own PID namespace when it has one
pub fn mount_proc(target: &Path) -> Result<()> {
  create_dir_all(target)?;
  mount::<str, Path, str, str>(
    Some("proc"),
    target,
    Some("proc"),
    MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
    None,
  )?;
  Ok(())
}

/// Make `root` the root of this mount namespace and detach the old one.
/// Unlike chroot, nothing of the host tree stays reachable afterwards.
pub fn pivot_into(root: &Path) -> Result<()> {
  chdir(root)?;
  // stacks the old root on top of the new one at "."
  pivot_root(".", ".")?;
  umount2(".", MntFlags::MNT_DETACH)?;
  chdir("/")?;
  Ok(())
}

/// Plain chroot, for roots that cannot be pivoted
pub fn chroot_into(root: &Path) -> Result<()> {
  chroot(root)?;
  chdir("/")?;
  Ok(())
}
