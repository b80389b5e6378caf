use std::fmt::{self, Display};
use std::fs::File;
use std::str::FromStr;

use log::debug;
use nix::sched::CloneFlags;
use nix::unistd::Pid;

use crate::error::{ExecutorError, Result};

/// Whether a task shares a namespace with the host or gets its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
  Host,
  #[default]
  Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NamespaceKind {
  Mount,
  Pid,
  Ipc,
}

/// The namespaces a task is created in, always in Mount, Pid, Ipc order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet(Vec<NamespaceKind>);

/// Open `/proc/<pid>/ns/*` files pinning the task's namespaces
#[derive(Debug)]
pub struct NamespaceHandles {
  files: Vec<(NamespaceKind, File)>,
}

impl FromStr for IsolationMode {
  type Err = ExecutorError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "host" => Ok(IsolationMode::Host),
      "private" => Ok(IsolationMode::Private),
      _ => Err(ExecutorError::InvalidIsolationConfig(s.to_string())),
    }
  }
}

impl Display for IsolationMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      IsolationMode::Host => f.write_str("host"),
      IsolationMode::Private => f.write_str("private"),
    }
  }
}

impl NamespaceKind {
  /// Entry name under `/proc/<pid>/ns`
  pub fn proc_name(&self) -> &'static str {
    match self {
      NamespaceKind::Mount => "mnt",
      NamespaceKind::Pid => "pid",
      NamespaceKind::Ipc => "ipc",
    }
  }

  pub fn clone_flag(&self) -> CloneFlags {
    match self {
      NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
      NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
      NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
    }
  }
}

/// Decide which namespaces to create for the given isolation modes.
///
/// A mount namespace is always created so the task can be confined to its
/// own root; PID and IPC namespaces follow their modes.
pub fn compose_namespaces(pid_mode: IsolationMode, ipc_mode: IsolationMode) -> NamespaceSet {
  let mut kinds = vec![NamespaceKind::Mount];
  if pid_mode == IsolationMode::Private {
    kinds.push(NamespaceKind::Pid);
  }
  if ipc_mode == IsolationMode::Private {
    kinds.push(NamespaceKind::Ipc);
  }
  NamespaceSet(kinds)
}

impl NamespaceSet {
  pub fn contains(&self, kind: NamespaceKind) -> bool {
    self.0.contains(&kind)
  }

  pub fn kinds(&self) -> &[NamespaceKind] {
    &self.0
  }

  pub fn clone_flags(&self) -> CloneFlags {
    self
      .0
      .iter()
      .fold(CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
  }

  /// Open a handle on each namespace of a running process
  pub fn open(&self, pid: Pid) -> Result<NamespaceHandles> {
    let mut files = Vec::with_capacity(self.0.len());
    for kind in &self.0 {
      let path = format!("/proc/{}/ns/{}", pid.as_raw(), kind.proc_name());
      debug!("Open namespace handle {}", path);
      files.push((*kind, File::open(&path)?));
    }
    Ok(NamespaceHandles { files })
  }
}

impl NamespaceHandles {
  pub fn get(&self, kind: NamespaceKind) -> Option<&File> {
    self
      .files
      .iter()
      .find(|(k, _)| *k == kind)
      .map(|(_, file)| file)
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}
