#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use flexi_logger::Logger;
use log::warn;
use nix::unistd::{access, AccessFlags, Uid};
use tempfile::{tempdir, TempDir};

use isoexec::{LaunchSpec, LaunchSpecBuilder, MountSpec};

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("isoexec=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// Launch tests need root and a writable cgroup hierarchy
pub fn can_launch() -> bool {
  setup();
  if !Uid::effective().is_root() {
    warn!("Skip launch test: not running as root");
    return false;
  }
  let root = cgroups_rs::hierarchies::auto().root();
  if access(&root, AccessFlags::W_OK).is_err() {
    warn!("Skip launch test: cgroup root {} is not writable", root.display());
    return false;
  }
  true
}

/// An empty task directory
pub struct TaskDir {
  pub dir: TempDir,
  pub out: TempDir,
}

impl TaskDir {
  pub fn new() -> Self {
    TaskDir {
      dir: tempdir().unwrap(),
      out: tempdir().unwrap(),
    }
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// File written by the task under `/out`
  pub fn output(&self, name: &str) -> String {
    std::fs::read_to_string(self.out.path().join(name))
      .unwrap_or_default()
      .trim()
      .to_string()
  }

  pub fn out_path(&self) -> PathBuf {
    self.out.path().to_path_buf()
  }

  /// Spec with the host toolchain mounted read-only and `/out` writable
  pub fn spec(&self, alloc_id: &str, command: &str) -> LaunchSpecBuilder {
    let mut builder = LaunchSpec::builder(alloc_id, "test", command)
      .task_dir(self.path())
      .mount(MountSpec::new(self.out.path(), "/out"));
    for dir in ["/bin", "/usr", "/lib", "/lib64", "/etc"] {
      if Path::new(dir).exists() {
        builder = builder.mount(MountSpec::new(dir, dir).read_only(true));
      }
    }
    builder
  }
}
