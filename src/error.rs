use std::{
  fmt::{self, Display},
  path::PathBuf,
  process::{ExitCode, Termination},
  time::Duration,
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// The step of a launch that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchStage {
  Namespace,
  Cgroup,
  Capability,
  Path,
  Mount,
  Device,
  Process,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
  #[error("invalid isolation mode {0:?}, expected \"host\" or \"private\"")]
  InvalidIsolationConfig(String),

  #[error("unknown capability: {0}")]
  UnknownCapability(String),

  #[error("invalid device {path}: {reason}")]
  InvalidDeviceConfig { path: PathBuf, reason: String },

  #[error("invalid resources: {0}")]
  InvalidResourceConfig(String),

  #[error("resource {resource} unavailable: {reason}")]
  ResourceUnavailable { resource: String, reason: String },

  #[error("file {path} not found under path {root}")]
  ExecutableNotFound { path: String, root: String },

  #[error("launch failed at {stage} stage: {source}")]
  LaunchFailed {
    stage: LaunchStage,
    #[source]
    source: Box<ExecutorError>,
  },

  #[error("process {pid} is not running")]
  ProcessNotRunning { pid: i32 },

  #[error("process {pid} did not exit within the shutdown timeout")]
  ShutdownTimeout { pid: i32 },

  #[error("shutdown failed: {0}")]
  ShutdownFailed(String),

  #[error("wait cancelled before the process exited")]
  Cancelled,

  #[error("command in process {pid} did not finish within {timeout:?}")]
  ExecTimeout { pid: i32, timeout: Duration },

  #[error("cgroup error: {0}")]
  Cgroup(String),

  #[error("{0}")]
  Child(String),

  #[error("invalid launch spec: {0}")]
  Spec(String),

  #[error("system error: {0}")]
  Sys(#[from] Errno),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("logger error: {0}")]
  Logger(#[from] FlexiLoggerError),
}

pub enum ExecutorExit {
  Ok,
  Err(ExecutorError),
}

impl ExecutorError {
  pub fn unavailable<RS: Into<String>, MS: Into<String>>(resource: RS, reason: MS) -> ExecutorError {
    ExecutorError::ResourceUnavailable {
      resource: resource.into(),
      reason: reason.into(),
    }
  }

  pub fn device<P: Into<PathBuf>, MS: Into<String>>(path: P, reason: MS) -> ExecutorError {
    ExecutorError::InvalidDeviceConfig {
      path: path.into(),
      reason: reason.into(),
    }
  }

  pub fn cgroup<MS: Into<String>>(msg: MS) -> ExecutorError {
    ExecutorError::Cgroup(msg.into())
  }

  pub fn spec<MS: Into<String>>(msg: MS) -> ExecutorError {
    ExecutorError::Spec(msg.into())
  }

  /// Wrap an error with the launch stage it happened in
  pub fn launch(stage: LaunchStage, err: ExecutorError) -> ExecutorError {
    match err {
      already @ ExecutorError::LaunchFailed { .. } => already,
      err => ExecutorError::LaunchFailed {
        stage,
        source: Box::new(err),
      },
    }
  }

  /// The failing stage, if this is a launch failure
  pub fn stage(&self) -> Option<LaunchStage> {
    match self {
      ExecutorError::LaunchFailed { stage, .. } => Some(*stage),
      _ => None,
    }
  }
}

impl LaunchStage {
  pub fn as_str(&self) -> &'static str {
    match self {
      LaunchStage::Namespace => "namespace",
      LaunchStage::Cgroup => "cgroup",
      LaunchStage::Capability => "capability",
      LaunchStage::Path => "path",
      LaunchStage::Mount => "mount",
      LaunchStage::Device => "device",
      LaunchStage::Process => "process",
    }
  }

  pub fn parse(text: &str) -> Option<Self> {
    match text {
      "namespace" => Some(LaunchStage::Namespace),
      "cgroup" => Some(LaunchStage::Cgroup),
      "capability" => Some(LaunchStage::Capability),
      "path" => Some(LaunchStage::Path),
      "mount" => Some(LaunchStage::Mount),
      "device" => Some(LaunchStage::Device),
      "process" => Some(LaunchStage::Process),
      _ => None,
    }
  }
}

impl Display for LaunchStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Termination for ExecutorExit {
  fn report(self) -> ExitCode {
    match self {
      ExecutorExit::Ok => ExitCode::SUCCESS.report(),
      ExecutorExit::Err(err) => {
        let kind = match &err {
          ExecutorError::LaunchFailed { stage, .. } => format!("Launch ({})", stage),
          ExecutorError::ExecutableNotFound { .. } => "Executable".to_string(),
          ExecutorError::UnknownCapability(_) => "Capability".to_string(),
          ExecutorError::InvalidDeviceConfig { .. } => "Device".to_string(),
          _ => "Executor".to_string(),
        };
        let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
        let text = if is_tty {
          format!("\x1b[1m\x1b[91m{} Error\x1b[39m\x1b[22m  {}", kind, err)
        } else {
          format!(
            "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
            kind,
            err.to_string().replace('\\', "\\\\").replace('"', "\\\"")
          )
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn launch_failure_names_stage_and_value() {
    let err = ExecutorError::launch(
      LaunchStage::Path,
      ExecutorError::ExecutableNotFound {
        path: "/bin/kill".to_string(),
        root: "/srv/task".to_string(),
      },
    );
    assert_eq!(err.stage(), Some(LaunchStage::Path));
    assert_eq!(
      err.to_string(),
      "launch failed at path stage: file /bin/kill not found under path /srv/task"
    );
  }

  #[test]
  fn launch_failure_is_not_wrapped_twice() {
    let inner = ExecutorError::launch(LaunchStage::Cgroup, ExecutorError::cgroup("busy"));
    let outer = ExecutorError::launch(LaunchStage::Process, inner);
    assert_eq!(outer.stage(), Some(LaunchStage::Cgroup));
  }

  #[test]
  fn stage_names_round_trip() {
    for stage in [
      LaunchStage::Namespace,
      LaunchStage::Cgroup,
      LaunchStage::Capability,
      LaunchStage::Path,
      LaunchStage::Mount,
      LaunchStage::Device,
      LaunchStage::Process,
    ] {
      assert_eq!(LaunchStage::parse(stage.as_str()), Some(stage));
    }
    assert_eq!(LaunchStage::parse("bogus"), None);
  }
}
