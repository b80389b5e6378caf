use std::ffi::CString;
use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sched::{setns, CloneFlags};
use nix::unistd::{chdir, chroot, dup2, execve, fchdir, setsid, Gid, Uid};

use crate::capabilities::CapabilityPlan;
use crate::error::{ExecutorError, LaunchStage, Result};
use crate::resolve::{ResolvedExecutable, DEFAULT_PATH};
use crate::task::{LaunchSpec, ProcessIo};
use crate::translate::Translation;
use crate::utils::mount::{self, chroot_into, plan_binds, plan_devices, pivot_into, private_root, RootMount};
use crate::utils::{into_c_string, path_c_string, ExecutorPipe};

/// Everything the cloned child needs, prepared by the parent so the child
/// does as little work as possible before exec. The child must not log:
/// another executor thread may have held the logger lock at clone time.
pub(crate) struct ChildSetup {
  root: PathBuf,
  cwd: PathBuf,
  program: CString,
  argv: Vec<CString>,
  envp: Vec<CString>,
  mounts: Vec<RootMount>,
  devices: Vec<RootMount>,
  proc_target: PathBuf,
  pivot: bool,
  capabilities: CapabilityPlan,
  user: Option<(Uid, Gid)>,
  io: ProcessIo,
}

/// A command run inside an already running task: joins its namespaces and
/// root instead of building them.
pub(crate) struct ExecSetup {
  /// Joined in this order, the mount namespace last
  namespaces: Vec<(CloneFlags, File)>,
  root: File,
  cwd: PathBuf,
  program: CString,
  argv: Vec<CString>,
  envp: Vec<CString>,
  capabilities: CapabilityPlan,
  user: Option<(Uid, Gid)>,
  stdin: File,
}

type StageResult<T> = std::result::Result<T, (LaunchStage, ExecutorError)>;

trait AtStage<T> {
  fn at(self, stage: LaunchStage) -> StageResult<T>;
}

impl<T, E: Into<ExecutorError>> AtStage<T> for std::result::Result<T, E> {
  fn at(self, stage: LaunchStage) -> StageResult<T> {
    self.map_err(|err| (stage, err.into()))
  }
}

fn command_line(command: &str, args: &[String]) -> Result<Vec<CString>> {
  let mut argv = vec![into_c_string(command)?];
  for arg in args {
    argv.push(into_c_string(arg)?);
  }
  Ok(argv)
}

/// The task's environment, with a default PATH when it sets none
fn task_env(spec: &LaunchSpec) -> Result<Vec<CString>> {
  let mut env = spec.env().clone();
  if env.get("PATH").is_none() {
    env.set("PATH", DEFAULT_PATH);
  }
  env.to_c_strings()
}

/// Wait for the parent's go-ahead. It comes once the child is in the cgroup.
fn wait_release(sync: ExecutorPipe) -> StageResult<()> {
  let sync = sync.read().at(LaunchStage::Process)?;
  if !sync.wait().at(LaunchStage::Process)? {
    return Err((
      LaunchStage::Process,
      ExecutorError::Child("executor went away before release".to_string()),
    ));
  }
  Ok(())
}

/// Shared body of every cloned child. Never returns on success.
fn run_child<F: FnOnce() -> StageResult<()>>(errors: ExecutorPipe, body: F) -> isize {
  let report = match errors.write() {
    Ok(report) => report,
    Err(_) => unsafe { libc::_exit(127) },
  };

  if let Err((stage, err)) = body() {
    let _ = report.write(format!("{}: {}", stage, err));
  }
  unsafe { libc::_exit(127) }
}

impl ChildSetup {
  pub fn new(
    spec: &LaunchSpec,
    translation: &Translation,
    executable: &ResolvedExecutable,
    capabilities: CapabilityPlan,
    pivot: bool,
    io: ProcessIo,
  ) -> Result<Self> {
    let root = spec.task_dir().to_path_buf();
    Ok(ChildSetup {
      cwd: spec.cwd().to_path_buf(),
      program: path_c_string(&executable.confined)?,
      argv: command_line(spec.command(), spec.args())?,
      envp: task_env(spec)?,
      mounts: plan_binds(&root, &translation.mounts),
      devices: plan_devices(&root, &translation.devices),
      proc_target: root.join("proc"),
      root,
      pivot,
      capabilities,
      user: spec.user().map(|user| (user.uid, user.gid)),
      io,
    })
  }

  pub fn run(&self, sync: ExecutorPipe, errors: ExecutorPipe) -> isize {
    run_child(errors, || self.setup_and_exec(sync))
  }

  fn setup_and_exec(&self, sync: ExecutorPipe) -> StageResult<()> {
    wait_release(sync)?;

    self.redirect_io().at(LaunchStage::Process)?;
    setsid().at(LaunchStage::Process)?;
    fs::write("/proc/self/oom_score_adj", "0").at(LaunchStage::Process)?;

    private_root(&self.root).at(LaunchStage::Mount)?;
    mount::apply(&self.mounts).at(LaunchStage::Mount)?;
    mount::apply(&self.devices).at(LaunchStage::Device)?;
    mount::mount_proc(&self.proc_target).at(LaunchStage::Mount)?;

    if self.pivot {
      pivot_into(&self.root).at(LaunchStage::Mount)?;
    } else {
      chroot_into(&self.root).at(LaunchStage::Mount)?;
    }
    chdir(&self.cwd).at(LaunchStage::Path)?;

    self.capabilities.apply(self.user).at(LaunchStage::Capability)?;

    match execve(&self.program, &self.argv, &self.envp) {
      Ok(never) => match never {},
      Err(err) => Err((LaunchStage::Process, err.into())),
    }
  }

  fn redirect_io(&self) -> Result<()> {
    dup2(self.io.stdin.as_raw_fd(), STDIN_FILENO)?;
    dup2(self.io.stdout.as_raw_fd(), STDOUT_FILENO)?;
    dup2(self.io.stderr.as_raw_fd(), STDERR_FILENO)?;
    Ok(())
  }
}

impl ExecSetup {
  pub fn new(
    spec: &LaunchSpec,
    executable: &ResolvedExecutable,
    command: &str,
    args: &[String],
    namespaces: Vec<(CloneFlags, File)>,
    root: File,
    capabilities: CapabilityPlan,
  ) -> Result<Self> {
    Ok(ExecSetup {
      namespaces,
      root,
      cwd: spec.cwd().to_path_buf(),
      program: path_c_string(&executable.confined)?,
      argv: command_line(command, args)?,
      envp: task_env(spec)?,
      capabilities,
      user: spec.user().map(|user| (user.uid, user.gid)),
      stdin: File::open("/dev/null")?,
    })
  }

  /// `output` collects stdout and stderr together
  pub fn run(&self, sync: ExecutorPipe, errors: ExecutorPipe, output: ExecutorPipe) -> isize {
    run_child(errors, || self.join_and_exec(sync, output))
  }

  fn join_and_exec(&self, sync: ExecutorPipe, output: ExecutorPipe) -> StageResult<()> {
    let output = output.write().at(LaunchStage::Process)?;
    wait_release(sync)?;

    dup2(self.stdin.as_raw_fd(), STDIN_FILENO).at(LaunchStage::Process)?;
    dup2(output.as_raw_fd(), STDOUT_FILENO).at(LaunchStage::Process)?;
    dup2(output.as_raw_fd(), STDERR_FILENO).at(LaunchStage::Process)?;

    for (flag, file) in &self.namespaces {
      setns(file.as_raw_fd(), *flag).at(LaunchStage::Namespace)?;
    }
    fchdir(self.root.as_raw_fd()).at(LaunchStage::Mount)?;
    chroot(".").at(LaunchStage::Mount)?;
    chdir(&self.cwd).at(LaunchStage::Path)?;

    self.capabilities.apply(self.user).at(LaunchStage::Capability)?;

    match execve(&self.program, &self.argv, &self.envp) {
      Ok(never) => match never {},
      Err(err) => Err((LaunchStage::Process, err.into())),
    }
  }
}

/// Turn a `<stage>: <message>` report from the child into a launch error
pub(crate) fn child_failure(report: &str) -> ExecutorError {
  let report = report.trim();
  let (stage, message) = match report.split_once(": ") {
    Some((stage, message)) => match LaunchStage::parse(stage) {
      Some(stage) => (stage, message),
      None => (LaunchStage::Process, report),
    },
    None => (LaunchStage::Process, report),
  };
  ExecutorError::launch(stage, ExecutorError::Child(message.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn child_failure_keeps_stage() {
    let err = child_failure("mount: EPERM: Operation not permitted");
    assert_eq!(err.stage(), Some(LaunchStage::Mount));
    assert_eq!(
      err.to_string(),
      "launch failed at mount stage: EPERM: Operation not permitted"
    );
  }

  #[test]
  fn unknown_stage_is_a_process_failure() {
    let err = child_failure("boom");
    assert_eq!(err.stage(), Some(LaunchStage::Process));
    let err = child_failure("weird: thing");
    assert_eq!(err.stage(), Some(LaunchStage::Process));
    assert!(err.to_string().ends_with("weird: thing"));
  }

  #[test]
  fn command_line_starts_with_the_command() {
    let argv = command_line("/bin/sh", &["-c".to_string(), "true".to_string()]).unwrap();
    let argv = argv.iter().map(|arg| arg.to_str().unwrap()).collect::<Vec<_>>();
    assert_eq!(argv, vec!["/bin/sh", "-c", "true"]);
  }

  #[test]
  fn task_env_defaults_path() {
    let spec = LaunchSpec::builder("env", "test", "/bin/true")
      .task_dir("/srv/task")
      .env("A", "1")
      .build()
      .unwrap();
    let envp = task_env(&spec).unwrap();
    let envp = envp.iter().map(|var| var.to_str().unwrap()).collect::<Vec<_>>();
    assert!(envp.contains(&"A=1"));
    assert!(envp.contains(&format!("PATH={}", DEFAULT_PATH).as_str()));

    let spec = LaunchSpec::builder("env", "test", "/bin/true")
      .task_dir("/srv/task")
      .env("PATH", "/opt/bin")
      .build()
      .unwrap();
    let envp = task_env(&spec).unwrap();
    assert!(envp.iter().any(|var| var.to_str().unwrap() == "PATH=/opt/bin"));
    assert_eq!(envp.iter().filter(|var| var.to_str().unwrap().starts_with("PATH=")).count(), 1);
  }
}
