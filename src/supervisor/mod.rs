use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sched::clone;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

pub use exit::{CancelHandle, ExitState, WaitContext};

use crate::capabilities::{calculate, CapabilityPlan, CapabilitySet};
use crate::cgroup::{cgroup_name, ResourceUsage, TaskCgroup};
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, LaunchStage, Result};
use crate::namespace::{compose_namespaces, NamespaceHandles, NamespaceSet};
use crate::resolve::{make_executable, resolve_executable};
use crate::task::{LaunchSpec, ProcessIo};
use crate::translate::translate;
use crate::utils::ExecutorPipe;

use self::child::{child_failure, ChildSetup};
use self::exit::ExitWatch;

mod child;
mod exec;
mod exit;
mod procfs;

const STACK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
  Created,
  Running,
  ShuttingDown,
  Exited,
}

/// Launches isolated tasks
pub struct Executor {
  config: Arc<ExecutorConfig>,
}

/// Handle on one supervised task. Clones share the same process.
#[derive(Clone)]
pub struct ProcessHandle {
  inner: Arc<Inner>,
}

struct Lifecycle {
  state: ProcessState,
  reaped: bool,
}

/// What a command run inside the task inherits from it
struct ExecTemplate {
  spec: LaunchSpec,
  capabilities: CapabilityPlan,
}

/// Kernel resources released exactly once on cleanup
struct Held {
  cgroup: Option<TaskCgroup>,
  namespaces: NamespaceHandles,
}

struct Inner {
  pid: Pid,
  started_at: DateTime<Local>,
  namespaces: NamespaceSet,
  cgroup_paths: Vec<PathBuf>,
  kill_timeout: Duration,
  default_signal: Signal,
  lifecycle: Mutex<Lifecycle>,
  exit: ExitWatch,
  held: Mutex<Option<Held>>,
  shutdown: Mutex<Option<std::result::Result<(), String>>>,
  template: ExecTemplate,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Executor {
  pub fn new(config: ExecutorConfig) -> Self {
    Executor {
      config: Arc::new(config),
    }
  }

  pub fn config(&self) -> &ExecutorConfig {
    &self.config
  }

  /// Launch a task and start supervising it
  pub fn launch(&self, spec: &LaunchSpec, io: ProcessIo) -> Result<ProcessHandle> {
    let config = self.config.as_ref();
    info!(
      "Launch task {}.{}: {} {}",
      spec.alloc_id(),
      spec.task_name(),
      spec.command(),
      spec.args().join(" ")
    );

    let request = spec.capabilities();
    let capabilities = if request.privileged {
      CapabilitySet::privileged()
    } else {
      calculate(
        &config.capability_basis,
        &config.allowed_capabilities,
        &request.add,
        &request.drop,
      )
      .map_err(|err| ExecutorError::launch(LaunchStage::Capability, err))?
      .into_iter()
      .collect()
    };
    let capabilities = capabilities
      .to_caps()
      .map_err(|err| ExecutorError::launch(LaunchStage::Capability, err))?;

    let namespaces = compose_namespaces(spec.pid_mode(), spec.ipc_mode());
    debug!("Compose namespaces {:?}", namespaces.kinds());

    let translation = translate(config, spec.resources(), spec.mounts(), spec.devices()).map_err(|err| {
      let stage = match &err {
        ExecutorError::InvalidDeviceConfig { .. } => LaunchStage::Device,
        ExecutorError::ResourceUnavailable { .. } => LaunchStage::Mount,
        _ => LaunchStage::Cgroup,
      };
      ExecutorError::launch(stage, err)
    })?;

    let executable = resolve_executable(spec, spec.command())
      .map_err(|err| ExecutorError::launch(LaunchStage::Path, err))?;
    make_executable(&executable.host).map_err(|err| ExecutorError::launch(LaunchStage::Path, err))?;

    let capabilities =
      CapabilityPlan::new(capabilities).map_err(|err| ExecutorError::launch(LaunchStage::Capability, err))?;
    let template = ExecTemplate {
      spec: spec.clone(),
      capabilities: capabilities.clone(),
    };

    if config.no_pivot_root {
      warn!("Confine task {}.{} with chroot, pivot_root is disabled", spec.alloc_id(), spec.task_name());
    }
    let setup = ChildSetup::new(spec, &translation, &executable, capabilities, !config.no_pivot_root, io)
      .map_err(|err| ExecutorError::launch(LaunchStage::Process, err))?;

    let mut cgroup = if spec.wants_cgroup() {
      let name = cgroup_name(&config.cgroup_parent, spec.alloc_id(), spec.task_name());
      let cgroup = TaskCgroup::create(config, &name, &translation.cgroup, spec.resource_limits())
        .map_err(|err| ExecutorError::launch(LaunchStage::Cgroup, err))?;
      Some(cgroup)
    } else {
      None
    };

    let (pid, handles) = spawn(&setup, &namespaces, cgroup.as_ref())?;
    drop(setup);

    let cgroup_paths = cgroup.as_ref().map(|cgroup| cgroup.paths()).unwrap_or_default();
    let inner = Arc::new(Inner {
      pid,
      started_at: Local::now(),
      namespaces,
      cgroup_paths,
      kill_timeout: config.kill_timeout,
      default_signal: config.shutdown_signal,
      lifecycle: Mutex::new(Lifecycle {
        state: ProcessState::Created,
        reaped: false,
      }),
      exit: ExitWatch::new(),
      held: Mutex::new(Some(Held {
        cgroup: cgroup.take(),
        namespaces: handles,
      })),
      shutdown: Mutex::new(None),
      template,
    });

    let reaper = inner.clone();
    if let Err(err) = thread::Builder::new()
      .name(format!("reaper-{}", pid))
      .spawn(move || reaper.reap())
    {
      abort(pid);
      inner.cleanup_quietly();
      return Err(ExecutorError::launch(LaunchStage::Process, err.into()));
    }

    lock(&inner.lifecycle).state = ProcessState::Running;
    info!("Task {}.{} is running as pid {}", spec.alloc_id(), spec.task_name(), pid);
    Ok(ProcessHandle { inner })
  }
}

/// Clone the child into its namespaces, pin them, put it in the cgroup and
/// release it. Returns once the child has exec'd, or with the failure it
/// reported. The handles are opened while the child is still parked, so a
/// task that exits right after exec cannot fail its own launch.
fn spawn(
  setup: &ChildSetup,
  namespaces: &NamespaceSet,
  cgroup: Option<&TaskCgroup>,
) -> Result<(Pid, NamespaceHandles)> {
  let sync = ExecutorPipe::new().map_err(|err| ExecutorError::launch(LaunchStage::Process, err))?;
  let errors = match ExecutorPipe::new() {
    Ok(errors) => errors,
    Err(err) => {
      sync.close();
      return Err(ExecutorError::launch(LaunchStage::Process, err));
    }
  };

  let mut stack = vec![0u8; STACK_SIZE];
  let cloned = unsafe {
    clone(
      Box::new(|| setup.run(sync, errors)),
      &mut stack,
      namespaces.clone_flags(),
      Some(Signal::SIGCHLD as i32),
    )
  };
  let pid = match cloned {
    Ok(pid) => pid,
    Err(err) => {
      sync.close();
      errors.close();
      return Err(ExecutorError::launch(LaunchStage::Namespace, err.into()));
    }
  };
  debug!("Cloned child process {}", pid);

  let release = sync.write();
  let failures = errors.read();
  let (release, failures) = match (release, failures) {
    (Ok(release), Ok(failures)) => (release, failures),
    (Err(err), _) | (_, Err(err)) => {
      abort(pid);
      return Err(ExecutorError::launch(LaunchStage::Process, err));
    }
  };

  let handles = match namespaces.open(pid) {
    Ok(handles) => handles,
    Err(err) => {
      abort(pid);
      return Err(ExecutorError::launch(LaunchStage::Namespace, err));
    }
  };

  if let Some(cgroup) = cgroup {
    if let Err(err) = cgroup.attach(pid) {
      abort(pid);
      return Err(ExecutorError::launch(LaunchStage::Cgroup, err));
    }
  }

  if let Err(err) = release.signal() {
    abort(pid);
    return Err(ExecutorError::launch(LaunchStage::Process, err));
  }
  drop(release);

  let report = match failures.read_to_end() {
    Ok(report) => report,
    Err(err) => {
      abort(pid);
      return Err(ExecutorError::launch(LaunchStage::Process, err));
    }
  };
  if !report.is_empty() {
    let err = child_failure(&report);
    warn!("Child process {} failed before exec: {}", pid, err);
    reap_now(pid);
    return Err(err);
  }

  Ok((pid, handles))
}

/// Kill and reap a child that never became a supervised task
fn abort(pid: Pid) {
  let _ = kill(pid, Signal::SIGKILL);
  reap_now(pid);
}

fn reap_now(pid: Pid) {
  loop {
    match waitpid(pid, None) {
      Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
      Ok(_) | Err(Errno::EINTR) => continue,
      Err(err) => {
        warn!("Reap child process {} fails: {}", pid, err);
        break;
      }
    }
  }
}

impl Inner {
  /// Reaper thread body
  fn reap(self: Arc<Self>) {
    // wait without reaping, so the pid stays valid for senders holding the lock
    loop {
      let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
      let rc = unsafe {
        libc::waitid(
          libc::P_PID,
          self.pid.as_raw() as libc::id_t,
          &mut info,
          libc::WEXITED | libc::WNOWAIT,
        )
      };
      if rc == 0 {
        break;
      }
      match Errno::last() {
        Errno::EINTR => continue,
        err => {
          error!("Wait for process {} fails: {}", self.pid, err);
          break;
        }
      }
    }

    let state = {
      let mut lifecycle = lock(&self.lifecycle);
      let state = loop {
        match waitpid(self.pid, None) {
          Ok(status) => {
            if let Some(state) = ExitState::from_wait_status(status) {
              break state;
            }
          }
          Err(Errno::EINTR) => continue,
          Err(err) => {
            error!("Reap process {} fails: {}", self.pid, err);
            break ExitState::unknown();
          }
        }
      };
      lifecycle.reaped = true;
      lifecycle.state = ProcessState::Exited;
      state
    };

    info!(
      "Process {} exited with code {} (signal {:?})",
      self.pid, state.exit_code, state.signal
    );
    self.exit.publish(state);
  }

  /// Send a signal unless the pid has already been reaped
  fn send(&self, pid: Pid, signal: Signal, group: bool) -> Result<()> {
    let lifecycle = lock(&self.lifecycle);
    if lifecycle.reaped {
      return Err(ExecutorError::ProcessNotRunning { pid: self.pid.as_raw() });
    }
    if group {
      killpg(pid, signal)?;
    } else {
      kill(pid, signal)?;
    }
    Ok(())
  }

  /// SIGKILL the task and everything else in its cgroup
  fn kill_all(&self) {
    let lifecycle = lock(&self.lifecycle);
    if lifecycle.reaped {
      return;
    }
    let members = lock(&self.held)
      .as_ref()
      .and_then(|held| held.cgroup.as_ref())
      .map(|cgroup| cgroup.pids())
      .unwrap_or_default();
    for member in members.into_iter().filter(|member| *member != self.pid) {
      if let Err(err) = kill(member, Signal::SIGKILL) {
        if err != Errno::ESRCH {
          warn!("Kill process {} fails: {}", member, err);
        }
      }
    }
    let _ = killpg(self.pid, Signal::SIGKILL);
    if let Err(err) = kill(self.pid, Signal::SIGKILL) {
      warn!("Kill process {} fails: {}", self.pid, err);
    }
    drop(lifecycle);
  }

  fn shutdown(&self, signal: Signal, grace: Duration) -> Result<()> {
    {
      let mut lifecycle = lock(&self.lifecycle);
      if !lifecycle.reaped {
        lifecycle.state = ProcessState::ShuttingDown;
      }
    }

    if grace.is_zero() {
      info!("Kill process {} immediately", self.pid);
      self.kill_all();
    } else {
      info!("Shutdown process {} with {}, grace {:?}", self.pid, signal, grace);
      match self.send(self.pid, signal, false) {
        Ok(()) | Err(ExecutorError::ProcessNotRunning { .. }) => {}
        Err(err) => return Err(err),
      }
      match self.exit.wait(&WaitContext::with_timeout(grace)) {
        Ok(_) => {}
        Err(ExecutorError::Cancelled) => {
          info!("Process {} outlived its grace period, escalate to SIGKILL", self.pid);
          self.kill_all();
        }
        Err(err) => return Err(err),
      }
    }

    match self.exit.wait(&WaitContext::with_timeout(self.kill_timeout)) {
      Ok(_) => {}
      Err(ExecutorError::Cancelled) => {
        error!("Process {} did not exit after SIGKILL", self.pid);
        return Err(ExecutorError::ShutdownTimeout { pid: self.pid.as_raw() });
      }
      Err(err) => return Err(err),
    }

    self.cleanup()
  }

  /// Release the cgroup and namespace handles. Later calls do nothing.
  fn cleanup(&self) -> Result<()> {
    let held = lock(&self.held).take();
    if let Some(held) = held {
      debug!("Release {} namespace handles of process {}", held.namespaces.len(), self.pid);
      drop(held.namespaces);
      if let Some(mut cgroup) = held.cgroup {
        cgroup.destroy()?;
      }
    }
    Ok(())
  }

  fn cleanup_quietly(&self) {
    if let Err(err) = self.cleanup() {
      error!("Cleanup process {} fails: {}", self.pid, err);
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    if self.exit.get().is_some() {
      self.cleanup_quietly();
    }
  }
}

impl fmt::Debug for ProcessHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProcessHandle")
      .field("pid", &self.inner.pid)
      .field("namespaces", &self.inner.namespaces)
      .field("state", &self.state())
      .finish()
  }
}

impl ProcessHandle {
  pub fn pid(&self) -> Pid {
    self.inner.pid
  }

  pub fn started_at(&self) -> DateTime<Local> {
    self.inner.started_at
  }

  pub fn cgroup_paths(&self) -> &[PathBuf] {
    &self.inner.cgroup_paths
  }

  pub fn namespaces(&self) -> &NamespaceSet {
    &self.inner.namespaces
  }

  /// Whether the namespace handles are still open
  pub fn holds_namespaces(&self) -> bool {
    lock(&self.inner.held).is_some()
  }

  pub fn state(&self) -> ProcessState {
    lock(&self.inner.lifecycle).state
  }

  pub fn exit_state(&self) -> Option<ExitState> {
    self.inner.exit.get().cloned()
  }

  /// Block until the task exits or `ctx` is done. Any number of callers may wait.
  pub fn wait(&self, ctx: &WaitContext) -> Result<ExitState> {
    self.inner.exit.wait(ctx)
  }

  /// Signal the task's main process
  pub fn signal(&self, signal: Signal) -> Result<()> {
    debug!("Send {} to process {}", signal, self.inner.pid);
    self.inner.send(self.inner.pid, signal, false)
  }

  /// Signal the task's whole process group
  pub fn signal_group(&self, signal: Signal) -> Result<()> {
    debug!("Send {} to process group {}", signal, self.inner.pid);
    self.inner.send(self.inner.pid, signal, true)
  }

  /// Stop the task: `signal` (SIGINT by default), then SIGKILL to the whole
  /// cgroup once `grace` runs out, then release its resources. A zero grace
  /// kills right away. Every later call returns the outcome of the first.
  pub fn shutdown(&self, signal: Option<Signal>, grace: Duration) -> Result<()> {
    let mut outcome = lock(&self.inner.shutdown);
    if let Some(previous) = outcome.as_ref() {
      debug!("Replay shutdown outcome of process {}", self.inner.pid);
      return previous.clone().map_err(ExecutorError::ShutdownFailed);
    }
    let result = self
      .inner
      .shutdown(signal.unwrap_or(self.inner.default_signal), grace);
    *outcome = Some(result.as_ref().map(|_| ()).map_err(|err| err.to_string()));
    result
  }

  /// Sample resource usage from the cgroup, or from procfs without one
  pub fn stats(&self) -> Result<ResourceUsage> {
    let not_running = || ExecutorError::ProcessNotRunning {
      pid: self.inner.pid.as_raw(),
    };
    if lock(&self.inner.lifecycle).reaped {
      return Err(not_running());
    }
    let held = lock(&self.inner.held);
    match held.as_ref() {
      Some(Held {
        cgroup: Some(cgroup), ..
      }) => Ok(cgroup.stats()),
      Some(_) => procfs::usage(self.inner.pid).map_err(|_| not_running()),
      None => Err(not_running()),
    }
  }

  /// Sample resource usage right away and then every `interval`. The stream
  /// ends when the task exits, `ctx` is done or the receiver is dropped.
  pub fn watch_stats(&self, ctx: WaitContext, interval: Duration) -> Result<Receiver<ResourceUsage>> {
    let (sender, receiver) = bounded(1);
    let handle = self.clone();
    thread::Builder::new()
      .name(format!("stats-{}", self.inner.pid))
      .spawn(move || handle.stream_stats(ctx, interval, sender))?;
    Ok(receiver)
  }

  fn stream_stats(&self, ctx: WaitContext, interval: Duration, sender: Sender<ResourceUsage>) {
    let ticker = tick(interval);
    let deadline = ctx.timer();
    let exited = self.inner.exit.exited().clone();
    let cancelled = ctx.cancelled().clone();
    loop {
      let usage = match self.stats() {
        Ok(usage) => usage,
        Err(err) => {
          debug!("Stop stats of process {}: {}", self.inner.pid, err);
          return;
        }
      };
      select! {
        send(sender, usage) -> sent => if sent.is_err() { return },
        recv(exited) -> _ => return,
        recv(cancelled) -> _ => return,
        recv(deadline) -> _ => return,
      }
      select! {
        recv(ticker) -> _ => {}
        recv(exited) -> _ => return,
        recv(cancelled) -> _ => return,
        recv(deadline) -> _ => return,
      }
    }
  }

  /// Run `command` inside the running task, in its namespaces, root, cgroup
  /// and capability set. Returns the combined stdout and stderr with the exit
  /// code, or `ExecTimeout` once `timeout` passes, after killing the command.
  pub fn exec<S: AsRef<str>>(&self, timeout: Duration, command: &str, args: &[S]) -> Result<(Vec<u8>, i32)> {
    let args = args.iter().map(|arg| arg.as_ref().to_string()).collect::<Vec<String>>();
    self.inner.exec(timeout, command, &args)
  }
}
