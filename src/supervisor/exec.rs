use std::fs::File;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, bounded, select, Receiver};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sched::{clone, setns, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::{ExecutorError, Result};
use crate::namespace::NamespaceKind;
use crate::resolve::{resolve_executable, ResolvedExecutable};
use crate::utils::ExecutorPipe;

use super::child::{child_failure, ExecSetup};
use super::{abort, lock, reap_now, ExitState, Held, Inner, STACK_SIZE};

impl Inner {
  /// Clone a command into the running task and collect what it prints
  pub(super) fn exec(&self, timeout: Duration, command: &str, args: &[String]) -> Result<(Vec<u8>, i32)> {
    let deadline = Instant::now() + timeout;
    let executable = resolve_executable(&self.template.spec, command)?;
    let (pid_ns, setup) = self.exec_setup(&executable, command, args)?;
    info!("Exec {} {} in process {}", command, args.join(" "), self.pid);

    let sync = ExecutorPipe::new()?;
    let errors = ExecutorPipe::new()?;
    let output = ExecutorPipe::new()?;
    let close_all = || {
      sync.close();
      errors.close();
      output.close();
    };

    // joining a PID namespace only affects children of the calling thread,
    // so the clone happens on a thread of its own
    let cloned = thread::scope(|scope| {
      scope
        .spawn(|| -> Result<Pid> {
          if let Some(pid_ns) = &pid_ns {
            setns(pid_ns.as_raw_fd(), CloneFlags::CLONE_NEWPID)?;
          }
          let mut stack = vec![0u8; STACK_SIZE];
          let child = unsafe {
            clone(
              Box::new(|| setup.run(sync, errors, output)),
              &mut stack,
              CloneFlags::empty(),
              Some(Signal::SIGCHLD as i32),
            )
          }?;
          Ok(child)
        })
        .join()
        .unwrap_or_else(|_| Err(ExecutorError::Child("exec clone thread panicked".to_string())))
    });
    let child = match cloned {
      Ok(child) => child,
      Err(err) => {
        close_all();
        return Err(err);
      }
    };
    debug!("Cloned exec process {} for process {}", child, self.pid);

    let (release, failures, collected) = match (sync.write(), errors.read(), output.read()) {
      (Ok(release), Ok(failures), Ok(collected)) => (release, failures, collected),
      (Err(err), ..) | (_, Err(err), _) | (.., Err(err)) => {
        abort(child);
        return Err(err);
      }
    };

    let attached = match lock(&self.held).as_ref() {
      Some(Held {
        cgroup: Some(cgroup), ..
      }) => cgroup.attach(child),
      _ => Ok(()),
    };
    if let Err(err) = attached.and_then(|_| release.signal()) {
      abort(child);
      return Err(err);
    }
    drop(release);

    let report = match failures.read_to_end() {
      Ok(report) => report,
      Err(err) => {
        abort(child);
        return Err(err);
      }
    };
    if !report.is_empty() {
      let err = child_failure(&report);
      warn!("Exec in process {} failed before exec: {}", self.pid, err);
      reap_now(child);
      return Err(err);
    }

    let (output_sender, output_receiver) = bounded(1);
    let reader = thread::Builder::new()
      .name(format!("exec-output-{}", child))
      .spawn(move || {
        let _ = output_sender.send(collected.read_bytes());
      });
    if let Err(err) = reader {
      abort(child);
      return Err(err.into());
    }
    let (exit_sender, exit_receiver) = bounded(1);
    let waiter = thread::Builder::new()
      .name(format!("exec-wait-{}", child))
      .spawn(move || {
        let _ = exit_sender.send(wait_exit(child));
      });
    if let Err(err) = waiter {
      abort(child);
      return Err(err.into());
    }

    let timer = at(deadline);
    let output = select! {
      recv(output_receiver) -> output => match output {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
          stop(child, &exit_receiver);
          return Err(err);
        }
        Err(_) => vec![],
      },
      recv(timer) -> _ => {
        stop(child, &exit_receiver);
        return Err(self.exec_timeout(timeout));
      }
    };
    let state = select! {
      recv(exit_receiver) -> state => state.unwrap_or_else(|_| ExitState::unknown()),
      recv(timer) -> _ => {
        stop(child, &exit_receiver);
        return Err(self.exec_timeout(timeout));
      }
    };

    info!(
      "Exec {} in process {} exited with code {}",
      command, self.pid, state.exit_code
    );
    Ok((output, state.exit_code))
  }

  /// Duplicate the handles the command needs to join the task. Fails once
  /// the task has been reaped or cleaned up.
  fn exec_setup(
    &self,
    executable: &ResolvedExecutable,
    command: &str,
    args: &[String],
  ) -> Result<(Option<File>, ExecSetup)> {
    let not_running = || ExecutorError::ProcessNotRunning { pid: self.pid.as_raw() };

    let lifecycle = lock(&self.lifecycle);
    if lifecycle.reaped {
      return Err(not_running());
    }
    let held = lock(&self.held);
    let handles = match held.as_ref() {
      Some(held) => &held.namespaces,
      None => return Err(not_running()),
    };
    let join = |kind: NamespaceKind| -> Result<Option<File>> {
      Ok(handles.get(kind).map(File::try_clone).transpose()?)
    };

    let pid_ns = join(NamespaceKind::Pid)?;
    let mut namespaces = vec![];
    for kind in [NamespaceKind::Ipc, NamespaceKind::Mount] {
      if let Some(file) = join(kind)? {
        namespaces.push((kind.clone_flag(), file));
      }
    }
    let root = File::open(format!("/proc/{}/root", self.pid))?;
    drop(held);
    drop(lifecycle);

    let setup = ExecSetup::new(
      &self.template.spec,
      executable,
      command,
      args,
      namespaces,
      root,
      self.template.capabilities.clone(),
    )?;
    Ok((pid_ns, setup))
  }

  fn exec_timeout(&self, timeout: Duration) -> ExecutorError {
    warn!("Exec in process {} outlived {:?}, killed", self.pid, timeout);
    ExecutorError::ExecTimeout {
      pid: self.pid.as_raw(),
      timeout,
    }
  }
}

/// Kill a command that overran and wait for its waiter thread to reap it
fn stop(child: Pid, exited: &Receiver<ExitState>) {
  if let Err(err) = kill(child, Signal::SIGKILL) {
    if err != Errno::ESRCH {
      warn!("Kill exec process {} fails: {}", child, err);
    }
  }
  let _ = exited.recv();
}

fn wait_exit(pid: Pid) -> ExitState {
  loop {
    match waitpid(pid, None) {
      Ok(status) => {
        if let Some(state) = ExitState::from_wait_status(status) {
          return state;
        }
      }
      Err(Errno::EINTR) => continue,
      Err(err) => {
        warn!("Reap exec process {} fails: {}", pid, err);
        return ExitState::unknown();
      }
    }
  }
}
