use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::error::{ExecutorError, Result};
use crate::supervisor::lock;

/// How a task ended. Recorded once by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitState {
  /// Exit status, or 128 + signal number when killed by a signal
  pub exit_code: i32,
  pub signal: Option<Signal>,
  pub exit_time: DateTime<Local>,
}

impl ExitState {
  pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
    match status {
      WaitStatus::Exited(_, code) => Some(ExitState {
        exit_code: code,
        signal: None,
        exit_time: Local::now(),
      }),
      WaitStatus::Signaled(_, signal, _) => Some(ExitState {
        exit_code: 128 + signal as i32,
        signal: Some(signal),
        exit_time: Local::now(),
      }),
      _ => None,
    }
  }

  /// The exit status could not be collected
  pub(crate) fn unknown() -> Self {
    ExitState {
      exit_code: -1,
      signal: None,
      exit_time: Local::now(),
    }
  }

  pub fn success(&self) -> bool {
    self.exit_code == 0 && self.signal.is_none()
  }
}

/// Deadline and cancellation for one wait. Cancelling stops only that wait.
#[derive(Debug, Clone)]
pub struct WaitContext {
  cancel: Receiver<()>,
  deadline: Option<Instant>,
}

/// Cancels every wait using its context. Dropping it cancels too.
#[derive(Debug)]
pub struct CancelHandle(Sender<()>);

impl WaitContext {
  /// Wait until the process exits
  pub fn background() -> Self {
    WaitContext {
      cancel: never(),
      deadline: None,
    }
  }

  pub fn with_timeout(timeout: Duration) -> Self {
    WaitContext {
      cancel: never(),
      deadline: Some(Instant::now() + timeout),
    }
  }

  pub fn with_cancel() -> (Self, CancelHandle) {
    let (sender, receiver) = bounded(0);
    (
      WaitContext {
        cancel: receiver,
        deadline: None,
      },
      CancelHandle(sender),
    )
  }

  pub fn deadline(mut self, deadline: Instant) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub(crate) fn cancelled(&self) -> &Receiver<()> {
    &self.cancel
  }

  /// Fires once at the deadline, never without one
  pub(crate) fn timer(&self) -> Receiver<Instant> {
    match self.deadline {
      Some(deadline) => at(deadline),
      None => never(),
    }
  }
}

impl CancelHandle {
  pub fn cancel(self) {
    drop(self);
  }
}

/// Broadcasts the exit state to any number of waiters
#[derive(Debug)]
pub(crate) struct ExitWatch {
  state: OnceLock<ExitState>,
  sender: Mutex<Option<Sender<()>>>,
  receiver: Receiver<()>,
}

impl ExitWatch {
  pub fn new() -> Self {
    let (sender, receiver) = bounded(0);
    ExitWatch {
      state: OnceLock::new(),
      sender: Mutex::new(Some(sender)),
      receiver,
    }
  }

  /// Record the exit and wake every waiter. Only the first call has an effect.
  pub fn publish(&self, state: ExitState) -> bool {
    let first = self.state.set(state).is_ok();
    // disconnecting the channel wakes all receivers at once
    lock(&self.sender).take();
    first
  }

  pub fn get(&self) -> Option<&ExitState> {
    self.state.get()
  }

  /// Disconnects once the exit is published
  pub fn exited(&self) -> &Receiver<()> {
    &self.receiver
  }

  pub fn wait(&self, ctx: &WaitContext) -> Result<ExitState> {
    if let Some(state) = self.state.get() {
      return Ok(state.clone());
    }
    let deadline = ctx.timer();
    select! {
      recv(self.receiver) -> _ => {}
      recv(ctx.cancel) -> _ => return Err(ExecutorError::Cancelled),
      recv(deadline) -> _ => return Err(ExecutorError::Cancelled),
    }
    self
      .state
      .get()
      .cloned()
      .ok_or_else(|| ExecutorError::Child("exit channel closed without an exit state".to_string()))
  }
}
