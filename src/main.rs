use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{error, info};
use nix::libc::STDOUT_FILENO;
use nix::unistd::isatty;
use path_absolutize::Absolutize;

use isoexec::utils::default_format;
use isoexec::{
  DeviceSpec, Executor, ExecutorConfig, ExecutorError, ExecutorExit, ExitState, IsolationMode, LaunchSpec,
  MountSpec, ProcessIo, Resources, WaitContext,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(long, default_value_t = false, help = "Log debug messages")]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run a program as an isolated task and wait for it")]
  Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
  #[arg(long, default_value = "local", help = "Allocation id")]
  alloc_id: String,

  #[arg(long, default_value = "task", help = "Task name")]
  task: String,

  #[arg(long, help = "Task directory, the root the task is confined to")]
  task_dir: PathBuf,

  #[arg(long, default_value = "/", help = "Working directory inside the task root")]
  cwd: PathBuf,

  #[arg(short, long, help = "Run as this user")]
  user: Option<String>,

  #[arg(short, long, help = "Environment variable KEY=VALUE, or KEY to pass it through")]
  env: Vec<String>,

  #[arg(short = 'v', long, help = "Bind mount host[:task][:ro]")]
  mount: Vec<String>,

  #[arg(short, long, help = "Device host[:task[:permissions]]")]
  device: Vec<String>,

  #[arg(long, default_value = "private", help = "PID namespace mode (host or private)")]
  pid_mode: String,

  #[arg(long, default_value = "private", help = "IPC namespace mode (host or private)")]
  ipc_mode: String,

  #[arg(long, default_value_t = false, help = "Grant every capability")]
  privileged: bool,

  #[arg(long, value_delimiter = ',', help = "Capabilities to add")]
  cap_add: Vec<String>,

  #[arg(long, value_delimiter = ',', help = "Capabilities to drop")]
  cap_drop: Vec<String>,

  #[arg(long, default_value_t = 100, help = "CPU shares")]
  cpu_shares: u64,

  #[arg(long, default_value_t = false, help = "Enforce CPU shares as a hard quota")]
  cpu_hard_limit: bool,

  #[arg(short, long, default_value_t = 0, help = "Memory ceiling (unit: MB, 0 uses the default)")]
  memory: u64,

  #[arg(long, default_value_t = 0, help = "Hard memory ceiling (unit: MB)")]
  memory_max: u64,

  #[arg(long, default_value_t = false, help = "Do not limit memory")]
  memory_unlimited: bool,

  #[arg(long, default_value_t = 0, help = "Maximum number of processes (0 for no limit)")]
  pids: u64,

  #[arg(long, default_value_t = false, help = "Do not enforce resource limits")]
  no_limits: bool,

  #[arg(long, default_value_t = false, help = "Keep an accounting cgroup when limits are off")]
  accounting: bool,

  #[arg(long, help = "Parent cgroup of the task")]
  cgroup: Option<String>,

  #[arg(long, help = "Append task stdout to this file")]
  stdout: Option<PathBuf>,

  #[arg(long, help = "Append task stderr to this file")]
  stderr: Option<PathBuf>,

  #[arg(short, long, help = "Shut the task down after this many seconds")]
  timeout: Option<u64>,

  #[arg(long, default_value_t = 5000, help = "Grace period before SIGKILL (unit: ms)")]
  grace: u64,

  #[arg(long, help = "Log resource usage at this interval (unit: ms)")]
  stats_interval: Option<u64>,

  #[arg(help = "Program")]
  program: String,

  #[arg(trailing_var_arg = true, allow_hyphen_values = true, help = "Arguments")]
  arguments: Vec<String>,
}

fn parse_device(text: &str) -> Result<DeviceSpec, ExecutorError> {
  let parts = text.split(':').collect::<Vec<&str>>();
  match parts.as_slice() {
    [host] => Ok(DeviceSpec::new(*host)),
    [host, task] => Ok(DeviceSpec::new(*host).task_path(*task)),
    [host, task, permissions] => Ok(DeviceSpec::new(*host).task_path(*task).permissions(*permissions)),
    _ => Err(ExecutorError::device(text, "wrong device string format")),
  }
}

impl RunArgs {
  fn resolve(&self) -> Result<LaunchSpec, ExecutorError> {
    let task_dir = self.task_dir.absolutize()?.to_path_buf();

    let mut builder = LaunchSpec::builder(&self.alloc_id, &self.task, &self.program)
      .args(self.arguments.clone())
      .task_dir(task_dir)
      .cwd(&self.cwd)
      .pid_mode(self.pid_mode.parse::<IsolationMode>()?)
      .ipc_mode(self.ipc_mode.parse::<IsolationMode>()?)
      .privileged(self.privileged)
      .cap_add(self.cap_add.clone())
      .cap_drop(self.cap_drop.clone())
      .resources(Resources {
        cpu_shares: self.cpu_shares,
        cpu_hard_limit: self.cpu_hard_limit,
        memory_mb: self.memory,
        memory_max_mb: self.memory_max,
        memory_unlimited: self.memory_unlimited,
        pids_max: self.pids,
      })
      .resource_limits(!self.no_limits)
      .basic_accounting(self.accounting)
      .parse_env_list(self.env.clone())?;

    if let Some(user) = &self.user {
      builder = builder.user_name(user);
    }
    for mount in &self.mount {
      let mount = MountSpec::parse(mount)?;
      let host = mount.host_path.absolutize()?.to_path_buf();
      builder = builder.mount(MountSpec { host_path: host, ..mount });
    }
    for device in &self.device {
      builder = builder.device(parse_device(device)?);
    }
    builder.build()
  }

  fn io(&self) -> Result<ProcessIo, ExecutorError> {
    match (&self.stdout, &self.stderr) {
      (None, None) => ProcessIo::null(),
      (stdout, stderr) => {
        let null = PathBuf::from("/dev/null");
        ProcessIo::files(stdout.as_ref().unwrap_or(&null), stderr.as_ref().unwrap_or(&null))
      }
    }
  }
}

fn report(state: &ExitState) {
  let signal = state.signal.map(|s| s.to_string());
  let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
  if is_tty {
    println!(
      "\x1b[1mExit\x1b[22m  code {}{}  at {}",
      state.exit_code,
      signal.as_ref().map(|s| format!(" ({})", s)).unwrap_or_default(),
      state.exit_time.format("%Y-%m-%d %H:%M:%S")
    );
  } else {
    println!(
      "{{\n  \"ok\": true,\n  \"exit_code\": {},\n  \"signal\": {},\n  \"exit_time\": \"{}\"\n}}",
      state.exit_code,
      signal.map(|s| format!("\"{}\"", s)).unwrap_or_else(|| "null".to_string()),
      state.exit_time.to_rfc3339()
    );
  }
}

fn run(args: RunArgs) -> Result<ExitState, ExecutorError> {
  let spec = args.resolve()?;
  let mut config = ExecutorConfig::from_env();
  if let Some(parent) = &args.cgroup {
    config = config.cgroup_parent(parent);
  }
  let executor = Executor::new(config);
  let handle = executor.launch(&spec, args.io()?)?;

  if let Some(interval) = args.stats_interval {
    let samples = handle.watch_stats(WaitContext::background(), Duration::from_millis(interval))?;
    let pid = handle.pid();
    thread::spawn(move || {
      for usage in samples {
        info!(
          "Process {} uses {} bytes of memory, {} us of CPU, {} pids",
          pid, usage.memory.usage, usage.cpu.total_usec, usage.pids
        );
      }
    });
  }

  let ctx = match args.timeout {
    Some(seconds) => WaitContext::with_timeout(Duration::from_secs(seconds)),
    None => WaitContext::background(),
  };
  let state = match handle.wait(&ctx) {
    Ok(state) => state,
    Err(ExecutorError::Cancelled) => {
      info!("Task {} timed out, shutting it down", handle.pid());
      handle.shutdown(None, Duration::from_millis(args.grace))?;
      handle.wait(&WaitContext::background())?
    }
    Err(err) => return Err(err),
  };

  // releases the cgroup and namespace handles of the exited task
  handle.shutdown(None, Duration::ZERO)?;
  Ok(state)
}

fn main() -> ExecutorExit {
  let cli = Cli::parse();

  let level = if cli.verbose { "isoexec=debug" } else { "isoexec=info" };
  let logger = Logger::try_with_str(level).and_then(|logger| {
    logger
      .log_to_file(
        FileSpec::default()
          .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
          .basename("isoexec")
          .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
          .suppress_timestamp(),
      )
      .append()
      .duplicate_to_stderr(Duplicate::Warn)
      .format_for_files(default_format)
      .print_message()
      .start()
  });
  let _logger = match logger {
    Ok(logger) => logger,
    Err(err) => return ExecutorExit::Err(err.into()),
  };

  info!("Start running isoexec");

  let result = match cli.command {
    Commands::Run(args) => run(args),
  };

  match result {
    Ok(state) => {
      report(&state);
      info!("Running isoexec finished");
      ExecutorExit::Ok
    }
    Err(err) => {
      error!("{}", err);
      ExecutorExit::Err(err)
    }
  }
}
