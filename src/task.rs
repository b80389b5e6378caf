use std::ffi::CString;
use std::fmt::{self, Display};
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use nix::unistd::{Gid, Uid, User};

use crate::error::{ExecutorError, Result};
use crate::namespace::IsolationMode;
use crate::utils::{into_c_string, parse_env};

/// Everything needed to launch one isolated task. Immutable once built.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
  pub(crate) alloc_id: String,
  pub(crate) task_name: String,
  pub(crate) command: String,
  pub(crate) args: Vec<String>,
  pub(crate) env: Environment,
  pub(crate) task_dir: PathBuf,
  pub(crate) cwd: PathBuf,
  pub(crate) user: Option<TaskUser>,
  pub(crate) mounts: Vec<MountSpec>,
  pub(crate) devices: Vec<DeviceSpec>,
  pub(crate) pid_mode: IsolationMode,
  pub(crate) ipc_mode: IsolationMode,
  pub(crate) capabilities: CapabilityRequest,
  pub(crate) resources: Resources,
  pub(crate) resource_limits: bool,
  pub(crate) basic_accounting: bool,
}

pub struct LaunchSpecBuilder {
  spec: LaunchSpec,
  errors: Vec<String>,
}

/// Ordered environment, later assignments of a key replace earlier ones in place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(Vec<(String, String)>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskUser {
  pub uid: Uid,
  pub gid: Gid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRequest {
  pub privileged: bool,
  pub add: Vec<String>,
  pub drop: Vec<String>,
}

/// Abstract resource ceilings, translated into cgroup settings at launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
  pub cpu_shares: u64,
  pub cpu_hard_limit: bool,
  /// Memory ceiling in MB, 0 picks the executor default
  pub memory_mb: u64,
  /// Hard memory ceiling in MB when above `memory_mb`
  pub memory_max_mb: u64,
  pub memory_unlimited: bool,
  /// 0 means no ceiling
  pub pids_max: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
  #[default]
  Private,
  HostToTask,
  Bidirectional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
  pub host_path: PathBuf,
  pub task_path: PathBuf,
  pub read_only: bool,
  pub propagation: Propagation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
  pub host_path: PathBuf,
  /// Defaults to `host_path`
  pub task_path: Option<PathBuf>,
  /// Defaults to `rwm`
  pub permissions: Option<String>,
}

/// Standard streams handed to the task
#[derive(Debug)]
pub struct ProcessIo {
  pub(crate) stdin: OwnedFd,
  pub(crate) stdout: OwnedFd,
  pub(crate) stderr: OwnedFd,
}

impl LaunchSpec {
  pub fn builder<AS: Into<String>, TS: Into<String>, CS: Into<String>>(
    alloc_id: AS,
    task_name: TS,
    command: CS,
  ) -> LaunchSpecBuilder {
    LaunchSpecBuilder {
      spec: LaunchSpec {
        alloc_id: alloc_id.into(),
        task_name: task_name.into(),
        command: command.into(),
        args: vec![],
        env: Environment::default(),
        task_dir: PathBuf::new(),
        cwd: PathBuf::from("/"),
        user: None,
        mounts: vec![],
        devices: vec![],
        pid_mode: IsolationMode::Private,
        ipc_mode: IsolationMode::Private,
        capabilities: CapabilityRequest::default(),
        resources: Resources::default(),
        resource_limits: true,
        basic_accounting: false,
      },
      errors: vec![],
    }
  }

  pub fn alloc_id(&self) -> &str {
    &self.alloc_id
  }

  pub fn task_name(&self) -> &str {
    &self.task_name
  }

  pub fn command(&self) -> &str {
    &self.command
  }

  pub fn args(&self) -> &[String] {
    &self.args
  }

  pub fn env(&self) -> &Environment {
    &self.env
  }

  pub fn task_dir(&self) -> &Path {
    &self.task_dir
  }

  pub fn cwd(&self) -> &Path {
    &self.cwd
  }

  pub fn user(&self) -> Option<TaskUser> {
    self.user
  }

  pub fn mounts(&self) -> &[MountSpec] {
    &self.mounts
  }

  pub fn devices(&self) -> &[DeviceSpec] {
    &self.devices
  }

  pub fn pid_mode(&self) -> IsolationMode {
    self.pid_mode
  }

  pub fn ipc_mode(&self) -> IsolationMode {
    self.ipc_mode
  }

  pub fn capabilities(&self) -> &CapabilityRequest {
    &self.capabilities
  }

  pub fn resources(&self) -> &Resources {
    &self.resources
  }

  /// Whether cgroup limits are enforced for this task
  pub fn resource_limits(&self) -> bool {
    self.resource_limits
  }

  /// Whether an accounting-only cgroup is created when limits are off
  pub fn basic_accounting(&self) -> bool {
    self.basic_accounting
  }

  /// Whether the task gets a cgroup at all
  pub fn wants_cgroup(&self) -> bool {
    self.resource_limits || self.basic_accounting
  }
}

impl LaunchSpecBuilder {
  /// Append one argument
  pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
    self.spec.args.push(arg.into());
    self
  }

  pub fn args<S: Into<String>>(mut self, args: Vec<S>) -> Self {
    self.spec.args.extend(args.into_iter().map(|a| a.into()));
    self
  }

  pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    self.spec.env.set(key, value);
    self
  }

  /// Parse `KEY=VALUE` (or bare `KEY`, read from the executor's environment) entries
  pub fn parse_env_list(mut self, list: Vec<String>) -> Result<Self> {
    for text in list {
      let (key, value) = parse_env(text)?;
      self.spec.env.set(key, value);
    }
    Ok(self)
  }

  pub fn task_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.spec.task_dir = path.into();
    self
  }

  /// Working directory inside the task root
  pub fn cwd<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.spec.cwd = path.into();
    self
  }

  pub fn user(mut self, uid: Uid, gid: Gid) -> Self {
    self.spec.user = Some(TaskUser { uid, gid });
    self
  }

  /// Run as the named host user
  pub fn user_name(mut self, name: &str) -> Self {
    match User::from_name(name) {
      Ok(Some(user)) => {
        self.spec.user = Some(TaskUser {
          uid: user.uid,
          gid: user.gid,
        })
      }
      Ok(None) => self.errors.push(format!("user {} does not exist", name)),
      Err(err) => self.errors.push(format!("look up user {}: {}", name, err)),
    }
    self
  }

  pub fn mount(mut self, mount: MountSpec) -> Self {
    self.spec.mounts.push(mount);
    self
  }

  pub fn device(mut self, device: DeviceSpec) -> Self {
    self.spec.devices.push(device);
    self
  }

  pub fn pid_mode(mut self, mode: IsolationMode) -> Self {
    self.spec.pid_mode = mode;
    self
  }

  pub fn ipc_mode(mut self, mode: IsolationMode) -> Self {
    self.spec.ipc_mode = mode;
    self
  }

  pub fn privileged(mut self, flag: bool) -> Self {
    self.spec.capabilities.privileged = flag;
    self
  }

  pub fn cap_add<S: Into<String>>(mut self, caps: Vec<S>) -> Self {
    self.spec.capabilities.add.extend(caps.into_iter().map(|c| c.into()));
    self
  }

  pub fn cap_drop<S: Into<String>>(mut self, caps: Vec<S>) -> Self {
    self.spec.capabilities.drop.extend(caps.into_iter().map(|c| c.into()));
    self
  }

  pub fn resources(mut self, resources: Resources) -> Self {
    self.spec.resources = resources;
    self
  }

  pub fn resource_limits(mut self, flag: bool) -> Self {
    self.spec.resource_limits = flag;
    self
  }

  pub fn basic_accounting(mut self, flag: bool) -> Self {
    self.spec.basic_accounting = flag;
    self
  }

  /// Check the shape of the launch spec. Nothing on the host is touched here.
  pub fn build(self) -> Result<LaunchSpec> {
    let LaunchSpecBuilder { spec, mut errors } = self;

    for (field, value) in [("alloc id", &spec.alloc_id), ("task name", &spec.task_name)] {
      if value.is_empty() {
        errors.push(format!("{} is empty", field));
      } else if value.contains('/') || value == "." || value == ".." {
        errors.push(format!("{} {:?} is not a valid cgroup name", field, value));
      }
    }
    if spec.command.is_empty() {
      errors.push("command is empty".to_string());
    }
    if !spec.task_dir.is_absolute() {
      errors.push(format!("task dir {:?} is not absolute", spec.task_dir));
    }
    if !spec.cwd.is_absolute() {
      errors.push(format!("cwd {:?} is not absolute", spec.cwd));
    }
    for mount in &spec.mounts {
      if !mount.host_path.is_absolute() || !mount.task_path.is_absolute() {
        errors.push(format!(
          "mount {:?} -> {:?} must use absolute paths",
          mount.host_path, mount.task_path
        ));
      }
    }
    for device in &spec.devices {
      if !device.host_path.is_absolute() {
        errors.push(format!("device {:?} is not absolute", device.host_path));
      }
      if let Some(task_path) = &device.task_path {
        if !task_path.is_absolute() {
          errors.push(format!("device task path {:?} is not absolute", task_path));
        }
      }
    }
    if spec.resources.memory_max_mb > 0
      && spec.resources.memory_mb > 0
      && spec.resources.memory_max_mb < spec.resources.memory_mb
    {
      errors.push(format!(
        "memory max {} MB is below memory {} MB",
        spec.resources.memory_max_mb, spec.resources.memory_mb
      ));
    }

    if errors.is_empty() {
      debug!("Built launch spec for {}.{}", spec.alloc_id, spec.task_name);
      Ok(spec)
    } else {
      Err(ExecutorError::spec(errors.join("; ")))
    }
  }
}

impl Environment {
  pub fn new() -> Self {
    Environment(vec![])
  }

  /// Set a variable; an existing key keeps its position and takes the new value
  pub fn set<KS: Into<String>, VS: Into<String>>(&mut self, key: KS, value: VS) {
    let key = key.into();
    let value = value.into();
    match self.0.iter_mut().find(|(k, _)| *k == key) {
      Some(entry) => entry.1 = value,
      None => self.0.push((key, value)),
    }
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub(crate) fn to_c_strings(&self) -> Result<Vec<CString>> {
    self
      .0
      .iter()
      .map(|(key, value)| into_c_string(&format!("{}={}", key, value)))
      .collect()
  }
}

impl<KS: Into<String>, VS: Into<String>> FromIterator<(KS, VS)> for Environment {
  fn from_iter<T: IntoIterator<Item = (KS, VS)>>(iter: T) -> Self {
    let mut env = Environment::new();
    for (key, value) in iter {
      env.set(key, value);
    }
    env
  }
}

impl Default for Resources {
  fn default() -> Self {
    Resources {
      cpu_shares: 100,
      cpu_hard_limit: false,
      memory_mb: 0,
      memory_max_mb: 0,
      memory_unlimited: false,
      pids_max: 0,
    }
  }
}

impl FromStr for Propagation {
  type Err = ExecutorError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "" | "private" => Ok(Propagation::Private),
      "host-to-task" => Ok(Propagation::HostToTask),
      "bidirectional" => Ok(Propagation::Bidirectional),
      _ => Err(ExecutorError::spec(format!("unknown mount propagation {:?}", s))),
    }
  }
}

impl Display for Propagation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Propagation::Private => f.write_str("private"),
      Propagation::HostToTask => f.write_str("host-to-task"),
      Propagation::Bidirectional => f.write_str("bidirectional"),
    }
  }
}

impl MountSpec {
  pub fn new<HP: Into<PathBuf>, TP: Into<PathBuf>>(host_path: HP, task_path: TP) -> Self {
    MountSpec {
      host_path: host_path.into(),
      task_path: task_path.into(),
      read_only: false,
      propagation: Propagation::Private,
    }
  }

  pub fn read_only(mut self, flag: bool) -> Self {
    self.read_only = flag;
    self
  }

  pub fn propagation(mut self, propagation: Propagation) -> Self {
    self.propagation = propagation;
    self
  }

  /// Parse `host[:task][:ro]`, the form accepted on the command line
  pub fn parse(text: &str) -> Result<Self> {
    let parts = text.split(':').collect::<Vec<&str>>();
    let (mount, rest) = match parts.as_slice() {
      [host] => (MountSpec::new(*host, *host), &[][..]),
      [host, "ro"] | [host, "rw"] => (MountSpec::new(*host, *host), &parts[1..]),
      [host, task, rest @ ..] => (MountSpec::new(*host, *task), rest),
      [] => return Err(ExecutorError::spec("empty mount")),
    };
    match rest {
      [] | ["rw"] => Ok(mount),
      ["ro"] => Ok(mount.read_only(true)),
      _ => Err(ExecutorError::spec(format!("wrong mount string format {:?}", text))),
    }
  }
}

impl DeviceSpec {
  pub fn new<P: Into<PathBuf>>(host_path: P) -> Self {
    DeviceSpec {
      host_path: host_path.into(),
      task_path: None,
      permissions: None,
    }
  }

  pub fn task_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.task_path = Some(path.into());
    self
  }

  pub fn permissions<S: Into<String>>(mut self, permissions: S) -> Self {
    self.permissions = Some(permissions.into());
    self
  }

  pub fn target(&self) -> &Path {
    self.task_path.as_deref().unwrap_or(&self.host_path)
  }
}

impl ProcessIo {
  pub fn new<I: Into<OwnedFd>, O: Into<OwnedFd>, E: Into<OwnedFd>>(stdin: I, stdout: O, stderr: E) -> Self {
    ProcessIo {
      stdin: stdin.into(),
      stdout: stdout.into(),
      stderr: stderr.into(),
    }
  }

  /// Every stream on /dev/null
  pub fn null() -> Result<Self> {
    let stdin = File::open("/dev/null")?;
    let stdout = OpenOptions::new().write(true).open("/dev/null")?;
    let stderr = stdout.try_clone()?;
    Ok(ProcessIo::new(stdin, stdout, stderr))
  }

  /// Append output to two files, stdin on /dev/null
  pub fn files<P: AsRef<Path>, Q: AsRef<Path>>(stdout: P, stderr: Q) -> Result<Self> {
    let stdin = File::open("/dev/null")?;
    let open = |path: &Path| OpenOptions::new().create(true).append(true).open(path);
    Ok(ProcessIo::new(stdin, open(stdout.as_ref())?, open(stderr.as_ref())?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn builder() -> LaunchSpecBuilder {
    LaunchSpec::builder("alloc1", "web", "/bin/echo").task_dir("/srv/task")
  }

  #[test]
  fn environment_is_last_wins_in_first_seen_order() {
    let env = [("A", "1"), ("B", "2"), ("A", "3")]
      .into_iter()
      .collect::<Environment>();
    let pairs = env.iter().cloned().collect::<Vec<(String, String)>>();
    assert_eq!(
      pairs,
      vec![("A".to_string(), "3".to_string()), ("B".to_string(), "2".to_string())]
    );
    assert_eq!(env.get("A"), Some("3"));
    assert_eq!(env.get("C"), None);
  }

  #[test]
  fn build_defaults() {
    let spec = builder().build().unwrap();
    assert_eq!(spec.cwd(), Path::new("/"));
    assert_eq!(spec.pid_mode(), IsolationMode::Private);
    assert_eq!(spec.ipc_mode(), IsolationMode::Private);
    assert!(spec.resource_limits());
    assert!(spec.wants_cgroup());
    assert_eq!(spec.resources().cpu_shares, 100);
  }

  #[test]
  fn build_rejects_bad_shape() {
    let err = LaunchSpec::builder("a/b", "", "")
      .task_dir("relative")
      .build()
      .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("alloc id"), "{}", msg);
    assert!(msg.contains("task name is empty"), "{}", msg);
    assert!(msg.contains("command is empty"), "{}", msg);
    assert!(msg.contains("task dir"), "{}", msg);
  }

  #[test]
  fn build_rejects_relative_mount() {
    let err = builder()
      .mount(MountSpec::new("/srv/data", "data"))
      .build()
      .unwrap_err();
    assert!(matches!(err, ExecutorError::Spec(_)));
  }

  #[test]
  fn build_rejects_memory_max_below_memory() {
    let resources = Resources {
      memory_mb: 256,
      memory_max_mb: 128,
      ..Resources::default()
    };
    assert!(builder().resources(resources).build().is_err());
  }

  #[test]
  fn parse_mounts() {
    let mount = MountSpec::parse("/srv/data").unwrap();
    assert_eq!(mount.task_path, PathBuf::from("/srv/data"));
    assert!(!mount.read_only);

    let mount = MountSpec::parse("/srv/data:ro").unwrap();
    assert!(mount.read_only);

    let mount = MountSpec::parse("/srv/data:/data:ro").unwrap();
    assert_eq!(mount.host_path, PathBuf::from("/srv/data"));
    assert_eq!(mount.task_path, PathBuf::from("/data"));
    assert!(mount.read_only);

    assert!(MountSpec::parse("/a:/b:rx").is_err());
  }

  #[test]
  fn parse_propagation() {
    assert_eq!("".parse::<Propagation>().unwrap(), Propagation::Private);
    assert_eq!("host-to-task".parse::<Propagation>().unwrap(), Propagation::HostToTask);
    assert_eq!("bidirectional".parse::<Propagation>().unwrap(), Propagation::Bidirectional);
    assert!("shared".parse::<Propagation>().is_err());
  }

  #[test]
  fn device_target_defaults_to_host_path() {
    let device = DeviceSpec::new("/dev/fuse");
    assert_eq!(device.target(), Path::new("/dev/fuse"));
    let device = device.task_path("/dev/myfuse");
    assert_eq!(device.target(), Path::new("/dev/myfuse"));
  }
}
