pub use capabilities::{calculate, CapabilitySet};
pub use cgroup::{cgroup_name, CpuUsage, MemoryUsage, ResourceUsage, TaskCgroup};
pub use config::{ExecutorConfig, HostCpu};
pub use error::{ExecutorError, ExecutorExit, LaunchStage, Result};
pub use namespace::{compose_namespaces, IsolationMode, NamespaceKind, NamespaceSet};
pub use resolve::{inside_base, make_executable, resolve_executable, ResolvedExecutable};
pub use supervisor::{CancelHandle, Executor, ExitState, ProcessHandle, ProcessState, WaitContext};
pub use task::{
  CapabilityRequest, DeviceSpec, Environment, LaunchSpec, LaunchSpecBuilder, MountSpec, ProcessIo,
  Propagation, Resources, TaskUser,
};
pub use translate::{translate, BindMount, CgroupSpec, DeviceKind, DeviceRule, Translation};

pub mod capabilities;
pub mod cgroup;
mod config;
mod error;
pub mod namespace;
pub mod resolve;
mod supervisor;
mod task;
pub mod translate;
pub mod utils;
