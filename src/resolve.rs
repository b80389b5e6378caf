use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::error::{ExecutorError, Result};
use crate::task::{Environment, LaunchSpec, MountSpec};

pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Where an executable lives, seen from inside and outside the task root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
  /// Path the task execs after chroot
  pub confined: PathBuf,
  /// Same file on the host
  pub host: PathBuf,
}

/// Lexically clean `path` as if rooted at `/`: drop `.` and empty parts,
/// resolve `..` without ever climbing above the root.
pub fn clean_rooted(path: &Path) -> PathBuf {
  let mut cleaned = PathBuf::from("/");
  for component in path.components() {
    match component {
      Component::Normal(part) => cleaned.push(part),
      Component::ParentDir => {
        cleaned.pop();
      }
      Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
    }
  }
  cleaned
}

/// True iff `path` is `base` or below it, compared component by component
pub fn inside_base(base: &Path, path: &Path) -> bool {
  if base.is_absolute() && path.is_absolute() {
    clean_rooted(path).starts_with(clean_rooted(base))
  } else {
    path.starts_with(base)
  }
}

/// Absolute directories of the task's `PATH`, in declared order
pub fn search_path(env: &Environment) -> Vec<PathBuf> {
  env
    .get("PATH")
    .unwrap_or(DEFAULT_PATH)
    .split(':')
    .filter(|dir| dir.starts_with('/'))
    .map(PathBuf::from)
    .collect()
}

/// Resolve the task command to a file inside the task root or a declared mount.
///
/// Absolute paths are looked up inside the confinement only. Bare names are
/// searched on the task's `PATH` first. Relative paths and bare names then
/// fall back to `<task>/local` and the task root itself.
pub fn resolve_executable(spec: &LaunchSpec, requested: &str) -> Result<ResolvedExecutable> {
  let not_found = || ExecutorError::ExecutableNotFound {
    path: requested.to_string(),
    root: spec.task_dir().display().to_string(),
  };
  if requested.is_empty() {
    return Err(not_found());
  }

  let path = Path::new(requested);
  if path.is_absolute() {
    return lookup_confined(spec, &clean_rooted(path), false).ok_or_else(not_found);
  }

  if !requested.contains('/') {
    for dir in search_path(spec.env()) {
      let confined = clean_rooted(&dir.join(path));
      if let Some(found) = lookup_confined(spec, &confined, true) {
        return Ok(found);
      }
    }
  }

  for prefix in ["/local", "/"] {
    let prefix = Path::new(prefix);
    let confined = clean_rooted(&prefix.join(path));
    if !inside_base(prefix, &confined) {
      continue;
    }
    if let Some(found) = lookup_in_base(spec.task_dir(), &confined, Path::new("/"), false) {
      return Ok(found);
    }
  }

  Err(not_found())
}

/// Map a cleaned confined path onto the host through the mounts or the task root
fn lookup_confined(spec: &LaunchSpec, confined: &Path, need_exec: bool) -> Option<ResolvedExecutable> {
  match covering_mount(spec.mounts(), confined) {
    Some(mount) => lookup_in_base(&mount.host_path, confined, &clean_rooted(&mount.task_path), need_exec),
    None => lookup_in_base(spec.task_dir(), confined, Path::new("/"), need_exec),
  }
}

/// The most specific mount whose task path contains `confined`
fn covering_mount<'a>(mounts: &'a [MountSpec], confined: &Path) -> Option<&'a MountSpec> {
  mounts
    .iter()
    .filter(|mount| inside_base(&mount.task_path, confined))
    .max_by_key(|mount| clean_rooted(&mount.task_path).components().count())
}

fn lookup_in_base(base: &Path, confined: &Path, mount_point: &Path, need_exec: bool) -> Option<ResolvedExecutable> {
  let suffix = confined.strip_prefix(mount_point).ok()?;
  let host = if suffix.as_os_str().is_empty() {
    base.to_path_buf()
  } else {
    base.join(suffix)
  };

  let metadata = fs::metadata(&host).ok()?;
  if !metadata.is_file() {
    return None;
  }
  if need_exec && metadata.permissions().mode() & 0o111 == 0 {
    return None;
  }

  // symlinks must not lead out of the base
  let real_base = fs::canonicalize(base).ok()?;
  let real_host = fs::canonicalize(&host).ok()?;
  if !inside_base(&real_base, &real_host) {
    debug!("Reject {:?}, it resolves to {:?} outside {:?}", host, real_host, real_base);
    return None;
  }

  debug!("Resolved executable {:?} -> {:?}", confined, host);
  Some(ResolvedExecutable {
    confined: confined.to_path_buf(),
    host,
  })
}

/// Add read and execute bits for everyone, keeping the other bits
pub fn make_executable(host: &Path) -> Result<()> {
  let metadata = fs::metadata(host)?;
  let mode = metadata.permissions().mode();
  if mode & 0o555 != 0o555 {
    debug!("Make {:?} executable ({:o} -> {:o})", host, mode & 0o7777, (mode | 0o555) & 0o7777);
    fs::set_permissions(host, fs::Permissions::from_mode((mode | 0o555) & 0o7777))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::os::unix::fs::symlink;

  use tempfile::{tempdir, TempDir};

  use super::*;

  struct Fixture {
    task: TempDir,
    mount: TempDir,
  }

  impl Fixture {
    fn new() -> Self {
      let task = tempdir().unwrap();
      let mount = tempdir().unwrap();
      for dir in ["foo", "local/foo", "usr/local/bin", "bin"] {
        fs::create_dir_all(task.path().join(dir)).unwrap();
      }
      fs::create_dir_all(mount.path().join("bar")).unwrap();

      let write = |path: PathBuf| {
        fs::write(&path, "hello").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).unwrap();
      };
      write(task.path().join("usr/local/bin/tmp0.txt"));
      write(task.path().join("foo/tmp1.txt"));
      write(task.path().join("local/tmp2.txt"));
      write(task.path().join("local/foo/tmp3.txt"));
      write(mount.path().join("tmp4.txt"));
      write(mount.path().join("bar/tmp5.txt"));
      Fixture { task, mount }
    }

    fn spec(&self) -> LaunchSpec {
      LaunchSpec::builder("alloc", "task", "unused")
        .task_dir(self.task.path())
        .mount(MountSpec::new(self.mount.path(), "/srv"))
        .build()
        .unwrap()
    }

    fn resolve(&self, cmd: &str) -> Result<ResolvedExecutable> {
      resolve_executable(&self.spec(), cmd)
    }
  }

  #[test]
  fn lookup_in_task_dir() {
    let fixture = Fixture::new();
    let task = fixture.task.path();
    let cases = [
      ("tmp0.txt", "/usr/local/bin/tmp0.txt", "usr/local/bin/tmp0.txt"),
      ("/foo/tmp1.txt", "/foo/tmp1.txt", "foo/tmp1.txt"),
      ("/local/tmp2.txt", "/local/tmp2.txt", "local/tmp2.txt"),
      ("local/tmp2.txt", "/local/tmp2.txt", "local/tmp2.txt"),
      ("tmp2.txt", "/local/tmp2.txt", "local/tmp2.txt"),
      ("foo/tmp3.txt", "/local/foo/tmp3.txt", "local/foo/tmp3.txt"),
      ("/local/foo/tmp3.txt", "/local/foo/tmp3.txt", "local/foo/tmp3.txt"),
    ];
    for (cmd, confined, host) in cases {
      let found = fixture.resolve(cmd).unwrap();
      assert_eq!(found.confined, PathBuf::from(confined), "{}", cmd);
      assert_eq!(found.host, task.join(host), "{}", cmd);
    }
  }

  #[test]
  fn lookup_in_mount() {
    let fixture = Fixture::new();
    let found = fixture.resolve("/srv/tmp4.txt").unwrap();
    assert_eq!(found.confined, PathBuf::from("/srv/tmp4.txt"));
    assert_eq!(found.host, fixture.mount.path().join("tmp4.txt"));

    let found = fixture.resolve("/srv/bar/tmp5.txt").unwrap();
    assert_eq!(found.host, fixture.mount.path().join("bar/tmp5.txt"));
  }

  #[test]
  fn bare_name_does_not_search_mounts() {
    let fixture = Fixture::new();
    let err = fixture.resolve("tmp4.txt").unwrap_err();
    assert!(err.to_string().starts_with("file tmp4.txt not found under path"));
  }

  #[test]
  fn host_path_outside_task_dir_is_rejected() {
    let fixture = Fixture::new();
    let err = fixture.resolve("/bin/sh").unwrap_err();
    assert_eq!(
      err.to_string(),
      format!("file /bin/sh not found under path {}", fixture.task.path().display())
    );
  }

  #[test]
  fn dot_dot_cannot_climb_out() {
    let fixture = Fixture::new();
    assert!(fixture.resolve("/../../bin/sh").is_err());
    let found = fixture.resolve("/foo/../foo/./tmp1.txt").unwrap();
    assert_eq!(found.confined, PathBuf::from("/foo/tmp1.txt"));
  }

  #[test]
  fn escaping_symlink_is_rejected() {
    let fixture = Fixture::new();
    symlink("/bin/sh", fixture.task.path().join("bin/evil")).unwrap();
    assert!(fixture.resolve("/bin/evil").is_err());

    symlink("../foo/tmp1.txt", fixture.task.path().join("bin/good")).unwrap();
    let found = fixture.resolve("/bin/good").unwrap();
    assert_eq!(found.host, fixture.task.path().join("bin/good"));
  }

  #[test]
  fn path_order_is_respected() {
    let fixture = Fixture::new();
    let first = fixture.task.path().join("first");
    fs::create_dir_all(&first).unwrap();
    fs::write(first.join("tmp0.txt"), "x").unwrap();
    fs::set_permissions(first.join("tmp0.txt"), fs::Permissions::from_mode(0o755)).unwrap();

    let spec = LaunchSpec::builder("alloc", "task", "tmp0.txt")
      .task_dir(fixture.task.path())
      .env("PATH", "relative:/first:/usr/local/bin")
      .build()
      .unwrap();
    let found = resolve_executable(&spec, "tmp0.txt").unwrap();
    assert_eq!(found.confined, PathBuf::from("/first/tmp0.txt"));
  }

  #[test]
  fn path_search_skips_non_executables() {
    let fixture = Fixture::new();
    let file = fixture.task.path().join("usr/local/bin/plain");
    fs::write(&file, "x").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(fixture.resolve("plain").is_err());
  }

  #[test]
  fn inside_base_is_component_wise() {
    assert!(inside_base(Path::new("/usr/bin"), Path::new("/usr/bin")));
    assert!(inside_base(Path::new("/usr/bin"), Path::new("/usr/bin/ls")));
    assert!(inside_base(Path::new("/usr/bin/"), Path::new("/usr/bin/ls")));
    assert!(!inside_base(Path::new("/usr/bin"), Path::new("/usr/bin2")));
    assert!(!inside_base(Path::new("/usr/bin"), Path::new("/usr")));
    assert!(!inside_base(Path::new("/usr/bin"), Path::new("/usr/bin/../lib")));
  }

  #[test]
  fn clean_rooted_never_leaves_root() {
    assert_eq!(clean_rooted(Path::new("/../..//etc/./passwd")), PathBuf::from("/etc/passwd"));
    assert_eq!(clean_rooted(Path::new("a/b/../c")), PathBuf::from("/a/c"));
    assert_eq!(clean_rooted(Path::new("..")), PathBuf::from("/"));
  }

  #[test]
  fn make_executable_adds_bits() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("bin");
    fs::write(&file, "x").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
    make_executable(&file).unwrap();
    assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o755);
    assert!(make_executable(&dir.path().join("missing")).is_err());
  }
}
