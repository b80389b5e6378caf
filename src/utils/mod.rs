use std::env;
use std::ffi::CString;
use std::path::Path;
use std::thread;
use std::time::Duration;

use flexi_logger::DeferredNow;
use log::{info, warn, Record};

use crate::error::{ExecutorError, Result};

pub use pipe::{ExecutorPipe, ReadPipe, WritePipe};

pub mod mount;
pub mod pipe;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from conf.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> std::result::Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string(string: &str) -> Result<CString> {
  CString::new(string).map_err(|_| ExecutorError::spec(format!("{:?} contains a NUL byte", string)))
}

pub(crate) fn path_c_string(path: &Path) -> Result<CString> {
  match path.to_str() {
    Some(text) => into_c_string(text),
    None => Err(ExecutorError::spec(format!("{:?} is not valid UTF-8", path))),
  }
}

/// Parse `KEY=VALUE`, or a bare `KEY` read from the current environment
pub(crate) fn parse_env(text: String) -> Result<(String, String)> {
  match text.split_once('=') {
    Some((key, _)) if key.is_empty() => Err(ExecutorError::spec(format!(
      "wrong environment variable string ({}) format",
      text
    ))),
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None => {
      let value = env::var(&text).unwrap_or_default();
      info!("Read environment variable {} = {}", text, value);
      Ok((text, value))
    }
  }
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures
pub(crate) fn retry<T, E: std::fmt::Display, F: FnMut() -> std::result::Result<T, E>>(
  what: &str,
  attempts: u32,
  delay: Duration,
  mut op: F,
) -> std::result::Result<T, E> {
  let mut attempt = 1;
  loop {
    match op() {
      Ok(value) => return Ok(value),
      Err(err) if attempt < attempts => {
        warn!("{} fails (attempt {}/{}): {}", what, attempt, attempts, err);
        attempt += 1;
        thread::sleep(delay);
      }
      Err(err) => return Err(err),
    }
  }
}
