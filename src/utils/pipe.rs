use std::os::unix::prelude::{AsRawFd, RawFd};

use nix::{
  errno::Errno,
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::Result;

/// Both ends of a close-on-exec pipe, shared by parent and child across clone
#[derive(Debug, Clone, Copy)]
pub struct ExecutorPipe(RawFd, RawFd);

#[derive(Debug)]
pub struct ReadPipe(RawFd);

#[derive(Debug)]
pub struct WritePipe(RawFd);

impl ExecutorPipe {
  pub fn new() -> Result<Self> {
    let result = pipe2(OFlag::O_CLOEXEC)?;
    Ok(ExecutorPipe(result.0, result.1))
  }

  /// Keep the read end, close the write end in this process
  pub fn read(self) -> Result<ReadPipe> {
    close(self.1)?;
    Ok(ReadPipe(self.0))
  }

  /// Keep the write end, close the read end in this process
  pub fn write(self) -> Result<WritePipe> {
    close(self.0)?;
    Ok(WritePipe(self.1))
  }

  /// Close both ends, for when the pipe is no longer needed
  pub fn close(self) {
    let _ = close(self.0);
    let _ = close(self.1);
  }
}

impl ReadPipe {
  /// Block until one byte arrives. Returns false on EOF.
  pub fn wait(&self) -> Result<bool> {
    let mut buf = [0u8; 1];
    loop {
      match unistd::read(self.0, &mut buf) {
        Ok(n) => return Ok(n == 1),
        Err(Errno::EINTR) => continue,
        Err(err) => return Err(err.into()),
      }
    }
  }

  /// Read until every writer has closed its end
  pub fn read_to_end(&self) -> Result<String> {
    let bytes = self.read_bytes()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }

  pub fn read_bytes(&self) -> Result<Vec<u8>> {
    let mut text = vec![];
    let mut buf = vec![0u8; 256];
    loop {
      match unistd::read(self.0, buf.as_mut_slice()) {
        Ok(0) => break,
        Ok(n) => text.extend_from_slice(&buf[..n]),
        Err(Errno::EINTR) => continue,
        Err(err) => return Err(err.into()),
      }
    }
    Ok(text)
  }
}

impl Drop for ReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl WritePipe {
  pub fn write<S: AsRef<str>>(&self, text: S) -> Result<usize> {
    let mut bytes = text.as_ref().as_bytes();
    let mut total = 0;
    while !bytes.is_empty() {
      match unistd::write(self.0, bytes) {
        Ok(n) => {
          total += n;
          bytes = &bytes[n..];
        }
        Err(Errno::EINTR) => continue,
        Err(err) => return Err(err.into()),
      }
    }
    Ok(total)
  }

  /// Release a peer blocked in `ReadPipe::wait`
  pub fn signal(&self) -> Result<()> {
    self.write("\x01")?;
    Ok(())
  }
}

impl AsRawFd for WritePipe {
  fn as_raw_fd(&self) -> RawFd {
    self.0
  }
}

impl Drop for WritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_is_read_until_writer_closes() {
    let pipe = ExecutorPipe::new().unwrap();
    let (reader, writer) = (ReadPipe(pipe.0), WritePipe(pipe.1));
    writer.write("mount: ").unwrap();
    writer.write("permission denied").unwrap();
    drop(writer);
    assert_eq!(reader.read_to_end().unwrap(), "mount: permission denied");
  }

  #[test]
  fn wait_sees_signal_then_eof() {
    let pipe = ExecutorPipe::new().unwrap();
    let (reader, writer) = (ReadPipe(pipe.0), WritePipe(pipe.1));
    writer.signal().unwrap();
    drop(writer);
    assert!(reader.wait().unwrap());
    assert!(!reader.wait().unwrap());
  }
}
