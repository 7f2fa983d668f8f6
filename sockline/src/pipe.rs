//! Wake-up pipe for interrupting a blocked readiness wait.
//!
//! The pipe never carries data. A byte written to the write end makes the
//! read end readable, which is enough to kick a thread out of
//! [`poll::wait`](crate::poll::wait). Both ends are non-blocking, so a full
//! pipe simply means a wake-up is already pending.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct Pipe {
  /// Read end of the pipe
  read_fd: OwnedFd,
  /// Write end of the pipe
  write_fd: OwnedFd,
}

impl Pipe {
  #[cfg(linux)]
  pub fn new() -> io::Result<Self> {
    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  #[cfg(not(linux))]
  pub fn new() -> io::Result<Self> {
    let mut fds = [0i32; 2];
    syscall!(pipe(fds.as_mut_ptr()))?;

    let pipe = Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    };

    for fd in [pipe.read_fd.as_raw_fd(), pipe.write_fd.as_raw_fd()] {
      let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
      syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
      let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
      syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    }

    Ok(pipe)
  }

  /// Descriptor to wait on for readability.
  pub fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  /// Writes a single byte. A full pipe already guarantees the reader will
  /// wake, so `WouldBlock` counts as success.
  pub fn write_byte(&self, value: u8) -> io::Result<()> {
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &value as *const u8 as *const libc::c_void,
      1,
    ));

    match result {
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Trigger a notification
  pub fn notify(&self) -> io::Result<()> {
    self.write_byte(0)
  }

  /// Reads one pending byte, if any.
  #[cfg(test)]
  pub fn read_byte(&self) -> io::Result<Option<u8>> {
    let mut value = 0u8;
    match syscall!(read(
      self.read_fd.as_raw_fd(),
      &mut value as *mut u8 as *mut libc::c_void,
      1,
    )) {
      Ok(0) => Ok(None),
      Ok(_) => Ok(Some(value)),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(err) => Err(err),
    }
  }

  /// Consumes every pending byte and returns how many there were.
  pub fn drain(&self) -> io::Result<usize> {
    let mut scratch = [0u8; 64];
    let mut total = 0;
    loop {
      match syscall!(read(
        self.read_fd.as_raw_fd(),
        scratch.as_mut_ptr() as *mut libc::c_void,
        scratch.len(),
      )) {
        Ok(0) => return Ok(total),
        Ok(n) => total += n as usize,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          return Ok(total);
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(err),
      }
    }
  }
}

impl std::fmt::Debug for Pipe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pipe")
      .field("read_fd", &self.read_fd.as_raw_fd())
      .field("write_fd", &self.write_fd.as_raw_fd())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_pipe_reads_nothing() {
    let pipe = Pipe::new().unwrap();
    assert_eq!(pipe.read_byte().unwrap(), None);
    assert_eq!(pipe.drain().unwrap(), 0);
  }

  #[test]
  fn byte_round_trip() {
    let pipe = Pipe::new().unwrap();
    pipe.write_byte(7).unwrap();
    assert_eq!(pipe.read_byte().unwrap(), Some(7));
    assert_eq!(pipe.read_byte().unwrap(), None);
  }

  #[test]
  fn drain_collects_every_notification() {
    let pipe = Pipe::new().unwrap();
    for _ in 0..5 {
      pipe.notify().unwrap();
    }
    assert_eq!(pipe.drain().unwrap(), 5);
    assert_eq!(pipe.drain().unwrap(), 0);
  }

  #[test]
  fn notify_on_full_pipe_is_not_an_error() {
    let pipe = Pipe::new().unwrap();
    // Far beyond any default pipe capacity.
    for _ in 0..200_000 {
      pipe.notify().unwrap();
    }
    assert!(pipe.drain().unwrap() > 0);
  }
}
