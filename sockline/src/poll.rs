//! Readiness multiplexing over a handful of descriptors.
//!
//! Each socket thread waits on at most three things at once (a pipe and the
//! socket itself), so a plain `poll(2)` over a stack array is all that is
//! needed here.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Interest flags for one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
  Read,
  Write,
}

impl Interest {
  pub fn is_readable(&self) -> bool {
    matches!(self, Self::Read)
  }

  pub fn is_writable(&self) -> bool {
    matches!(self, Self::Write)
  }

  fn events(&self) -> libc::c_short {
    let mut events = 0;
    if self.is_readable() {
      events |= libc::POLLIN;
    }
    if self.is_writable() {
      events |= libc::POLLOUT;
    }
    events
  }
}

/// What a descriptor turned out to be ready for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
  pub readable: bool,
  pub writable: bool,
  /// `POLLERR`, `POLLHUP` or `POLLNVAL`.
  pub error: bool,
}

impl Readiness {
  pub fn is_ready(&self) -> bool {
    self.readable || self.writable || self.error
  }

  fn from_revents(revents: libc::c_short) -> Self {
    Self {
      readable: revents & libc::POLLIN != 0,
      writable: revents & libc::POLLOUT != 0,
      error: revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
    }
  }
}

/// Convert a timeout to poll(2) milliseconds, rounding up so a short timeout
/// never becomes a busy spin. `None` waits forever.
pub fn timeout_to_millis(timeout: Option<Duration>) -> libc::c_int {
  match timeout {
    Some(d) => {
      let ms = d.as_nanos().div_ceil(1_000_000);
      if ms > libc::c_int::MAX as u128 { libc::c_int::MAX } else { ms as libc::c_int }
    }
    None => -1,
  }
}

/// Blocks until one of `fds` is ready or `timeout` elapses.
///
/// Returns one [`Readiness`] per input descriptor, in order. A timeout yields
/// all-default readiness. Interrupted waits are resumed with the remaining
/// time.
pub fn wait<const N: usize>(
  fds: [(RawFd, Interest); N],
  timeout: Option<Duration>,
) -> io::Result<[Readiness; N]> {
  assert!(N > 0, "poll::wait needs at least one descriptor");

  let mut pollfds = fds.map(|(fd, interest)| {
    assert!(fd >= 0, "poll::wait: fd must be >= 0, got {}", fd);
    libc::pollfd { fd, events: interest.events(), revents: 0 }
  });

  // An unrepresentable deadline is as good as no deadline at all.
  let deadline = timeout.and_then(|d| Instant::now().checked_add(d));

  loop {
    let remaining =
      deadline.map(|at| at.saturating_duration_since(Instant::now()));

    match syscall!(poll(
      pollfds.as_mut_ptr(),
      N as libc::nfds_t,
      timeout_to_millis(remaining),
    )) {
      Ok(_) => break,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {
        for pfd in pollfds.iter_mut() {
          pfd.revents = 0;
        }
        continue;
      }
      Err(err) => return Err(err),
    }
  }

  Ok(pollfds.map(|pfd| Readiness::from_revents(pfd.revents)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipe::Pipe;

  #[test]
  fn test_timeout_to_millis() {
    assert_eq!(timeout_to_millis(None), -1);
    assert_eq!(timeout_to_millis(Some(Duration::ZERO)), 0);
    assert_eq!(timeout_to_millis(Some(Duration::from_millis(1500))), 1500);
    assert_eq!(timeout_to_millis(Some(Duration::from_micros(10))), 1);
    assert_eq!(
      timeout_to_millis(Some(Duration::from_secs(u64::MAX / 2))),
      libc::c_int::MAX
    );
  }

  #[test]
  fn idle_pipe_times_out() {
    let pipe = Pipe::new().unwrap();
    let started = Instant::now();

    let [ready] =
      wait([(pipe.read_fd(), Interest::Read)], Some(Duration::from_millis(50)))
        .unwrap();

    assert!(!ready.is_ready());
    assert!(started.elapsed() >= Duration::from_millis(45));
  }

  #[test]
  fn notified_pipe_is_readable() {
    let idle = Pipe::new().unwrap();
    let woken = Pipe::new().unwrap();
    woken.notify().unwrap();

    let [a, b] = wait(
      [(idle.read_fd(), Interest::Read), (woken.read_fd(), Interest::Read)],
      None,
    )
    .unwrap();

    assert!(!a.is_ready());
    assert!(b.readable);
    assert!(!b.error);
  }
}
