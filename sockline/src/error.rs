//! Error types.
//!
//! [`Error`] is returned by calls that fail synchronously on the caller's
//! thread. [`SocketError`] is what background threads report through the
//! `error` event, since nothing on those threads can return to the caller.

use std::io;

/// Synchronous failure of a socket or service operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// `open` was called on a socket that is already connecting or connected.
  #[error("socket is already open")]
  AlreadyOpen,

  /// The socket has been closed and cannot be reused.
  #[error("socket is closed and cannot be reopened")]
  Closed,

  /// The resolved address has no candidate to connect to.
  #[error("address has no usable candidates")]
  NoCandidates,

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Failure reported asynchronously through [`SocketEvent::Error`].
///
/// [`SocketEvent::Error`]: crate::SocketEvent::Error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
  /// The host name could not be resolved to any address.
  #[error("Failed to look up hostname")]
  LookupFailed,

  /// An in-flight connect was cancelled by `close`.
  #[error("Connection aborted")]
  Aborted,

  /// The last candidate did not answer within the connect timeout.
  #[error("Connection timed out")]
  TimedOut,

  #[error("{message}")]
  Os { code: i32, message: String },
}

impl SocketError {
  /// Categorical integer code, matching `errno` where one exists.
  pub fn code(&self) -> i32 {
    match self {
      Self::LookupFailed => -1,
      Self::Aborted => libc::ECONNABORTED,
      Self::TimedOut => libc::ETIMEDOUT,
      Self::Os { code, .. } => *code,
    }
  }

  /// Human-readable message.
  pub fn message(&self) -> String {
    self.to_string()
  }
}

impl From<io::Error> for SocketError {
  fn from(err: io::Error) -> Self {
    match err.raw_os_error() {
      Some(code) if code == libc::ECONNABORTED => Self::Aborted,
      Some(code) if code == libc::ETIMEDOUT => Self::TimedOut,
      Some(code) => Self::Os { code, message: err.to_string() },
      // Synthetic errors carry no errno; EIO is the closest fit.
      None => Self::Os { code: libc::EIO, message: err.to_string() },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codes_match_errno() {
    assert_eq!(SocketError::LookupFailed.code(), -1);
    assert_eq!(SocketError::Aborted.code(), libc::ECONNABORTED);
    assert_eq!(SocketError::TimedOut.code(), libc::ETIMEDOUT);
  }

  #[test]
  fn io_error_keeps_errno_and_message() {
    let err: SocketError =
      io::Error::from_raw_os_error(libc::ECONNREFUSED).into();

    assert_eq!(err.code(), libc::ECONNREFUSED);
    assert_eq!(
      err.message(),
      io::Error::from_raw_os_error(libc::ECONNREFUSED).to_string()
    );
  }

  #[test]
  fn well_known_errno_maps_to_variant() {
    let aborted: SocketError =
      io::Error::from_raw_os_error(libc::ECONNABORTED).into();
    let timed_out: SocketError =
      io::Error::from_raw_os_error(libc::ETIMEDOUT).into();

    assert_eq!(aborted, SocketError::Aborted);
    assert_eq!(timed_out, SocketError::TimedOut);
  }

  #[test]
  fn synthetic_io_error_gets_eio() {
    let err: SocketError = io::Error::other("boom").into();
    assert_eq!(err.code(), libc::EIO);
    assert_eq!(err.message(), "boom");
  }
}
