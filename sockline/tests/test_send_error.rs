mod common;

use common::{TIMEOUT, init_tracing, wait_for};
use sockline::{EventKind, Socket, SocketEvent, SocketStatus};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

/// A failed send is reported straight away instead of waiting for the
/// receive side to notice.
#[test]
fn test_send_failure_emits_error() {
  init_tracing();
  let (ours, _peer) = UnixStream::pair().unwrap();
  let rc = unsafe { libc::shutdown(ours.as_raw_fd(), libc::SHUT_WR) };
  assert_eq!(rc, 0);

  let socket = Socket::from_fd(OwnedFd::from(ours)).unwrap();
  let events = socket.events().channel(&[
    EventKind::Error,
    EventKind::BytesWritten,
  ]);

  socket.write(b"doomed");

  match wait_for(&events, EventKind::Error) {
    SocketEvent::Error(err) => assert_eq!(err.code(), libc::EPIPE, "{err}"),
    other => unreachable!("{other:?}"),
  }
  assert_eq!(
    events.recv_timeout(TIMEOUT).unwrap(),
    SocketEvent::BytesWritten(6)
  );
  // The connection stays up until the receive side says otherwise.
  assert_eq!(socket.status(), SocketStatus::Connected);
}

#[test]
fn test_existing_descriptor_starts_connected() {
  init_tracing();
  let (ours, peer) = UnixStream::pair().unwrap();
  let socket = Socket::from_fd(OwnedFd::from(ours)).unwrap();
  let ready = socket.events().channel(&[EventKind::ReadyRead]);

  assert_eq!(socket.status(), SocketStatus::Connected);
  assert!(!socket.address().is_host_found());

  use std::io::Write;
  (&peer).write_all(b"hi").unwrap();
  let got = common::read_exact(&socket, &ready, 2);
  assert_eq!(got, b"hi");
}
