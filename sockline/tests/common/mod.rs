//! Helpers shared by the integration tests.

#![allow(dead_code)]

use crossbeam_channel::Receiver;
use sockline::{
  Address, EventKind, Service, Socket, SocketConfig, SocketEvent,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// A service listening on an ephemeral loopback port.
pub fn service() -> (Service, SocketAddr) {
  let service = Service::new("127.0.0.1:0".parse().unwrap());
  service.open().expect("Failed to open service");
  let addr = service.local_addr().unwrap();
  (service, addr)
}

/// A port nothing listens on.
pub fn closed_port() -> SocketAddr {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap()
}

/// Connects a client to `service` and returns it with the server side.
pub fn connect_with(
  service: &Service,
  addr: SocketAddr,
  config: SocketConfig,
) -> (Socket, Socket) {
  let client = Socket::from_address_with_config(
    &Address::from_socket_addr(addr),
    config,
  )
  .unwrap();
  let events = client.events().channel(&[EventKind::Connected, EventKind::Error]);
  client.open().expect("Failed to open client");

  match events.recv_timeout(TIMEOUT) {
    Ok(SocketEvent::Connected) => {}
    other => panic!("client did not connect: {other:?}"),
  }

  let server = service.accept_timeout(TIMEOUT).expect("Nothing accepted");
  (client, server)
}

pub fn connect(service: &Service, addr: SocketAddr) -> (Socket, Socket) {
  connect_with(service, addr, SocketConfig::default())
}

/// Reads until `len` bytes arrived. `ready` must be subscribed to
/// `ReadyRead` on `socket`.
pub fn read_exact(
  socket: &Socket,
  ready: &Receiver<SocketEvent>,
  len: usize,
) -> Vec<u8> {
  let deadline = Instant::now() + TIMEOUT;
  let mut data = Vec::with_capacity(len);
  loop {
    data.extend_from_slice(&socket.read_all());
    if data.len() >= len {
      return data;
    }
    let left = deadline.saturating_duration_since(Instant::now());
    if ready.recv_timeout(left).is_err() {
      panic!("timed out with {} of {len} bytes", data.len());
    }
  }
}

/// Waits for the first event of `kind`, skipping others.
pub fn wait_for(
  events: &Receiver<SocketEvent>,
  kind: EventKind,
) -> SocketEvent {
  let deadline = Instant::now() + TIMEOUT;
  loop {
    let left = deadline.saturating_duration_since(Instant::now());
    match events.recv_timeout(left) {
      Ok(event) if event.kind() == kind => return event,
      Ok(_) => continue,
      Err(_) => panic!("no {kind:?} event"),
    }
  }
}

/// A loopback listener whose accept queue is already full. The kernel drops
/// further SYNs, so connecting to it hangs until cancelled or timed out.
/// Keep the returned values alive for as long as the port should stay stuck.
#[cfg(linux)]
pub fn unresponsive_port()
-> (std::net::TcpListener, std::net::TcpStream, SocketAddr) {
  use std::os::fd::AsRawFd;

  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let ret = unsafe { libc::listen(listener.as_raw_fd(), 0) };
  assert_eq!(ret, 0, "listen: {}", std::io::Error::last_os_error());
  let addr = listener.local_addr().unwrap();
  let filler = std::net::TcpStream::connect_timeout(&addr, TIMEOUT).unwrap();
  (listener, filler, addr)
}
