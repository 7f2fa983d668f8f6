//! Thread-backed TCP socket.
//!
//! A [`Socket`] owns two buffers, a status and at most two background
//! threads over its life:
//!
//! - the **connect thread** walks the resolved candidates (every IPv4 one
//!   first, then IPv6) with a non-blocking `connect` that races the connect
//!   timeout and a cancel pipe;
//! - the **I/O thread** starts once a candidate accepts. It waits for the
//!   socket to become readable or for the wake-up pipe, appends whatever
//!   arrives to the input buffer and pushes the output buffer out in chunks.
//!
//! All status changes go forward only:
//!
//! ```text
//! Initialized -> AddressLookup -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! Events are always emitted with no lock held, on whichever thread caused
//! them.

use crate::address::{Address, Candidate, Family};
use crate::audience::ListenerId;
use crate::buffer::Buffer;
use crate::config::SocketConfig;
use crate::error::{Error, SocketError};
use crate::event::{SocketEvent, SocketEvents};
use crate::pipe::Pipe;
use crate::poll::{self, Interest};
use crate::sync::{Condvar, Mutex};
use crate::sys;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace, warn};

/// Connection status. Ordered by how far the socket has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketStatus {
  Initialized,
  AddressLookup,
  Connecting,
  Connected,
  Disconnecting,
  Disconnected,
}

impl SocketStatus {
  /// `Connecting` or `Connected`.
  pub fn is_open(&self) -> bool {
    matches!(self, Self::Connecting | Self::Connected)
  }
}

struct State {
  status: SocketStatus,
  input: Buffer,
  output: Buffer,
  /// Shared with the thread currently driving the descriptor.
  fd: Option<Arc<OwnedFd>>,
  connecting: Option<JoinHandle<()>>,
  io_thread: Option<JoinHandle<()>>,
  io_thread_id: Option<ThreadId>,
}

struct Shared {
  state: Mutex<State>,
  /// Signalled when `output` empties or the status changes.
  drained: Condvar,
  events: SocketEvents,
  address: Address,
  config: SocketConfig,
  stop_connect: Pipe,
  wakeup: Pipe,
  stop_io: AtomicBool,
  lookup_listener: Mutex<Option<ListenerId>>,
}

enum Attempt {
  Connected,
  Aborted,
  Failed(SocketError),
}

#[derive(PartialEq, Eq)]
enum IoExit {
  Stopped,
  Shutdown,
}

/// A TCP connection driven by background threads.
///
/// Reads and writes only touch in-memory buffers and never block. Dropping
/// the socket closes it.
pub struct Socket {
  shared: Arc<Shared>,
}

impl Socket {
  /// Creates a socket for `host:port` and starts resolving the host.
  pub fn new(host: &str, port: u16) -> Result<Self, Error> {
    Self::with_config(host, port, SocketConfig::default())
  }

  pub fn with_config(
    host: &str,
    port: u16,
    config: SocketConfig,
  ) -> Result<Self, Error> {
    let address = Address::lookup_tcp(host, port);
    Self::build(address, config, SocketStatus::AddressLookup)
  }

  /// Creates a socket for an address that may already be resolved.
  pub fn from_address(address: &Address) -> Result<Self, Error> {
    Self::from_address_with_config(address, SocketConfig::default())
  }

  pub fn from_address_with_config(
    address: &Address,
    config: SocketConfig,
  ) -> Result<Self, Error> {
    Self::build(address.clone(), config, SocketStatus::Initialized)
  }

  /// Wraps a connected stream descriptor. The socket starts out
  /// `Connected` with its I/O thread running.
  pub fn from_fd(fd: OwnedFd) -> Result<Self, Error> {
    Self::from_fd_with_config(fd, SocketConfig::default())
  }

  pub fn from_fd_with_config(
    fd: OwnedFd,
    config: SocketConfig,
  ) -> Result<Self, Error> {
    let raw = fd.as_raw_fd();
    sys::prepare_stream(raw)?;
    sys::set_nonblocking(raw, false)?;

    let address = match sys::peer_addr(raw) {
      Ok(peer) => Address::from_socket_addr(peer),
      Err(_) => Address::from_socket_addrs(std::iter::empty()),
    };

    let socket = Self::build(address, config, SocketStatus::Initialized)?;
    {
      let shared = &socket.shared;
      let mut state = shared.state.lock();
      let fd = Arc::new(fd);
      state.fd = Some(fd.clone());
      shared.start_io_thread(&mut state, fd)?;
      shared.set_status(&mut state, SocketStatus::Connected);
    }
    Ok(socket)
  }

  pub fn from_stream(stream: TcpStream) -> Result<Self, Error> {
    Self::from_fd(OwnedFd::from(stream))
  }

  fn build(
    address: Address,
    config: SocketConfig,
    status: SocketStatus,
  ) -> Result<Self, Error> {
    let shared = Arc::new(Shared {
      state: Mutex::new(State {
        status,
        input: Buffer::new(),
        output: Buffer::new(),
        fd: None,
        connecting: None,
        io_thread: None,
        io_thread_id: None,
      }),
      drained: Condvar::new(),
      events: SocketEvents::default(),
      address,
      config,
      stop_connect: Pipe::new()?,
      wakeup: Pipe::new()?,
      stop_io: AtomicBool::new(false),
      lookup_listener: Mutex::new(None),
    });

    if shared.address.is_pending() {
      let weak = Arc::downgrade(&shared);
      let id = shared.address.on_lookup_finished(move |_| {
        if let Some(shared) = weak.upgrade() {
          shared.lookup_finished();
        }
      });
      *shared.lookup_listener.lock() = Some(id);
    }

    Ok(Self { shared })
  }

  /// Starts connecting.
  ///
  /// Returns once a connect thread is running, or once the socket is
  /// waiting for its address lookup. The outcome is reported through the
  /// `connected` or `error` event.
  pub fn open(&self) -> Result<(), Error> {
    self.shared.open()
  }

  /// Flushes pending output, stops every background thread and closes the
  /// descriptor. Calling it again does nothing.
  pub fn close(&self) {
    self.shared.close();
  }

  pub fn is_open(&self) -> bool {
    self.status().is_open()
  }

  pub fn status(&self) -> SocketStatus {
    self.shared.state.lock().status
  }

  /// Queues `data` for sending and returns how many bytes were accepted:
  /// all of them, or none once the socket is being torn down.
  pub fn write(&self, data: &[u8]) -> usize {
    let shared = &self.shared;
    let mut state = shared.state.lock();
    if state.status >= SocketStatus::Disconnecting {
      return 0;
    }
    state.output.append(data);
    if state.io_thread.is_some() {
      let _ = shared.wakeup.notify();
    }
    data.len()
  }

  /// Takes up to `max` received bytes. Never blocks.
  pub fn read(&self, max: usize) -> Bytes {
    self.shared.state.lock().input.consume(max)
  }

  /// Takes everything received so far.
  pub fn read_all(&self) -> Bytes {
    self.shared.state.lock().input.consume_all()
  }

  /// Blocks until the output buffer is empty or the socket stops being
  /// open. Returns immediately when called from the socket's I/O thread.
  pub fn flush(&self) {
    self.shared.flush();
  }

  /// Bytes queued but not yet handed to the kernel.
  pub fn bytes_to_send(&self) -> usize {
    self.shared.state.lock().output.len()
  }

  /// Bytes received but not yet read.
  pub fn received_bytes(&self) -> usize {
    self.shared.state.lock().input.len()
  }

  pub fn address(&self) -> &Address {
    &self.shared.address
  }

  pub fn events(&self) -> &SocketEvents {
    &self.shared.events
  }

  pub fn config(&self) -> &SocketConfig {
    &self.shared.config
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    self.shared.close();
  }
}

impl fmt::Debug for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Socket")
      .field("status", &self.status())
      .field("address", &self.shared.address)
      .finish()
  }
}

/// The inherent [`Socket::read`] shadows this impl on a `&Socket`
/// receiver. Call it through the trait: `io::Read::read(&mut &socket, buf)`.
impl io::Read for &Socket {
  /// `WouldBlock` while open with nothing buffered, `Ok(0)` once closed and
  /// drained.
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    let mut state = self.shared.state.lock();
    if state.input.is_empty() {
      return if state.status.is_open() {
        Err(io::ErrorKind::WouldBlock.into())
      } else {
        Ok(0)
      };
    }
    let chunk = state.input.consume(buf.len());
    buf[..chunk.len()].copy_from_slice(&chunk);
    Ok(chunk.len())
  }
}

/// The inherent [`Socket::write`] and [`Socket::flush`] shadow this impl on
/// a `&Socket` receiver. Call them through the trait, or use the provided
/// methods such as `write_all`.
impl io::Write for &Socket {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    match Socket::write(self, buf) {
      0 => Err(io::ErrorKind::NotConnected.into()),
      n => Ok(n),
    }
  }

  fn flush(&mut self) -> io::Result<()> {
    Socket::flush(self);
    Ok(())
  }
}

impl Shared {
  /// Moves the status forward. Returns `false` if `status` is not ahead of
  /// the current one.
  fn set_status(&self, state: &mut State, status: SocketStatus) -> bool {
    if status <= state.status {
      return false;
    }
    debug!(
      fd = ?state.fd.as_ref().map(|fd| fd.as_raw_fd()),
      from = ?state.status,
      to = ?status,
      "socket status changed"
    );
    state.status = status;
    self.drained.notify_all();
    true
  }

  fn status(&self) -> SocketStatus {
    self.state.lock().status
  }

  fn open(self: &Arc<Self>) -> Result<(), Error> {
    let mut state = self.state.lock();
    match state.status {
      SocketStatus::Connecting | SocketStatus::Connected => {
        Err(Error::AlreadyOpen)
      }
      SocketStatus::Disconnecting | SocketStatus::Disconnected => {
        Err(Error::Closed)
      }
      SocketStatus::Initialized | SocketStatus::AddressLookup => {
        self.open_locked(&mut state)
      }
    }
  }

  fn open_locked(self: &Arc<Self>, state: &mut State) -> Result<(), Error> {
    if self.address.is_pending() {
      // The lookup listener takes over once the address is resolved. It
      // needs this lock to look at the status, so it cannot miss the change.
      self.set_status(state, SocketStatus::Connecting);
      return Ok(());
    }
    if !self.address.is_host_found() {
      return Err(Error::NoCandidates);
    }
    if state.connecting.is_none() {
      let shared = Arc::clone(self);
      let handle = thread::Builder::new()
        .name(self.config.connect_thread_name())
        .spawn(move || shared.connect())?;
      state.connecting = Some(handle);
    }
    self.set_status(state, SocketStatus::Connecting);
    Ok(())
  }

  /// Runs on the lookup thread.
  fn lookup_finished(self: &Arc<Self>) {
    let failure = {
      let mut state = self.state.lock();
      if state.status != SocketStatus::Connecting || state.connecting.is_some()
      {
        return;
      }
      match self.open_locked(&mut state) {
        Ok(()) => return,
        Err(err) => {
          self.set_status(&mut state, SocketStatus::Disconnected);
          err
        }
      }
    };

    let error = match failure {
      Error::Io(err) => SocketError::from(err),
      _ => SocketError::LookupFailed,
    };
    warn!(address = %self.address, error = %error, "connection failed");
    self.events.emit(SocketEvent::Error(error));
    self.events.emit(SocketEvent::Disconnected);
  }

  fn connect(self: Arc<Self>) {
    let candidates = self.address.candidates();
    let mut last_error = None;

    for family in [Family::V4, Family::V6] {
      for candidate in candidates.iter().filter(|c| c.family == family) {
        debug!(
          addr = %candidate.addr,
          socket_type = candidate.socket_type,
          protocol = candidate.protocol,
          "connecting"
        );
        match self.try_candidate(candidate) {
          Attempt::Connected => return,
          Attempt::Aborted => {
            self.connect_failed(SocketError::Aborted);
            return;
          }
          Attempt::Failed(err) => {
            debug!(addr = %candidate.addr, error = %err, "candidate failed");
            last_error = Some(err);
          }
        }
      }
    }

    let error = match last_error {
      Some(err) if self.address.is_host_found() => err,
      _ => SocketError::LookupFailed,
    };
    self.connect_failed(error);
  }

  fn try_candidate(self: &Arc<Self>, candidate: &Candidate) -> Attempt {
    let fd = match sys::socket(
      candidate.family.as_raw(),
      candidate.socket_type,
      candidate.protocol,
    ) {
      Ok(fd) => Arc::new(fd),
      Err(err) => return Attempt::Failed(err.into()),
    };

    {
      let mut state = self.state.lock();
      if state.status != SocketStatus::Connecting {
        return Attempt::Aborted;
      }
      // Drops the descriptor of the previous candidate.
      state.fd = Some(fd.clone());
    }

    match self.connect_fd(fd.as_raw_fd(), candidate) {
      Ok(true) => {}
      Ok(false) => return Attempt::Aborted,
      Err(err) => return Attempt::Failed(err),
    }

    let mut state = self.state.lock();
    if state.status != SocketStatus::Connecting {
      return Attempt::Aborted;
    }
    if let Err(err) = self.start_io_thread(&mut state, fd) {
      return Attempt::Failed(err.into());
    }
    self.set_status(&mut state, SocketStatus::Connected);
    drop(state);

    debug!(addr = %candidate.addr, "connected");
    self.events.emit(SocketEvent::Connected);
    Attempt::Connected
  }

  /// `Ok(false)` means the attempt was cancelled.
  fn connect_fd(
    &self,
    fd: RawFd,
    candidate: &Candidate,
  ) -> Result<bool, SocketError> {
    sys::set_nonblocking(fd, true)?;

    match sys::connect(fd, &candidate.addr) {
      Ok(()) => {}
      Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
        let [stop, sock] = poll::wait(
          [
            (self.stop_connect.read_fd(), Interest::Read),
            (fd, Interest::Write),
          ],
          Some(self.config.connect_timeout),
        )?;
        if stop.readable {
          return Ok(false);
        }
        if !sock.is_ready() {
          return Err(SocketError::TimedOut);
        }
        if let Some(err) = sys::take_error(fd)? {
          return Err(err.into());
        }
      }
      Err(err) => return Err(err.into()),
    }

    sys::set_nonblocking(fd, false)?;
    Ok(true)
  }

  fn connect_failed(&self, error: SocketError) {
    warn!(address = %self.address, error = %error, "connection failed");
    let disconnected = {
      let mut state = self.state.lock();
      // A concurrent close owns the teardown from here on.
      if state.status == SocketStatus::Connecting {
        state.fd = None;
        self.set_status(&mut state, SocketStatus::Disconnected)
      } else {
        false
      }
    };

    self.events.emit(SocketEvent::Error(error));
    if disconnected {
      self.events.emit(SocketEvent::Disconnected);
    }
  }

  fn start_io_thread(
    self: &Arc<Self>,
    state: &mut State,
    fd: Arc<OwnedFd>,
  ) -> io::Result<()> {
    let shared = Arc::clone(self);
    let handle = thread::Builder::new()
      .name(self.config.io_thread_name())
      .spawn(move || shared.run_io(fd))?;
    state.io_thread_id = Some(handle.thread().id());
    state.io_thread = Some(handle);
    Ok(())
  }

  fn run_io(self: Arc<Self>, fd: Arc<OwnedFd>) {
    let exit = self.io_loop(fd.as_raw_fd());
    // The descriptor must be closed before `disconnected` goes out.
    drop(fd);
    if exit == IoExit::Shutdown {
      self.shutdown();
    }
  }

  fn io_loop(&self, fd: RawFd) -> IoExit {
    let mut scratch = vec![0u8; self.config.recv_chunk];

    while !self.stop_io.load(Ordering::Acquire) {
      if !self.state.lock().output.is_empty() {
        let _ = self.wakeup.notify();
      }

      let ready = poll::wait(
        [(self.wakeup.read_fd(), Interest::Read), (fd, Interest::Read)],
        None,
      );
      let [wake, sock] = match ready {
        Ok(ready) => ready,
        Err(err) => {
          warn!(fd, error = %err, "poll failed");
          return self.fatal(err);
        }
      };

      if wake.readable {
        let _ = self.wakeup.drain();
      }
      if self.stop_io.load(Ordering::Acquire) {
        break;
      }

      if sock.readable {
        match sys::recv(fd, &mut scratch) {
          Ok(0) => {
            warn!(fd, "peer closed the connection while receiving");
            return IoExit::Shutdown;
          }
          Ok(n) => {
            trace!(fd, bytes = n, "received");
            self.state.lock().input.append(&scratch[..n]);
            self.events.emit(SocketEvent::ReadyRead);
          }
          Err(err) => {
            warn!(fd, error = %err, "error when receiving");
            return self.fatal(err);
          }
        }
      } else if sock.error {
        let err = match sys::take_error(fd) {
          Ok(Some(err)) | Err(err) => err,
          Ok(None) => io::Error::from_raw_os_error(libc::ECONNRESET),
        };
        warn!(fd, error = %err, "socket error");
        return self.fatal(err);
      }

      let chunk = {
        let mut state = self.state.lock();
        if self.stop_io.load(Ordering::Acquire) || state.output.is_empty() {
          None
        } else {
          Some(state.output.consume(self.config.send_chunk))
        }
      };
      if let Some(data) = chunk {
        self.send_chunk(fd, &data);
      }
    }

    IoExit::Stopped
  }

  /// Errors only count while connected. During teardown they are expected
  /// and the thread just leaves.
  fn fatal(&self, err: io::Error) -> IoExit {
    if self.status() != SocketStatus::Connected {
      return IoExit::Stopped;
    }
    self.events.emit(SocketEvent::Error(err.into()));
    IoExit::Shutdown
  }

  fn send_chunk(&self, fd: RawFd, data: &[u8]) {
    let mut sent = 0;
    while sent < data.len() {
      match sys::send(fd, &data[sent..]) {
        Ok(n) => sent += n,
        Err(err) => {
          // The receive side notices a dead peer and shuts down; the error
          // is still reported right away.
          warn!(fd, error = %err, "error when sending");
          self.events.emit(SocketEvent::Error(err.into()));
          break;
        }
      }
    }
    trace!(fd, bytes = sent, attempted = data.len(), "sent");

    self.events.emit(SocketEvent::BytesWritten(data.len()));
    let finished = {
      let state = self.state.lock();
      let empty = state.output.is_empty();
      if empty {
        self.drained.notify_all();
      }
      empty
    };
    if finished {
      self.events.emit(SocketEvent::WriteFinished);
    }
  }

  fn flush(&self) {
    let mut state = self.state.lock();
    if state.io_thread_id == Some(thread::current().id()) {
      return;
    }
    while !state.output.is_empty() && state.status.is_open() {
      state = self.drained.wait(state);
    }
  }

  fn stop_io_thread(&self) {
    let Some(handle) = self.state.lock().io_thread.take() else {
      return;
    };
    self.stop_io.store(true, Ordering::Release);
    let _ = self.wakeup.notify();
    join(handle);
  }

  /// Closes the read side, then the descriptor, and moves to
  /// `Disconnected`. Only the first call emits `disconnected`.
  fn shutdown(&self) {
    let disconnected = {
      let mut state = self.state.lock();
      self.set_status(&mut state, SocketStatus::Disconnecting);
      if let Some(fd) = state.fd.take() {
        let _ = sys::shutdown(fd.as_raw_fd(), Shutdown::Read);
      }
      self.set_status(&mut state, SocketStatus::Disconnected)
    };
    if disconnected {
      self.events.emit(SocketEvent::Disconnected);
    }
  }

  fn close(&self) {
    if let Some(id) = self.lookup_listener.lock().take() {
      self.address.remove_lookup_listener(id);
    }

    let connecting = {
      let mut state = self.state.lock();
      // Output drains and the status leaves `Connected` under one lock.
      if state.io_thread_id != Some(thread::current().id()) {
        while state.status == SocketStatus::Connected && !state.output.is_empty()
        {
          state = self.drained.wait(state);
        }
      }
      let status = state.status;
      match status {
        SocketStatus::Disconnecting | SocketStatus::Disconnected => {
          let connecting = state.connecting.take();
          drop(state);
          if let Some(handle) = connecting {
            join(handle);
          }
          self.stop_io_thread();
          return;
        }
        SocketStatus::Connecting => {
          let _ = self.stop_connect.notify();
          if let Some(fd) = &state.fd {
            let _ = sys::shutdown(fd.as_raw_fd(), Shutdown::Write);
          }
        }
        _ => {}
      }
      self.set_status(&mut state, SocketStatus::Disconnecting);
      state.connecting.take()
    };

    if let Some(handle) = connecting {
      join(handle);
    }
    self.stop_io_thread();
    self.shutdown();
  }
}

/// Joins `handle` unless it is the calling thread, which is left to finish
/// on its own.
fn join(handle: JoinHandle<()>) {
  if handle.thread().id() == thread::current().id() {
    return;
  }
  if handle.join().is_err() {
    warn!("socket thread panicked");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::EventKind;
  use std::time::Duration;

  #[test]
  fn status_order_follows_lifecycle() {
    assert!(SocketStatus::Initialized < SocketStatus::AddressLookup);
    assert!(SocketStatus::AddressLookup < SocketStatus::Connecting);
    assert!(SocketStatus::Connected < SocketStatus::Disconnecting);
    assert!(SocketStatus::Disconnecting < SocketStatus::Disconnected);
    assert!(SocketStatus::Connecting.is_open());
    assert!(!SocketStatus::Disconnecting.is_open());
  }

  #[test]
  fn host_socket_starts_in_lookup() {
    let socket = Socket::new("127.0.0.1", 9).unwrap();
    assert_eq!(socket.status(), SocketStatus::AddressLookup);
    assert!(!socket.is_open());
  }

  #[test]
  fn writes_are_queued_before_open() {
    let address = Address::from_socket_addr("127.0.0.1:9".parse().unwrap());
    let socket = Socket::from_address(&address).unwrap();

    assert_eq!(socket.write(b"hello"), 5);
    assert_eq!(socket.bytes_to_send(), 5);
    assert_eq!(socket.received_bytes(), 0);
    assert!(socket.read(10).is_empty());
    // Not open, so flushing has nothing to wait for.
    socket.flush();
  }

  #[test]
  fn open_without_candidates_fails() {
    let address = Address::from_socket_addrs(std::iter::empty());
    let socket = Socket::from_address(&address).unwrap();

    assert!(matches!(socket.open(), Err(Error::NoCandidates)));
    assert_eq!(socket.status(), SocketStatus::Initialized);
  }

  #[test]
  fn closed_socket_cannot_reopen() {
    let address = Address::from_socket_addr("127.0.0.1:9".parse().unwrap());
    let socket = Socket::from_address(&address).unwrap();
    let events = socket.events().channel(&[EventKind::Disconnected]);

    socket.close();
    socket.close();

    assert_eq!(socket.status(), SocketStatus::Disconnected);
    assert!(matches!(socket.open(), Err(Error::Closed)));
    assert_eq!(socket.write(b"late"), 0);
    assert_eq!(events.try_iter().count(), 1);
  }

  #[test]
  fn io_read_reports_would_block_and_eof() {
    use std::os::unix::net::UnixStream;

    let (ours, peer) = UnixStream::pair().unwrap();
    let socket = Socket::from_fd(OwnedFd::from(ours)).unwrap();
    let mut buf = [0u8; 8];

    let err = io::Read::read(&mut &socket, &mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

    drop(peer);
    let events = socket.events().channel(&[EventKind::Disconnected]);
    if socket.status() != SocketStatus::Disconnected {
      events.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(io::Read::read(&mut &socket, &mut buf).unwrap(), 0);
  }
}
