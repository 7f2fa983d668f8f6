//! Listening TCP service.
//!
//! A [`Service`] binds a listening socket and runs one accept thread, which
//! waits on the listener and a stop pipe. Every accepted connection becomes
//! a connected [`Socket`] and is handed out through [`Service::incoming`].

use crate::config::SocketConfig;
use crate::error::Error;
use crate::pipe::Pipe;
use crate::poll::{self, Interest};
use crate::socket::Socket;
use crate::sync::Mutex;
use crate::sys;
use crossbeam_channel::{Receiver, Sender};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const BACKLOG: i32 = 10;

struct Running {
  local_addr: SocketAddr,
  stop: Arc<Pipe>,
  thread: JoinHandle<()>,
}

pub struct Service {
  addr: SocketAddr,
  config: SocketConfig,
  running: Mutex<Option<Running>>,
  tx: Sender<Socket>,
  rx: Receiver<Socket>,
}

impl Service {
  /// A closed service that will listen on `addr`. Port `0` picks a free
  /// port at [`Service::open`].
  pub fn new(addr: SocketAddr) -> Self {
    Self::with_config(addr, SocketConfig::default())
  }

  /// Accepted sockets are created with `config`.
  pub fn with_config(addr: SocketAddr, config: SocketConfig) -> Self {
    let (tx, rx) = crossbeam_channel::unbounded();
    Self { addr, config, running: Mutex::new(None), tx, rx }
  }

  /// Binds, listens and starts the accept thread.
  pub fn open(&self) -> Result<(), Error> {
    let mut running = self.running.lock();
    if running.is_some() {
      return Err(Error::AlreadyOpen);
    }

    let listener = listen(&self.addr).inspect_err(|err| {
      warn!(addr = %self.addr, error = %err, "failed to open service");
    })?;
    let local_addr = sys::local_addr(listener.as_raw_fd())?;
    let stop = Arc::new(Pipe::new()?);

    let accept = Accept {
      listener,
      stop: stop.clone(),
      config: self.config.clone(),
      tx: self.tx.clone(),
    };
    let thread = thread::Builder::new()
      .name(format!("{}-accept", self.config.thread_name))
      .spawn(move || accept.run())?;

    debug!(addr = %local_addr, "service listening");
    *running = Some(Running { local_addr, stop, thread });
    Ok(())
  }

  /// Stops accepting and closes the listener. Sockets already accepted are
  /// not affected.
  pub fn close(&self) {
    let Some(running) = self.running.lock().take() else {
      return;
    };
    let _ = running.stop.notify();
    if running.thread.join().is_err() {
      warn!("accept thread panicked");
    }
    debug!(addr = %running.local_addr, "service closed");
  }

  pub fn is_open(&self) -> bool {
    self.running.lock().is_some()
  }

  /// The bound address while open.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.running.lock().as_ref().map(|r| r.local_addr)
  }

  /// Accepted connections, in order.
  pub fn incoming(&self) -> Receiver<Socket> {
    self.rx.clone()
  }

  /// Waits up to `timeout` for the next accepted connection.
  pub fn accept_timeout(&self, timeout: Duration) -> Option<Socket> {
    self.rx.recv_timeout(timeout).ok()
  }
}

impl Drop for Service {
  fn drop(&mut self) {
    self.close();
  }
}

fn listen(addr: &SocketAddr) -> std::io::Result<OwnedFd> {
  let family = match addr {
    SocketAddr::V4(_) => libc::AF_INET,
    SocketAddr::V6(_) => libc::AF_INET6,
  };
  let fd = sys::socket(family, libc::SOCK_STREAM, libc::IPPROTO_TCP)?;
  let raw = fd.as_raw_fd();
  sys::set_reuse_addr(raw)?;
  sys::bind(raw, addr)?;
  sys::listen(raw, BACKLOG)?;
  // A client that gives up between poll and accept must not stall the loop.
  sys::set_nonblocking(raw, true)?;
  Ok(fd)
}

struct Accept {
  listener: OwnedFd,
  stop: Arc<Pipe>,
  config: SocketConfig,
  tx: Sender<Socket>,
}

impl Accept {
  fn run(self) {
    let fd = self.listener.as_raw_fd();
    loop {
      let ready = poll::wait(
        [(self.stop.read_fd(), Interest::Read), (fd, Interest::Read)],
        None,
      );
      let [stop, listener] = match ready {
        Ok(ready) => ready,
        Err(err) => {
          warn!(error = %err, "poll failed on listener");
          break;
        }
      };
      if stop.readable {
        break;
      }
      if !listener.readable {
        continue;
      }

      let (incoming, peer) = match sys::accept(fd) {
        Ok(accepted) => accepted,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
        Err(err) => {
          warn!(error = %err, "error on accept");
          break;
        }
      };

      debug!(%peer, "accepted connection");
      match Socket::from_fd_with_config(incoming, self.config.clone()) {
        Ok(socket) => {
          // Nobody listening any more; the socket closes on drop.
          let _ = self.tx.send(socket);
        }
        Err(err) => warn!(%peer, error = %err, "failed to wrap connection"),
      }
    }
  }
}
