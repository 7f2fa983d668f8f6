//! Shared, asynchronously resolved network addresses.
//!
//! Host names are resolved on one process-wide lookup thread fed through a
//! channel, so a slow resolver never blocks the caller. Numeric hosts skip
//! the queue and are resolved on the spot. An [`Address`] is a cheap clonable
//! handle; every clone observes the same lookup.

use crate::audience::{Audience, ListenerId};
use crate::sync::{Condvar, Mutex};
use crate::sys;
use crossbeam_channel::Sender;
use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use std::{mem, ptr};
use tracing::{debug, warn};

/// Address family of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
  V4,
  V6,
}

impl Family {
  pub fn as_raw(&self) -> libc::c_int {
    match self {
      Self::V4 => libc::AF_INET,
      Self::V6 => libc::AF_INET6,
    }
  }
}

impl From<&SocketAddr> for Family {
  fn from(addr: &SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(_) => Self::V4,
      SocketAddr::V6(_) => Self::V6,
    }
  }
}

/// One resolved way of reaching a host: everything `socket(2)` and
/// `connect(2)` need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
  pub family: Family,
  pub socket_type: libc::c_int,
  pub protocol: libc::c_int,
  pub addr: SocketAddr,
}

impl Candidate {
  /// A TCP candidate for `addr`.
  pub fn tcp(addr: SocketAddr) -> Self {
    Self {
      family: Family::from(&addr),
      socket_type: libc::SOCK_STREAM,
      protocol: libc::IPPROTO_TCP,
      addr,
    }
  }
}

#[derive(Default)]
struct Lookup {
  pending: bool,
  candidates: Vec<Candidate>,
}

struct Inner {
  host: String,
  port: u16,
  lookup: Mutex<Lookup>,
  finished: Condvar,
  lookup_finished: Audience<Address>,
}

/// A host/port pair and the candidates it resolved to.
#[derive(Clone)]
pub struct Address {
  inner: Arc<Inner>,
}

impl Address {
  fn with_state(host: String, port: u16, lookup: Lookup) -> Self {
    Self {
      inner: Arc::new(Inner {
        host,
        port,
        lookup: Mutex::new(lookup),
        finished: Condvar::new(),
        lookup_finished: Audience::new(),
      }),
    }
  }

  /// Starts resolving `host` for TCP on `port`.
  ///
  /// Returns immediately. Numeric hosts are resolved before this returns;
  /// anything else is queued on the lookup thread. An empty host resolves to
  /// the wildcard addresses.
  pub fn lookup_tcp(host: &str, port: u16) -> Self {
    let address = Self::with_state(
      host.to_owned(),
      port,
      Lookup { pending: true, candidates: Vec::new() },
    );

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
      address.finish(vec![Candidate::tcp(SocketAddr::new(ip, port))]);
      return address;
    }

    match lookup_queue() {
      Some(queue) if queue.send(address.clone()).is_ok() => {}
      _ => {
        warn!(host, "lookup thread unavailable");
        address.finish(Vec::new());
      }
    }
    address
  }

  /// A resolved address with a single TCP candidate.
  pub fn from_socket_addr(addr: SocketAddr) -> Self {
    Self::from_socket_addrs([addr])
  }

  /// A resolved address whose candidates are `addrs`, in order.
  pub fn from_socket_addrs<I>(addrs: I) -> Self
  where
    I: IntoIterator<Item = SocketAddr>,
  {
    let candidates: Vec<_> = addrs.into_iter().map(Candidate::tcp).collect();
    let port = candidates.first().map_or(0, |c| c.addr.port());
    Self::with_state(String::new(), port, Lookup { pending: false, candidates })
  }

  pub fn is_pending(&self) -> bool {
    self.inner.lookup.lock().pending
  }

  /// The lookup has finished, whatever its outcome.
  pub fn is_valid(&self) -> bool {
    !self.is_pending()
  }

  /// The lookup has finished with at least one candidate.
  pub fn is_host_found(&self) -> bool {
    let lookup = self.inner.lookup.lock();
    !lookup.pending && !lookup.candidates.is_empty()
  }

  /// Zero while the lookup is pending.
  pub fn candidate_count(&self) -> usize {
    self.inner.lookup.lock().candidates.len()
  }

  /// The `index`th candidate of `family`.
  pub fn candidate(&self, family: Family, index: usize) -> Option<Candidate> {
    self
      .inner
      .lookup
      .lock()
      .candidates
      .iter()
      .filter(|c| c.family == family)
      .nth(index)
      .copied()
  }

  pub fn candidates(&self) -> Vec<Candidate> {
    self.inner.lookup.lock().candidates.clone()
  }

  /// The host this address was looked up with, or the numeric form of the
  /// first candidate when it was built from socket addresses.
  pub fn host_name(&self) -> String {
    if !self.inner.host.is_empty() {
      return self.inner.host.clone();
    }
    let lookup = self.inner.lookup.lock();
    lookup.candidates.first().map(|c| c.addr.ip().to_string()).unwrap_or_default()
  }

  pub fn port(&self) -> u16 {
    let lookup = self.inner.lookup.lock();
    lookup.candidates.first().map_or(self.inner.port, |c| c.addr.port())
  }

  /// Blocks until the lookup has finished.
  pub fn wait_for_finished(&self) {
    let mut lookup = self.inner.lookup.lock();
    while lookup.pending {
      lookup = self.inner.finished.wait(lookup);
    }
  }

  /// Like [`Address::wait_for_finished`] with an upper bound. Returns
  /// `false` if the lookup is still pending.
  pub fn wait_for_finished_timeout(&self, timeout: Duration) -> bool {
    let Some(deadline) = Instant::now().checked_add(timeout) else {
      self.wait_for_finished();
      return true;
    };
    let mut lookup = self.inner.lookup.lock();
    while lookup.pending {
      let left = deadline.saturating_duration_since(Instant::now());
      if left.is_zero() {
        return false;
      }
      lookup = self.inner.finished.wait_timeout(lookup, left).0;
    }
    true
  }

  /// Runs `f` on the lookup thread once the lookup finishes. Listeners added
  /// after that are never called.
  pub fn on_lookup_finished<F>(&self, f: F) -> ListenerId
  where
    F: Fn(&Address) + Send + Sync + 'static,
  {
    self.inner.lookup_finished.subscribe(f)
  }

  pub fn remove_lookup_listener(&self, id: ListenerId) -> bool {
    self.inner.lookup_finished.unsubscribe(id)
  }

  fn finish(&self, candidates: Vec<Candidate>) {
    {
      let mut lookup = self.inner.lookup.lock();
      lookup.pending = false;
      lookup.candidates = candidates;
    }
    self.inner.finished.notify_all();
    self.inner.lookup_finished.notify(self);
  }

  fn resolve(&self) {
    let host = self.inner.host.as_str();
    match getaddrinfo(host, self.inner.port) {
      Ok(candidates) => {
        debug!(host, count = candidates.len(), "host lookup finished");
        self.finish(candidates);
      }
      Err(err) => {
        warn!(host, error = %err, "host lookup failed");
        self.finish(Vec::new());
      }
    }
  }
}

impl PartialEq for Address {
  /// Two addresses are equal when they share at least one candidate. Pending
  /// lookups are waited for first.
  fn eq(&self, other: &Self) -> bool {
    if Arc::ptr_eq(&self.inner, &other.inner) {
      return true;
    }
    self.wait_for_finished();
    other.wait_for_finished();

    let ours = self.candidates();
    let theirs = other.candidates();
    ours.iter().any(|a| {
      theirs.iter().any(|b| {
        a.family == b.family && a.protocol == b.protocol && a.addr == b.addr
      })
    })
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let lookup = self.inner.lookup.lock();
    match lookup.candidates.first() {
      Some(c) if c.addr.port() != 0 => write!(f, "{}", c.addr),
      Some(c) => write!(f, "{}", c.addr.ip()),
      None if self.inner.port == 0 => f.write_str(&self.inner.host),
      None if self.inner.host.contains(':') => {
        write!(f, "[{}]:{}", self.inner.host, self.inner.port)
      }
      None => write!(f, "{}:{}", self.inner.host, self.inner.port),
    }
  }
}

impl fmt::Debug for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let lookup = self.inner.lookup.lock();
    f.debug_struct("Address")
      .field("host", &self.inner.host)
      .field("port", &self.inner.port)
      .field("pending", &lookup.pending)
      .field("candidates", &lookup.candidates)
      .finish()
  }
}

static LOOKUP_QUEUE: OnceLock<Option<Sender<Address>>> = OnceLock::new();

fn lookup_queue() -> Option<&'static Sender<Address>> {
  LOOKUP_QUEUE
    .get_or_init(|| {
      let (tx, rx) = crossbeam_channel::unbounded::<Address>();
      let spawned = thread::Builder::new()
        .name(String::from("sockline-lookup"))
        .spawn(move || {
          debug!("lookup thread started");
          for address in rx {
            address.resolve();
          }
        });

      match spawned {
        Ok(_) => Some(tx),
        Err(err) => {
          warn!(error = %err, "failed to start lookup thread");
          None
        }
      }
    })
    .as_ref()
}

fn getaddrinfo(host: &str, port: u16) -> io::Result<Vec<Candidate>> {
  let node = if host.is_empty() { None } else { Some(CString::new(host)?) };
  let service = CString::new(port.to_string())?;

  // SAFETY: addrinfo is plain data; an all-zero hints struct is valid.
  let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
  hints.ai_family = libc::AF_UNSPEC;
  hints.ai_socktype = libc::SOCK_STREAM;
  hints.ai_protocol = libc::IPPROTO_TCP;
  hints.ai_flags = if host.is_empty() { libc::AI_PASSIVE } else { 0 };

  let mut list: *mut libc::addrinfo = ptr::null_mut();
  // SAFETY: every pointer is valid for the duration of the call.
  let rc = unsafe {
    libc::getaddrinfo(
      node.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
      service.as_ptr(),
      &hints,
      &mut list,
    )
  };

  if rc != 0 {
    if rc == libc::EAI_SYSTEM {
      return Err(io::Error::last_os_error());
    }
    // SAFETY: gai_strerror returns a static nul-terminated string.
    let message = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
    return Err(io::Error::other(message.to_string_lossy().into_owned()));
  }

  let mut candidates = Vec::new();
  let mut at = list;
  while !at.is_null() {
    // SAFETY: `at` walks the list getaddrinfo just returned.
    let info = unsafe { &*at };
    if !info.ai_addr.is_null() {
      // SAFETY: ai_addr points to a sockaddr of family ai_family.
      let addr = unsafe { sys::socket_addr_from_ptr(info.ai_addr, info.ai_family) };
      if let Ok(addr) = addr {
        candidates.push(Candidate {
          family: Family::from(&addr),
          socket_type: info.ai_socktype,
          protocol: info.ai_protocol,
          addr,
        });
      }
    }
    at = info.ai_next;
  }

  // SAFETY: `list` came from a successful getaddrinfo and is freed once.
  unsafe { libc::freeaddrinfo(list) };
  Ok(candidates)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn numeric_host_resolves_immediately() {
    let address = Address::lookup_tcp("127.0.0.1", 8080);

    assert!(!address.is_pending());
    assert!(address.is_host_found());
    assert_eq!(address.candidate_count(), 1);
    assert_eq!(address.to_string(), "127.0.0.1:8080");
    assert_eq!(address.host_name(), "127.0.0.1");
    assert_eq!(address.port(), 8080);
  }

  #[test]
  fn bracketed_ipv6_is_numeric() {
    let address = Address::lookup_tcp("[::1]", 443);

    let candidate = address.candidate(Family::V6, 0).unwrap();
    assert_eq!(candidate.addr, "[::1]:443".parse().unwrap());
    assert!(address.candidate(Family::V4, 0).is_none());
    assert_eq!(address.to_string(), "[::1]:443");
  }

  #[test]
  fn candidates_are_indexed_per_family() {
    let address = Address::from_socket_addrs([
      "[::1]:1".parse().unwrap(),
      "10.0.0.1:1".parse().unwrap(),
      "10.0.0.2:1".parse().unwrap(),
    ]);

    let second_v4 = address.candidate(Family::V4, 1).unwrap();
    assert_eq!(second_v4.addr, "10.0.0.2:1".parse().unwrap());
    assert_eq!(second_v4.socket_type, libc::SOCK_STREAM);
    assert_eq!(second_v4.protocol, libc::IPPROTO_TCP);
    assert!(address.candidate(Family::V4, 2).is_none());
    assert_eq!(address.candidate_count(), 3);
  }

  #[test]
  fn empty_address_is_valid_but_not_found() {
    let address = Address::from_socket_addrs(std::iter::empty());
    assert!(address.is_valid());
    assert!(!address.is_host_found());
    assert_eq!(address.to_string(), "");
  }

  #[test]
  fn equality_needs_a_shared_candidate() {
    let a = Address::from_socket_addrs([
      "10.0.0.1:80".parse().unwrap(),
      "10.0.0.2:80".parse().unwrap(),
    ]);
    let b = Address::from_socket_addr("10.0.0.2:80".parse().unwrap());
    let c = Address::from_socket_addr("10.0.0.3:80".parse().unwrap());

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(c, c.clone());
  }

  #[test]
  fn localhost_lookup_finishes_and_notifies() {
    let address = Address::lookup_tcp("localhost", 80);
    let (tx, rx) = crossbeam_channel::unbounded();
    address.on_lookup_finished(move |a| {
      let _ = tx.send(a.is_pending());
    });

    assert!(address.wait_for_finished_timeout(Duration::from_secs(10)));
    assert!(address.is_valid());
    assert_eq!(address.port(), 80);
    assert_eq!(address.host_name(), "localhost");
    // The listener may have been added after the lookup already finished.
    if let Ok(pending) = rx.recv_timeout(Duration::from_millis(100)) {
      assert!(!pending);
    }
  }

  #[test]
  fn invalid_host_finds_nothing() {
    let address = Address::lookup_tcp("does-not-exist.invalid", 80);
    assert!(address.wait_for_finished_timeout(Duration::from_secs(30)));
    assert!(!address.is_host_found());
    assert_eq!(address.to_string(), "does-not-exist.invalid:80");
  }
}
