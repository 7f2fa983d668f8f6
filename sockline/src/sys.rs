//! Syscall wrappers shared by the connect thread, the I/O thread and the
//! listening service, plus conversions between `std::net` addresses and
//! their libc representations.

use std::{
  io, mem,
  net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6},
  os::fd::{FromRawFd, OwnedFd, RawFd},
};

#[cfg(linux)]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(linux))]
const SEND_FLAGS: libc::c_int = 0;

/// Creates a close-on-exec socket.
pub fn socket(
  family: libc::c_int,
  ty: libc::c_int,
  protocol: libc::c_int,
) -> io::Result<OwnedFd> {
  #[cfg(linux)]
  let fd = syscall!(socket(family, ty | libc::SOCK_CLOEXEC, protocol))?;
  #[cfg(not(linux))]
  let fd = syscall!(socket(family, ty, protocol))?;

  // SAFETY: We literally just created it.
  let fd = unsafe { OwnedFd::from_raw_fd(fd) };

  #[cfg(not(linux))]
  set_cloexec(raw(&fd))?;

  prepare_stream(raw(&fd))?;
  Ok(fd)
}

fn raw(fd: &OwnedFd) -> RawFd {
  use std::os::fd::AsRawFd;
  fd.as_raw_fd()
}

#[cfg(not(linux))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
  syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
  Ok(())
}

/// Per-descriptor setup for stream sockets. Writing to a peer that has gone
/// away must surface as `EPIPE`, never as a process-killing `SIGPIPE`.
pub fn prepare_stream(fd: RawFd) -> io::Result<()> {
  #[cfg(apple)]
  {
    let on: libc::c_int = 1;
    syscall!(setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_NOSIGPIPE,
      &on as *const libc::c_int as *const libc::c_void,
      mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
  }
  #[cfg(not(apple))]
  let _ = fd;
  Ok(())
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  let flags = if nonblocking {
    flags | libc::O_NONBLOCK
  } else {
    flags & !libc::O_NONBLOCK
  };
  syscall!(fcntl(fd, libc::F_SETFL, flags))?;
  Ok(())
}

/// Issues `connect(2)`. On a non-blocking socket the usual outcome is an
/// `EINPROGRESS` error, which callers treat as "wait for writability".
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
  let (storage, len) = socket_addr_into_raw(addr);
  syscall!(connect(
    fd,
    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
    len
  ))?;
  Ok(())
}

/// Reads and clears `SO_ERROR`.
pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
  let mut error: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  syscall!(getsockopt(
    fd,
    libc::SOL_SOCKET,
    libc::SO_ERROR,
    &mut error as *mut libc::c_int as *mut libc::c_void,
    &mut len,
  ))?;

  Ok((error != 0).then(|| io::Error::from_raw_os_error(error)))
}

pub fn shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
  let how = match how {
    Shutdown::Read => libc::SHUT_RD,
    Shutdown::Write => libc::SHUT_WR,
    Shutdown::Both => libc::SHUT_RDWR,
  };
  syscall!(shutdown(fd, how))?;
  Ok(())
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
  loop {
    match syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0))
    {
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      other => return other.map(|n| n as usize),
    }
  }
}

pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
  loop {
    match syscall!(send(
      fd,
      buf.as_ptr() as *const libc::c_void,
      buf.len(),
      SEND_FLAGS
    )) {
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      other => return other.map(|n| n as usize),
    }
  }
}

pub fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
  let on: libc::c_int = 1;
  syscall!(setsockopt(
    fd,
    libc::SOL_SOCKET,
    libc::SO_REUSEADDR,
    &on as *const libc::c_int as *const libc::c_void,
    mem::size_of::<libc::c_int>() as libc::socklen_t,
  ))?;
  Ok(())
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
  let (storage, len) = socket_addr_into_raw(addr);
  syscall!(bind(
    fd,
    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
    len
  ))?;
  Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
  syscall!(listen(fd, backlog))?;
  Ok(())
}

pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
  // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

  let incoming = loop {
    #[cfg(linux)]
    let res = syscall!(accept4(
      fd,
      &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
      &mut len,
      libc::SOCK_CLOEXEC
    ));
    #[cfg(not(linux))]
    let res = syscall!(accept(
      fd,
      &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
      &mut len
    ));
    match res {
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      other => break other?,
    }
  };

  // SAFETY: accept(2) handed us a fresh descriptor that nobody else owns.
  let incoming = unsafe { OwnedFd::from_raw_fd(incoming) };
  #[cfg(not(linux))]
  set_cloexec(raw(&incoming))?;
  prepare_stream(raw(&incoming))?;

  // SAFETY: the kernel filled `storage` with `len` valid bytes.
  let addr = unsafe { socket_addr_from_raw(&storage) }?;
  Ok((incoming, addr))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
  // SAFETY: zeroed sockaddr_storage is valid.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  syscall!(getsockname(
    fd,
    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
    &mut len
  ))?;
  // SAFETY: getsockname filled the storage.
  unsafe { socket_addr_from_raw(&storage) }
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
  // SAFETY: zeroed sockaddr_storage is valid.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  syscall!(getpeername(
    fd,
    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
    &mut len
  ))?;
  // SAFETY: getpeername filled the storage.
  unsafe { socket_addr_from_raw(&storage) }
}

/// Converts a kernel-filled `sockaddr_storage` into a `SocketAddr`.
///
/// # Safety
///
/// `storage` must hold an initialised `sockaddr_in` or `sockaddr_in6` as
/// indicated by its `ss_family`.
pub unsafe fn socket_addr_from_raw(
  storage: &libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
  let ptr = storage as *const libc::sockaddr_storage;
  // SAFETY: forwarded to the caller.
  unsafe { socket_addr_from_ptr(ptr.cast(), storage.ss_family as libc::c_int) }
}

/// Converts the `sockaddr` behind `ptr` into a `SocketAddr`.
///
/// # Safety
///
/// `ptr` must point to a valid `sockaddr_in` when `family` is `AF_INET` or a
/// valid `sockaddr_in6` when it is `AF_INET6`.
pub unsafe fn socket_addr_from_ptr(
  ptr: *const libc::sockaddr,
  family: libc::c_int,
) -> io::Result<SocketAddr> {
  match family {
    libc::AF_INET => {
      // SAFETY: family checked above.
      let sin = unsafe { *ptr.cast::<libc::sockaddr_in>() };
      let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
      Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
    }
    libc::AF_INET6 => {
      // SAFETY: family checked above.
      let sin6 = unsafe { *ptr.cast::<libc::sockaddr_in6>() };
      Ok(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
        u16::from_be(sin6.sin6_port),
        sin6.sin6_flowinfo,
        sin6.sin6_scope_id,
      )))
    }
    _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
  }
}

/// Lays `addr` out as a `sockaddr_storage` and returns the length of the
/// family-specific structure inside it.
pub fn socket_addr_into_raw(
  addr: &SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: sockaddr_storage is a C struct designed to hold any socket address type.
  // Zero-initialization is valid - all fields are primitive types where zero is safe.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

  let len = match addr {
    SocketAddr::V4(v4) => {
      let sin = into_sockaddr_in(v4);
      // SAFETY: sockaddr_in fits inside sockaddr_storage and both are plain data.
      unsafe {
        (&mut storage as *mut libc::sockaddr_storage)
          .cast::<libc::sockaddr_in>()
          .write(sin)
      };
      mem::size_of::<libc::sockaddr_in>()
    }
    SocketAddr::V6(v6) => {
      let sin6 = into_sockaddr_in6(v6);
      // SAFETY: sockaddr_in6 fits inside sockaddr_storage and both are plain data.
      unsafe {
        (&mut storage as *mut libc::sockaddr_storage)
          .cast::<libc::sockaddr_in6>()
          .write(sin6)
      };
      mem::size_of::<libc::sockaddr_in6>()
    }
  };

  (storage, len as libc::socklen_t)
}

fn into_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in is a C struct with primitive integer fields.
  // Zero-initialization is safe - all fields accept zero as a valid value.
  let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };

  #[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
  ))]
  {
    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
  }
  sin.sin_family = libc::AF_INET as libc::sa_family_t;
  sin.sin_port = addr.port().to_be();
  sin.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };

  sin
}

fn into_sockaddr_in6(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 is a C struct with primitive integer/array fields.
  // Zero-initialization is safe - all fields accept zero as a valid value.
  let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };

  #[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
  ))]
  {
    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
  }
  sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  sin6.sin6_port = addr.port().to_be();
  sin6.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  sin6.sin6_flowinfo = addr.flowinfo();
  sin6.sin6_scope_id = addr.scope_id();

  sin6
}
