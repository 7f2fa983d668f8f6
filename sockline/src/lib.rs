//! # Sockline - Thread-backed TCP sockets
//!
//! Sockline gives each TCP connection its own small set of threads: a
//! transient connect thread that tries every resolved address in turn, and an
//! I/O thread that shuttles bytes between the kernel and a pair of in-memory
//! buffers. Callers never block on the network except in
//! [`Socket::flush`] and [`Socket::close`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use sockline::{Socket, SocketEvent};
//!
//! let socket = Socket::new("example.com", 80)?;
//! let events = socket.events().channel_all();
//!
//! socket.write(b"GET / HTTP/1.0\r\n\r\n");
//! socket.open()?;
//!
//! for event in events.iter() {
//!   match event {
//!     SocketEvent::ReadyRead => print!("{}", String::from_utf8_lossy(&socket.read_all())),
//!     SocketEvent::Error(err) => eprintln!("error {}: {err}", err.code()),
//!     SocketEvent::Disconnected => break,
//!     _ => {}
//!   }
//! }
//! # Ok::<(), sockline::Error>(())
//! ```
//!
//! ## Events
//!
//! Every socket has six event channels: `connected`, `disconnected`,
//! `error`, `readyRead`, `bytesWritten` and `writeFinished`. Subscribe with a
//! callback through [`SocketEvents`] or take a channel receiver. Callbacks run
//! on the socket's own threads, with no socket lock held.
//!
//! ## Error Handling
//!
//! Calls that fail synchronously return [`Error`]. Failures on background
//! threads arrive as [`SocketEvent::Error`] carrying a [`SocketError`].
//!
//! ## Platform support
//!
//! Unix only. Linux and macOS are tested.

#[macro_use]
mod macros;

mod address;
mod audience;
mod buffer;
mod config;
mod error;
mod event;
mod pipe;
mod poll;
mod service;
mod socket;
mod sync;
mod sys;

pub use address::{Address, Candidate, Family};
pub use audience::{Audience, ListenerId};
pub use buffer::Buffer;
pub use config::SocketConfig;
pub use error::{Error, SocketError};
pub use event::{EventKind, SocketEvent, SocketEvents};
pub use service::Service;
pub use socket::{Socket, SocketStatus};
