//! Socket lifecycle events.

use crate::audience::{Audience, ListenerId};
use crate::error::SocketError;
use crossbeam_channel::Receiver;

/// Something that happened to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
  /// The connection is established and the I/O thread is running.
  Connected,
  /// The descriptor is closed. Emitted at most once per socket.
  Disconnected,
  Error(SocketError),
  /// New bytes were appended to the input buffer.
  ReadyRead,
  /// A send attempt for this many bytes finished.
  BytesWritten(usize),
  /// The output buffer is empty.
  WriteFinished,
}

impl SocketEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::Connected => EventKind::Connected,
      Self::Disconnected => EventKind::Disconnected,
      Self::Error(_) => EventKind::Error,
      Self::ReadyRead => EventKind::ReadyRead,
      Self::BytesWritten(_) => EventKind::BytesWritten,
      Self::WriteFinished => EventKind::WriteFinished,
    }
  }
}

/// Names one of the six event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Connected,
  Disconnected,
  Error,
  ReadyRead,
  BytesWritten,
  WriteFinished,
}

impl EventKind {
  pub const ALL: [EventKind; 6] = [
    EventKind::Connected,
    EventKind::Disconnected,
    EventKind::Error,
    EventKind::ReadyRead,
    EventKind::BytesWritten,
    EventKind::WriteFinished,
  ];
}

/// The event channels of one socket.
///
/// Listeners run on the thread that produced the event: the caller's thread
/// for `close`, the connect thread for `Connected` and connect errors, and the
/// I/O thread for everything else. No socket lock is held while they run.
#[derive(Default)]
pub struct SocketEvents {
  connected: Audience<SocketEvent>,
  disconnected: Audience<SocketEvent>,
  error: Audience<SocketEvent>,
  ready_read: Audience<SocketEvent>,
  bytes_written: Audience<SocketEvent>,
  write_finished: Audience<SocketEvent>,
}

impl SocketEvents {
  fn audience(&self, kind: EventKind) -> &Audience<SocketEvent> {
    match kind {
      EventKind::Connected => &self.connected,
      EventKind::Disconnected => &self.disconnected,
      EventKind::Error => &self.error,
      EventKind::ReadyRead => &self.ready_read,
      EventKind::BytesWritten => &self.bytes_written,
      EventKind::WriteFinished => &self.write_finished,
    }
  }

  pub fn subscribe<F>(&self, kind: EventKind, f: F) -> ListenerId
  where
    F: Fn(&SocketEvent) + Send + Sync + 'static,
  {
    self.audience(kind).subscribe(f)
  }

  pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
    self.audience(kind).unsubscribe(id)
  }

  /// Returns a receiver fed by every channel in `kinds`.
  pub fn channel(&self, kinds: &[EventKind]) -> Receiver<SocketEvent> {
    let (tx, rx) = crossbeam_channel::unbounded();
    for kind in kinds {
      self.audience(*kind).subscribe_channel(tx.clone());
    }
    rx
  }

  pub fn channel_all(&self) -> Receiver<SocketEvent> {
    self.channel(&EventKind::ALL)
  }

  pub fn on_connected<F>(&self, f: F) -> ListenerId
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.connected.subscribe(move |_| f())
  }

  pub fn on_disconnected<F>(&self, f: F) -> ListenerId
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.disconnected.subscribe(move |_| f())
  }

  pub fn on_error<F>(&self, f: F) -> ListenerId
  where
    F: Fn(&SocketError) + Send + Sync + 'static,
  {
    self.error.subscribe(move |event| {
      if let SocketEvent::Error(err) = event {
        f(err)
      }
    })
  }

  pub fn on_ready_read<F>(&self, f: F) -> ListenerId
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.ready_read.subscribe(move |_| f())
  }

  pub fn on_bytes_written<F>(&self, f: F) -> ListenerId
  where
    F: Fn(usize) + Send + Sync + 'static,
  {
    self.bytes_written.subscribe(move |event| {
      if let SocketEvent::BytesWritten(n) = event {
        f(*n)
      }
    })
  }

  pub fn on_write_finished<F>(&self, f: F) -> ListenerId
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.write_finished.subscribe(move |_| f())
  }

  pub(crate) fn emit(&self, event: SocketEvent) {
    self.audience(event.kind()).notify(&event);
  }
}

impl std::fmt::Debug for SocketEvents {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut s = f.debug_struct("SocketEvents");
    for kind in EventKind::ALL {
      s.field(&format!("{kind:?}"), &self.audience(kind).len());
    }
    s.finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn events_reach_only_their_channel() {
    let events = SocketEvents::default();
    let errors = Arc::new(AtomicUsize::new(0));
    let reads = Arc::new(AtomicUsize::new(0));

    let e = errors.clone();
    events.on_error(move |err| {
      assert_eq!(*err, SocketError::Aborted);
      e.fetch_add(1, Ordering::SeqCst);
    });
    let r = reads.clone();
    events.on_ready_read(move || {
      r.fetch_add(1, Ordering::SeqCst);
    });

    events.emit(SocketEvent::Error(SocketError::Aborted));
    events.emit(SocketEvent::ReadyRead);
    events.emit(SocketEvent::ReadyRead);

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(reads.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn channel_only_sees_requested_kinds() {
    let events = SocketEvents::default();
    let rx = events.channel(&[EventKind::BytesWritten, EventKind::Disconnected]);

    events.emit(SocketEvent::Connected);
    events.emit(SocketEvent::BytesWritten(12));
    events.emit(SocketEvent::Disconnected);

    let got: Vec<_> = rx.try_iter().collect();
    assert_eq!(
      got,
      vec![SocketEvent::BytesWritten(12), SocketEvent::Disconnected]
    );
  }

  #[test]
  fn kind_round_trips() {
    for kind in EventKind::ALL {
      let event = match kind {
        EventKind::Connected => SocketEvent::Connected,
        EventKind::Disconnected => SocketEvent::Disconnected,
        EventKind::Error => SocketEvent::Error(SocketError::LookupFailed),
        EventKind::ReadyRead => SocketEvent::ReadyRead,
        EventKind::BytesWritten => SocketEvent::BytesWritten(1),
        EventKind::WriteFinished => SocketEvent::WriteFinished,
      };
      assert_eq!(event.kind(), kind);
    }
  }
}
