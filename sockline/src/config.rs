use std::time::Duration;

/// Tunables for a [`Socket`](crate::Socket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
  /// How long a single candidate may take to accept a connection.
  pub connect_timeout: Duration,
  /// Scratch buffer size for one `recv`.
  pub recv_chunk: usize,
  /// Upper bound on bytes taken from the output buffer per send attempt.
  pub send_chunk: usize,
  /// Prefix for background thread names.
  pub thread_name: String,
}

impl Default for SocketConfig {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(6),
      recv_chunk: 0x20000,
      send_chunk: 0x10000,
      thread_name: String::from("sockline"),
    }
  }
}

impl SocketConfig {
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Zero is bumped to one byte.
  pub fn with_recv_chunk(mut self, size: usize) -> Self {
    self.recv_chunk = size.max(1);
    self
  }

  /// Zero is bumped to one byte.
  pub fn with_send_chunk(mut self, size: usize) -> Self {
    self.send_chunk = size.max(1);
    self
  }

  pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = name.into();
    self
  }

  pub(crate) fn connect_thread_name(&self) -> String {
    format!("{}-connect", self.thread_name)
  }

  pub(crate) fn io_thread_name(&self) -> String {
    format!("{}-io", self.thread_name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = SocketConfig::default();
    assert_eq!(config.connect_timeout, Duration::from_secs(6));
    assert_eq!(config.recv_chunk, 128 * 1024);
    assert_eq!(config.send_chunk, 64 * 1024);
    assert_eq!(config.io_thread_name(), "sockline-io");
  }

  #[test]
  fn builders_override_fields() {
    let config = SocketConfig::default()
      .with_connect_timeout(Duration::from_millis(250))
      .with_recv_chunk(0)
      .with_send_chunk(16)
      .with_thread_name("peer");

    assert_eq!(config.connect_timeout, Duration::from_millis(250));
    assert_eq!(config.recv_chunk, 1);
    assert_eq!(config.send_chunk, 16);
    assert_eq!(config.connect_thread_name(), "peer-connect");
  }
}
