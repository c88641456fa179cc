//! datapath and proxy errors
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `webtap::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// An inbound frame could not be parsed; it is dropped and processing continues.
  #[error("malformed frame: {0}")]
  MalformedFrame(&'static str),
  /// A non-SYN segment arrived for a flow key the engine has never seen.
  #[error("no flow registered for {0}")]
  UnknownFlow(String),
  /// A bounded queue would have blocked; the frame or payload was not enqueued.
  #[error("queue full, refusing {len} bytes")]
  BackpressureDrop {
    /// number of bytes that were not enqueued
    len: usize,
  },
  /// The caller's buffer cannot hold the next queued payload.
  ///
  /// Payloads are never fragmented across reads, so a reader must supply a
  /// buffer of at least the link MTU.
  #[error("receive buffer holds {have} bytes but the next payload is {need} bytes")]
  BufferTooSmall {
    /// size of the queued payload
    need: usize,
    /// size of the caller's buffer
    have: usize,
  },
  /// `close` was called on a flow that never completed a handshake.
  #[error("cannot close a TCP flow that is still in its initial state")]
  CloseInInit,
  /// Frame serialization failed before the frame reached the outbound queue.
  #[error("serialize: {0}")]
  Serialize(String),
  /// I/O against the link or an upstream connection failed.
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// A mux registration pattern was not `"*"`, `":<port>"` or `"<addr>:<port>"`.
  #[error("invalid flow pattern {0:?}")]
  Pattern(String),
  /// Certificate authority or leaf minting failed.
  #[error("certificate: {0}")]
  Certificate(String),
  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
  /// An intercepted HTTP exchange could not be parsed or forwarded.
  #[error("proxy: {0}")]
  Proxy(String),
  /// DNS resolution on behalf of the child failed.
  #[error("dns: {0}")]
  Dns(String),
  /// Namespace, TUN or child process setup failed.
  #[error("isolation: {0}")]
  Isolation(String),
}

impl Error {
  /// Create a certificate error and log it.
  pub(crate) fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a proxy error and log it.
  pub(crate) fn proxy(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an isolation error and log it.
  pub(crate) fn isolation(msg: impl Into<String>) -> Self {
    let error = Error::Isolation(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<Error> for std::io::Error {
  fn from(value: Error) -> Self {
    match value {
      Error::Io(io) => io,
      Error::BackpressureDrop { .. } => std::io::Error::new(ErrorKind::WouldBlock, value),
      Error::BufferTooSmall { .. } => std::io::Error::new(ErrorKind::InvalidInput, value),
      other => std::io::Error::other(other),
    }
  }
}

impl From<nix::errno::Errno> for Error {
  fn from(value: nix::errno::Errno) -> Self {
    Error::Io(std::io::Error::from(value))
  }
}
