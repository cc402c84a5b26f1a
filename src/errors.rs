//! recorder error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `slinger_recorder::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while recording traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// No usable TLS identity, or an identity that cannot be loaded
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Invalid configuration
  #[error("configuration error: {0}")]
  Config(String),
  /// The listening socket could not be bound
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// requested listen address
    addr: std::net::SocketAddr,
    /// bind failure
    source: std::io::Error,
  },
  /// Malformed request line, headers or framing
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// An aggregated body exceeded the configured limit
  #[error("body exceeds the maximum aggregated size of {limit} bytes")]
  BodyTooLarge {
    /// configured limit
    limit: usize,
  },
  /// Outbound connection failure
  #[error("connection error: {0}")]
  Connection(String),
  /// The upstream proxy refused or broke a tunnel
  #[error("upstream proxy error: {0}")]
  Upstream(String),
  /// An event listener failed
  #[error("listener error: {0}")]
  Listener(String),
  /// The session was cancelled by shutdown
  #[error("cancelled")]
  Cancelled,
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("[recorder] {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("[recorder] {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::warn!("[recorder] {}", error);
    error
  }

  /// Create an upstream proxy error and log it
  pub fn upstream_error(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::warn!("[recorder] {}", error);
    error
  }

  /// `true` when the error only means the peer went away
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::Io(e) => matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
          | ErrorKind::ConnectionReset
          | ErrorKind::ConnectionAborted
          | ErrorKind::BrokenPipe
      ),
      Error::Cancelled => true,
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_error(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
