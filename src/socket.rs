//! Outbound sockets
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::gate::OutboundGate;
use socket2::{Domain, Protocol, SockRef, Socket as RawSocket, Type};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;

/// Opens TCP connections toward origins or the upstream proxy.
#[derive(Debug, Clone)]
pub struct OutboundConnector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl OutboundConnector {
  /// new connector
  pub fn new(connect_timeout: Option<Duration>, nodelay: bool, keepalive: bool) -> Self {
    Self {
      connect_timeout,
      nodelay,
      keepalive,
    }
  }

  /// connector with the socket options of `config`
  pub fn from_config(config: &ProxyConfig) -> Self {
    Self::new(config.connect_timeout, config.nodelay, config.keepalive)
  }

  /// Resolves `host` and connects to the first address that accepts,
  /// bounded by the connect timeout.
  pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let attempt = async {
      let mut last_error = None;
      for addr in tokio::net::lookup_host((host, port)).await? {
        match self.connect_with_addr(addr).await {
          Ok(stream) => return Ok(stream),
          Err(e) => last_error = Some(e),
        }
      }
      Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no address")
      }))
    };
    let result = match self.connect_timeout {
      None => attempt.await,
      Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
      },
    };
    result.map_err(|e| Error::connection_error(format!("connect to {}:{} failed: {}", host, port, e)))
  }

  /// Connects to a resolved address.
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    if self.keepalive {
      socket.set_keepalive(true)?;
    }
    socket.connect(addr).await
  }

  /// Applies the socket options to an accepted browser connection.
  pub fn configure_accepted(&self, stream: &TcpStream) -> Result<()> {
    if self.nodelay {
      stream.set_nodelay(true)?;
    }
    if self.keepalive {
      SockRef::from(stream).set_keepalive(true)?;
    }
    Ok(())
  }
}

/// An outbound connection, as seen by the forwarder.
#[derive(Debug)]
pub enum OutboundStream {
  /// plain TCP, to the origin or the upstream proxy
  Tcp(TcpStream),
  /// TLS straight to the origin
  Tls(Box<TlsStream<TcpStream>>),
  /// TLS to the origin through an upstream proxy tunnel
  Tunnel(Box<TlsStream<OutboundGate<TcpStream>>>),
}

impl OutboundStream {
  /// `true` when the bytes are encrypted end to end with the origin
  pub fn is_tls(&self) -> bool {
    !matches!(self, OutboundStream::Tcp(_))
  }

  /// Address of the peer socket (origin or upstream proxy).
  pub fn peer_addr(&self) -> Result<SocketAddr> {
    let tcp = match self {
      OutboundStream::Tcp(stream) => stream,
      OutboundStream::Tls(stream) => stream.get_ref().0,
      OutboundStream::Tunnel(stream) => stream.get_ref().0.get_ref(),
    };
    Ok(tcp.peer_addr()?)
  }
}

impl AsyncRead for OutboundStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      OutboundStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      OutboundStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      OutboundStream::Tunnel(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for OutboundStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      OutboundStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      OutboundStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      OutboundStream::Tunnel(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      OutboundStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      OutboundStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      OutboundStream::Tunnel(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      OutboundStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      OutboundStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      OutboundStream::Tunnel(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
