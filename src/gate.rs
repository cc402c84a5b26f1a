//! CONNECT gates
//!
//! The browser side is a typestate machine: a stream starts [`Unsecured`],
//! [`Unsecured::acknowledge`] answers the CONNECT and yields
//! [`AwaitingTunnelAck`], and [`AwaitingTunnelAck::secure`] runs the TLS
//! handshake over the very same stream. Going back, or securing a stream whose
//! CONNECT was never acknowledged, does not compile.
//!
//! The outbound side is [`OutboundGate`], a stream wrapper used after a
//! CONNECT was written to an upstream proxy. It holds writes back until the
//! proxy's reply has been read.
use crate::session::TunnelState;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Reply written to the browser once its CONNECT is accepted.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// Largest upstream CONNECT reply head accepted.
pub const MAX_CONNECT_REPLY: usize = 16 * 1024;

/// A browser connection that has not been secured.
#[derive(Debug)]
pub struct Unsecured<S> {
  stream: S,
}

/// A browser connection whose CONNECT has been acknowledged; the next bytes
/// from the browser start a TLS handshake.
#[derive(Debug)]
pub struct AwaitingTunnelAck<S> {
  stream: S,
}

impl<S> Unsecured<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  /// new gate
  pub fn new(stream: S) -> Self {
    Self { stream }
  }

  /// Writes the `200 Connection Established` reply and flushes it.
  pub async fn acknowledge(mut self) -> io::Result<AwaitingTunnelAck<S>> {
    self.stream.write_all(CONNECTION_ESTABLISHED).await?;
    self.stream.flush().await?;
    Ok(AwaitingTunnelAck {
      stream: self.stream,
    })
  }

  /// Plain HTTP: the gate is never secured.
  pub fn into_inner(self) -> S {
    self.stream
  }

  /// runtime state
  pub fn state(&self) -> TunnelState {
    TunnelState::Unsecured
  }

  /// inner stream
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.stream
  }
}

impl<S> AwaitingTunnelAck<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  /// Runs the server side TLS handshake. Any non TLS byte from the browser
  /// fails the handshake.
  pub async fn secure(self, acceptor: TlsAcceptor) -> io::Result<TlsStream<S>> {
    acceptor.accept(self.stream).await
  }

  /// runtime state
  pub fn state(&self) -> TunnelState {
    TunnelState::AwaitingTunnelAck
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Held,
  Open,
  Closed,
}

#[derive(Debug)]
struct GateShared {
  phase: Phase,
  pending: VecDeque<Bytes>,
  reader: Option<Waker>,
}

/// Closes an [`OutboundGate`] from another task.
#[derive(Debug, Clone)]
pub struct GateHandle {
  shared: Arc<Mutex<GateShared>>,
}

impl GateHandle {
  /// Drops every queued write; further I/O on the gate fails.
  pub fn close(&self) {
    let mut shared = lock(&self.shared);
    shared.phase = Phase::Closed;
    let dropped = shared.pending.len();
    shared.pending.clear();
    if let Some(waker) = shared.reader.take() {
      waker.wake();
    }
    drop(shared);
    if dropped > 0 {
      tracing::debug!("[recorder] outbound gate closed, {} queued writes dropped", dropped);
    }
  }

  /// `true` once the upstream accepted the tunnel and the gate is not closed
  pub fn is_open(&self) -> bool {
    lock(&self.shared).phase == Phase::Open
  }

  /// `true` after [`GateHandle::close`] or a refused tunnel
  pub fn is_closed(&self) -> bool {
    lock(&self.shared).phase == Phase::Closed
  }
}

fn lock(shared: &Mutex<GateShared>) -> MutexGuard<'_, GateShared> {
  shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "outbound gate closed")
}

/// Stream wrapper holding writes back until the upstream proxy answered the
/// CONNECT written on `inner`.
///
/// The first read consumes the reply head. A non-2xx status closes the gate
/// and fails the read. Otherwise queued writes are flushed in submission
/// order, once, before anything else goes through, and the gate stays open.
#[derive(Debug)]
pub struct OutboundGate<S> {
  inner: S,
  shared: Arc<Mutex<GateShared>>,
  reply: BytesMut,
  leftover: BytesMut,
  needs_flush: bool,
}

impl<S> OutboundGate<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  /// Wraps `inner` in a held gate.
  pub fn new(inner: S) -> (Self, GateHandle) {
    let shared = Arc::new(Mutex::new(GateShared {
      phase: Phase::Held,
      pending: VecDeque::new(),
      reader: None,
    }));
    let handle = GateHandle {
      shared: shared.clone(),
    };
    let gate = Self {
      inner,
      shared,
      reply: BytesMut::new(),
      leftover: BytesMut::new(),
      needs_flush: false,
    };
    (gate, handle)
  }

  /// a handle closing this gate
  pub fn handle(&self) -> GateHandle {
    GateHandle {
      shared: self.shared.clone(),
    }
  }

  /// inner stream
  pub fn get_ref(&self) -> &S {
    &self.inner
  }

  fn phase(&self) -> Phase {
    lock(&self.shared).phase
  }

  fn close(&self) {
    let mut shared = lock(&self.shared);
    shared.phase = Phase::Closed;
    shared.pending.clear();
  }

  fn poll_reply(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    loop {
      if let Some(end) = find_head_end(&self.reply) {
        let head = self.reply.split_to(end);
        self.leftover = self.reply.split();
        let status = parse_reply_status(&head);
        let mut shared = lock(&self.shared);
        if shared.phase == Phase::Closed {
          return Poll::Ready(Err(closed_error()));
        }
        match status {
          Some(code) if (200..300).contains(&code) => {
            shared.phase = Phase::Open;
            tracing::trace!("[recorder] upstream tunnel open ({})", code);
            return Poll::Ready(Ok(()));
          }
          other => {
            shared.phase = Phase::Closed;
            shared.pending.clear();
            let message = match other {
              Some(code) => format!("upstream proxy refused CONNECT with status {}", code),
              None => "malformed upstream CONNECT reply".to_string(),
            };
            return Poll::Ready(Err(io::Error::new(
              io::ErrorKind::ConnectionRefused,
              message,
            )));
          }
        }
      }
      if self.reply.len() > MAX_CONNECT_REPLY {
        self.close();
        return Poll::Ready(Err(io::Error::new(
          io::ErrorKind::InvalidData,
          "upstream CONNECT reply too large",
        )));
      }
      lock(&self.shared).reader = Some(cx.waker().clone());
      let mut chunk = [0u8; 4096];
      let mut read_buf = ReadBuf::new(&mut chunk);
      ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
      if read_buf.filled().is_empty() {
        self.close();
        return Poll::Ready(Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "upstream closed before answering CONNECT",
        )));
      }
      self.reply.extend_from_slice(read_buf.filled());
    }
  }

  fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    loop {
      let front = {
        let shared = lock(&self.shared);
        if shared.phase == Phase::Closed {
          return Poll::Ready(Err(closed_error()));
        }
        match shared.pending.front() {
          Some(front) => front.clone(),
          None => break,
        }
      };
      let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &front))?;
      if written == 0 {
        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
      }
      self.needs_flush = true;
      let mut shared = lock(&self.shared);
      if let Some(head) = shared.pending.front_mut() {
        head.advance(written);
        if head.is_empty() {
          shared.pending.pop_front();
        }
      }
    }
    if self.needs_flush {
      ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
      self.needs_flush = false;
    }
    Poll::Ready(Ok(()))
  }
}

impl<S> AsyncRead for OutboundGate<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    loop {
      match this.phase() {
        Phase::Closed => return Poll::Ready(Err(closed_error())),
        Phase::Held => ready!(this.poll_reply(cx))?,
        Phase::Open => {
          ready!(this.poll_drain(cx))?;
          if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.advance(n);
            return Poll::Ready(Ok(()));
          }
          return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
      }
    }
  }
}

impl<S> AsyncWrite for OutboundGate<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    {
      let mut shared = lock(&this.shared);
      match shared.phase {
        Phase::Closed => return Poll::Ready(Err(closed_error())),
        Phase::Held => {
          shared.pending.push_back(Bytes::copy_from_slice(buf));
          return Poll::Ready(Ok(buf.len()));
        }
        Phase::Open => {}
      }
    }
    ready!(this.poll_drain(cx))?;
    Pin::new(&mut this.inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    match this.phase() {
      Phase::Closed => Poll::Ready(Err(closed_error())),
      Phase::Held => Poll::Ready(Ok(())),
      Phase::Open => {
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
      }
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    match this.phase() {
      Phase::Open => ready!(this.poll_drain(cx))?,
      Phase::Held => this.close(),
      Phase::Closed => {}
    }
    Pin::new(&mut this.inner).poll_shutdown(cx)
  }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf
    .windows(4)
    .position(|window| window == b"\r\n\r\n")
    .map(|position| position + 4)
}

fn parse_reply_status(head: &[u8]) -> Option<u16> {
  let line = head.split(|b| *b == b'\n').next()?;
  let line = std::str::from_utf8(line).ok()?.trim_end();
  let mut parts = line.split_whitespace();
  let version = parts.next()?;
  if !version.starts_with("HTTP/1.") {
    return None;
  }
  let code = parts.next()?;
  if code.len() != 3 {
    return None;
  }
  code.parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::identity::HostIdentity;
  use std::time::Duration;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn acknowledge_writes_established_reply() {
    let (browser, proxy) = tokio::io::duplex(1024);
    let gate = Unsecured::new(proxy);
    assert_eq!(gate.state(), TunnelState::Unsecured);
    let gate = gate.acknowledge().await.unwrap();
    assert_eq!(gate.state(), TunnelState::AwaitingTunnelAck);

    let mut browser = browser;
    let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
    browser.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECTION_ESTABLISHED);
  }

  #[tokio::test]
  async fn plaintext_after_connect_fails_the_handshake() {
    let (mut browser, proxy) = tokio::io::duplex(4096);
    let identity = HostIdentity::self_signed(vec!["localhost".to_string()]).unwrap();
    let gate = Unsecured::new(proxy).acknowledge().await.unwrap();
    browser
      .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
      .await
      .unwrap();
    assert!(gate.secure(identity.acceptor()).await.is_err());
  }

  #[tokio::test]
  async fn writes_are_held_until_the_reply_then_flushed_in_order() {
    let (client, mut upstream) = tokio::io::duplex(4096);
    let (mut gate, handle) = OutboundGate::new(client);
    gate.write_all(b"first ").await.unwrap();
    gate.write_all(b"second").await.unwrap();
    gate.flush().await.unwrap();

    let mut probe = [0u8; 16];
    let nothing = tokio::time::timeout(Duration::from_millis(50), upstream.read(&mut probe)).await;
    assert!(nothing.is_err(), "queued bytes leaked before the reply");

    upstream
      .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
      .await
      .unwrap();
    let mut buf = [0u8; 5];
    gate.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    assert!(handle.is_open());

    let mut queued = [0u8; 12];
    upstream.read_exact(&mut queued).await.unwrap();
    assert_eq!(&queued, b"first second");

    gate.write_all(b"third").await.unwrap();
    gate.flush().await.unwrap();
    let mut direct = [0u8; 5];
    upstream.read_exact(&mut direct).await.unwrap();
    assert_eq!(&direct, b"third");
  }

  #[tokio::test]
  async fn refused_tunnel_fails_the_read_and_drops_writes() {
    let (client, mut upstream) = tokio::io::duplex(4096);
    let (mut gate, handle) = OutboundGate::new(client);
    gate.write_all(b"never sent").await.unwrap();
    upstream
      .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
      .await
      .unwrap();
    let mut buf = [0u8; 8];
    let error = gate.read(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::ConnectionRefused);
    assert!(handle.is_closed());
    assert!(gate.write_all(b"more").await.is_err());

    drop(gate);
    let mut received = Vec::new();
    upstream.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
  }

  #[tokio::test]
  async fn closing_drops_pending_writes() {
    let (client, mut upstream) = tokio::io::duplex(4096);
    let (mut gate, handle) = OutboundGate::new(client);
    gate.write_all(b"pending").await.unwrap();
    handle.close();
    assert!(gate.write_all(b"after").await.is_err());
    let mut buf = [0u8; 4];
    assert!(gate.read(&mut buf).await.is_err());

    drop(gate);
    let mut received = Vec::new();
    upstream.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
  }

  #[test]
  fn reply_status_parsing() {
    assert_eq!(parse_reply_status(b"HTTP/1.0 200 OK\r\n\r\n"), Some(200));
    assert_eq!(parse_reply_status(b"HTTP/1.1 502 Bad Gateway\r\n\r\n"), Some(502));
    assert_eq!(parse_reply_status(b"SSH-2.0\r\n\r\n"), None);
  }
}
