//! The recording proxy server
//!
//! One task accepts browser connections; every accepted connection runs as
//! its own session task until the browser leaves, an error closes it, or
//! the server shuts down.
use crate::codec::RawRequest;
use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::event::{EventListener, EventPublisher, ListenerId, RecorderEvent};
use crate::forwarder::{RequestForwarder, ResponseForwarder, Target};
use crate::gate::Unsecured;
use crate::identity::TlsIdentityProvider;
use crate::pipeline::{InboundPipeline, PipelineFactory};
use crate::record::TagMarker;
use crate::session::{ConnectionRegistry, TransportMode, TunnelState};
use crate::socket::OutboundConnector;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Builder for [`ProxyServer`]
#[derive(Debug, Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  identities: Option<Arc<TlsIdentityProvider>>,
  publisher: Option<EventPublisher>,
}

impl ProxyServerBuilder {
  /// Create a new builder
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the configuration, [`ProxyConfig::default`] otherwise
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Use an existing identity provider instead of loading one from the
  /// configuration
  pub fn identity_provider(mut self, identities: Arc<TlsIdentityProvider>) -> Self {
    self.identities = Some(identities);
    self
  }

  /// Publish through an existing publisher, keeping its listeners
  pub fn publisher(mut self, publisher: EventPublisher) -> Self {
    self.publisher = Some(publisher);
    self
  }

  /// Validates the configuration and loads the TLS identities.
  pub async fn build(self) -> Result<ProxyServer> {
    let config = self.config.unwrap_or_default();
    config.validate()?;
    let identities = match self.identities {
      Some(identities) => identities,
      None => Arc::new(TlsIdentityProvider::from_config(&config).await?),
    };
    let connector = OutboundConnector::from_config(&config);
    let forwarder = RequestForwarder::new(
      connector.clone(),
      identities.connector(),
      config.upstream_proxy.clone(),
    );
    let factory = PipelineFactory::new(&config, identities.clone());
    let inner = ServerInner {
      config,
      registry: ConnectionRegistry::new(),
      identities,
      publisher: self.publisher.unwrap_or_default(),
      factory,
      forwarder,
      connector,
      tracker: TaskTracker::new(),
      cancel: CancellationToken::new(),
    };
    Ok(ProxyServer {
      inner: Arc::new(inner),
      local_addr: OnceLock::new(),
      accept: Mutex::new(AcceptLoop::default()),
    })
  }
}

#[derive(Debug)]
struct ServerInner {
  config: ProxyConfig,
  registry: ConnectionRegistry,
  identities: Arc<TlsIdentityProvider>,
  publisher: EventPublisher,
  factory: PipelineFactory,
  forwarder: RequestForwarder,
  connector: OutboundConnector,
  tracker: TaskTracker,
  cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct AcceptLoop {
  handle: Option<JoinHandle<()>>,
  cancel: Option<CancellationToken>,
}

/// HTTP/HTTPS recording proxy
///
/// ```no_run
/// use slinger_recorder::{ProxyConfig, ProxyServer, RecorderEvent};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///   let server = ProxyServer::builder()
///     .config(ProxyConfig::new(8080))
///     .build()
///     .await?;
///   server.subscribe(|event: &RecorderEvent| -> slinger_recorder::Result<()> {
///     println!("{:?}", event);
///     Ok(())
///   });
///   server.start().await?;
///   tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///   server.shutdown().await;
///   Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ProxyServer {
  inner: Arc<ServerInner>,
  local_addr: OnceLock<SocketAddr>,
  accept: Mutex<AcceptLoop>,
}

impl ProxyServer {
  /// Create a new builder
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::new()
  }

  /// Server with `config` and no prior listeners.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    Self::builder().config(config).build().await
  }

  /// Binds the listening socket and starts accepting connections.
  ///
  /// Returns the bound address, which differs from the configured one when
  /// the configured port is `0`. A server can be started once.
  pub async fn start(&self) -> Result<SocketAddr> {
    let mut accept = self.accept.lock().await;
    if accept.handle.is_some() || self.inner.cancel.is_cancelled() {
      return Err(Error::Config("server already started".to_string()));
    }
    let addr = self.inner.config.listen_addr();
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|source| Error::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;
    let _ = self.local_addr.set(local_addr);
    let token = self.inner.cancel.child_token();
    accept.handle = Some(tokio::spawn(accept_loop(
      self.inner.clone(),
      listener,
      token.clone(),
    )));
    accept.cancel = Some(token);
    tracing::info!("[recorder] listening on {}", local_addr);
    Ok(local_addr)
  }

  /// Stops accepting, closes every session and waits for their tasks.
  ///
  /// Calling it again, or on a server never started, is harmless.
  pub async fn shutdown(&self) {
    let mut accept = self.accept.lock().await;
    if let Some(token) = accept.cancel.take() {
      token.cancel();
    }
    if let Some(handle) = accept.handle.take() {
      if let Err(e) = handle.await {
        tracing::error!("[recorder] accept loop failed: {}", e);
      }
    }
    self.inner.cancel.cancel();
    self.inner.tracker.close();
    self.inner.tracker.wait().await;
    self.inner.registry.clear();
    self.inner.identities.clear_cache();
    tracing::info!("[recorder] stopped");
  }

  /// Registers an event listener.
  pub fn subscribe<L: EventListener + 'static>(&self, listener: L) -> ListenerId {
    self.inner.publisher.subscribe(listener)
  }

  /// Removes an event listener.
  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    self.inner.publisher.unsubscribe(id)
  }

  /// Publishes a tag between the surrounding captured exchanges.
  pub fn insert_tag(&self, label: impl Into<String>) -> TagMarker {
    let marker = TagMarker::new(label);
    tracing::debug!("[recorder] tag {}", marker.label);
    self
      .inner
      .publisher
      .publish(&RecorderEvent::TagInserted(marker.clone()));
    marker
  }

  /// the event publisher
  pub fn publisher(&self) -> &EventPublisher {
    &self.inner.publisher
  }

  /// the identity provider
  pub fn identity_provider(&self) -> &Arc<TlsIdentityProvider> {
    &self.inner.identities
  }

  /// the live sessions
  pub fn registry(&self) -> &ConnectionRegistry {
    &self.inner.registry
  }

  /// the configuration the server was built with
  pub fn config(&self) -> &ProxyConfig {
    &self.inner.config
  }

  /// Bound address once started.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.local_addr.get().copied()
  }

  /// Number of live browser connections.
  pub fn connection_count(&self) -> usize {
    self.inner.registry.connection_count()
  }
}

impl Drop for ProxyServer {
  fn drop(&mut self) {
    self.inner.cancel.cancel();
  }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Pause before the next accept. Errors tied to one connection retry at
/// once, anything else (such as running out of descriptors) waits.
fn accept_backoff(error: &io::Error) -> Duration {
  match error.kind() {
    ErrorKind::ConnectionAborted
    | ErrorKind::ConnectionReset
    | ErrorKind::ConnectionRefused
    | ErrorKind::Interrupted => Duration::ZERO,
    _ => ACCEPT_BACKOFF,
  }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, cancel: CancellationToken) {
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          if let Err(e) = inner.connector.configure_accepted(&stream) {
            tracing::debug!("[recorder] socket options for {}: {}", peer, e);
          }
          let session_cancel = inner.cancel.child_token();
          inner
            .tracker
            .spawn(serve_session(inner.clone(), stream, peer, session_cancel));
        }
        Err(e) => {
          tracing::error!("[recorder] failed to accept connection: {}", e);
          let backoff = accept_backoff(&e);
          if !backoff.is_zero() {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tokio::time::sleep(backoff) => {}
            }
          }
        }
      }
    }
  }
  drop(listener);
  tracing::debug!("[recorder] listener closed");
}

async fn serve_session(
  inner: Arc<ServerInner>,
  stream: TcpStream,
  peer: SocketAddr,
  cancel: CancellationToken,
) {
  let id = inner.registry.register(peer);
  tracing::debug!("[recorder] session {} from {}", id, peer);
  let result = tokio::select! {
    _ = cancel.cancelled() => Err(Error::Cancelled),
    result = run_session(&inner, id, stream, &cancel) => result,
  };
  match result {
    Ok(()) => tracing::debug!("[recorder] session {} closed", id),
    Err(e) if e.is_disconnect() => tracing::debug!("[recorder] session {} ended: {}", id, e),
    Err(e) => tracing::error!("[recorder] session {} from {}: {}", id, peer, e),
  }
  inner.registry.remove(id);
}

async fn run_session(
  inner: &ServerInner,
  id: u64,
  stream: TcpStream,
  cancel: &CancellationToken,
) -> Result<()> {
  let mut reader = BufReader::new(stream);
  let plaintext = inner.factory.inbound(TransportMode::Plaintext, None).await?;
  let first = match plaintext.read_request(&mut reader).await? {
    Some(request) => request,
    None => return Ok(()),
  };
  if first.head.method != Method::CONNECT {
    return exchange(inner, id, &plaintext, &mut reader, None, Some(first), cancel).await;
  }

  let target = Target::from_connect(&first.head.target)?;
  let pipeline = inner
    .factory
    .inbound(TransportMode::TlsTunnel, Some(target.host()))
    .await?;
  let acceptor = pipeline
    .acceptor()
    .cloned()
    .ok_or_else(|| Error::certificate_error(format!("no TLS stage for {}", target.host())))?;
  let gate = Unsecured::new(reader).acknowledge().await?;
  inner.registry.set_state(id, gate.state());
  let tls = gate.secure(acceptor).await?;
  inner.registry.set_state(id, TunnelState::Secured);
  tracing::debug!("[recorder] session {} tunnel to {} secured", id, target.authority());
  let mut reader = BufReader::new(tls);
  exchange(inner, id, &pipeline, &mut reader, Some(&target), None, cancel).await
}

/// Forwards the requests of a session one at a time.
async fn exchange<S>(
  inner: &ServerInner,
  session_id: u64,
  pipeline: &InboundPipeline,
  browser: &mut BufReader<S>,
  tunnel: Option<&Target>,
  mut pending: Option<RawRequest>,
  cancel: &CancellationToken,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let request = match pending.take() {
      Some(request) => request,
      None => match pipeline.read_request(browser).await? {
        Some(request) => request,
        None => return Ok(()),
      },
    };
    if request.head.method == Method::CONNECT {
      return Err(Error::invalid_request(format!(
        "CONNECT {} inside an established session",
        request.head.target
      )));
    }
    let target = match tunnel {
      Some(target) => target.clone(),
      None => Target::from_request(&request.head)?,
    };
    let request_id = inner.publisher.next_request_id();
    let captured = pipeline.capture(
      &request,
      request_id,
      session_id,
      target.url_for(&request.head.target),
    );
    tracing::debug!(
      "[recorder] session {} {} {}",
      session_id,
      captured.method,
      captured.url
    );
    inner
      .publisher
      .publish(&RecorderEvent::RequestCaptured(captured));

    let _outbound_guard = inner.registry.track_outbound();
    let mut outbound = inner.forwarder.connect(&target, cancel).await?;
    inner.forwarder.forward(&mut outbound, &request).await?;
    let mut outbound = BufReader::new(outbound);
    let origin = inner.factory.outbound(target.is_tls());
    let response = origin
      .read_response(&mut outbound, &request.head.method)
      .await?;
    ResponseForwarder.relay(browser, &response).await?;
    inner
      .publisher
      .publish(&RecorderEvent::ResponseCaptured(origin.capture(&response, request_id)));

    if response.head.status == StatusCode::SWITCHING_PROTOCOLS {
      let (sent, received) = tokio::io::copy_bidirectional(browser, &mut outbound).await?;
      tracing::trace!(
        "[recorder] session {} upgrade done, {} bytes up, {} bytes down",
        session_id,
        sent,
        received
      );
      return Ok(());
    }
    if !(request.head.keep_alive() && response.keep_alive()) {
      if let Err(e) = browser.shutdown().await {
        tracing::trace!("[recorder] session {} shutdown: {}", session_id, e);
      }
      return Ok(());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  async fn server(config: ProxyConfig) -> ProxyServer {
    ProxyServer::builder()
      .config(config.generate_fallback_identity(false))
      .build()
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn starts_once_on_a_free_port() {
    let server = server(ProxyConfig::new(0)).await;
    assert!(server.local_addr().is_none());
    let addr = server.start().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(server.local_addr(), Some(addr));
    assert!(server.start().await.is_err());
    server.shutdown().await;
    server.shutdown().await;
  }

  #[test]
  fn accept_errors_back_off_unless_per_connection() {
    for kind in [ErrorKind::ConnectionAborted, ErrorKind::ConnectionReset] {
      assert_eq!(accept_backoff(&io::Error::from(kind)), Duration::ZERO);
    }
    let exhausted = io::Error::new(ErrorKind::Other, "too many open files");
    assert_eq!(accept_backoff(&exhausted), ACCEPT_BACKOFF);
    assert_eq!(
      accept_backoff(&io::Error::from(ErrorKind::OutOfMemory)),
      ACCEPT_BACKOFF
    );
  }

  #[tokio::test]
  async fn bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let server = server(ProxyConfig::new(port)).await;
    assert!(matches!(server.start().await, Err(Error::Bind { .. })));
  }

  #[tokio::test]
  async fn tags_are_published() {
    let server = server(ProxyConfig::new(0)).await;
    let (listener, mut events) = crate::event::ChannelListener::new();
    server.subscribe(listener);
    let marker = server.insert_tag("login");
    assert_eq!(
      events.recv().await,
      Some(RecorderEvent::TagInserted(marker))
    );
  }

  #[tokio::test]
  async fn connect_without_identity_closes_the_session() {
    let server = server(ProxyConfig::new(0)).await;
    let addr = server.start().await.unwrap();
    let mut browser = TcpStream::connect(addr).await.unwrap();
    browser
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
      .await
      .unwrap();
    let mut reply = Vec::new();
    browser.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
    server.shutdown().await;
    assert_eq!(server.connection_count(), 0);
  }

  #[tokio::test]
  async fn idle_sessions_are_closed_on_shutdown() {
    let server = server(ProxyConfig::new(0)).await;
    let addr = server.start().await.unwrap();
    let mut browser = TcpStream::connect(addr).await.unwrap();
    while server.connection_count() == 0 {
      tokio::task::yield_now().await;
    }
    server.shutdown().await;
    assert_eq!(server.connection_count(), 0);
    let mut buf = [0u8; 1];
    assert_eq!(browser.read(&mut buf).await.unwrap_or(0), 0);
    assert!(TcpStream::connect(addr).await.is_err());
  }
}
