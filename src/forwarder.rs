//! Forwarding requests to origins and relaying their responses
use crate::codec::{RawRequest, RawResponse, RequestHead};
use crate::config::UpstreamProxy;
use crate::errors::{Error, Result};
use crate::gate::OutboundGate;
use crate::identity::server_name;
use crate::socket::{OutboundConnector, OutboundStream};
use bytes::{BufMut, Bytes, BytesMut};
use http::uri::{Authority, Scheme};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  scheme: Scheme,
  host: String,
  port: u16,
}

impl Target {
  /// new target
  pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
    Self {
      scheme,
      host: host.into(),
      port,
    }
  }

  /// Target of a `CONNECT host[:port]` request; the port defaults to 443.
  pub fn from_connect(authority: &str) -> Result<Self> {
    let authority: Authority = authority
      .parse()
      .map_err(|e| Error::invalid_request(format!("invalid CONNECT authority {}: {}", authority, e)))?;
    Ok(Self::new(
      Scheme::HTTPS,
      unbracket(authority.host()),
      authority.port_u16().unwrap_or(443),
    ))
  }

  /// Target of a plaintext request: the absolute request URI, or the `Host`
  /// header for origin-form requests.
  pub fn from_request(head: &RequestHead) -> Result<Self> {
    let uri: http::Uri = head
      .target
      .parse()
      .map_err(|e| Error::invalid_request(format!("invalid request target {}: {}", head.target, e)))?;
    if let (Some(scheme), Some(authority)) = (uri.scheme(), uri.authority()) {
      let scheme = if *scheme == Scheme::HTTPS {
        Scheme::HTTPS
      } else if *scheme == Scheme::HTTP {
        Scheme::HTTP
      } else {
        return Err(Error::invalid_request(format!("unsupported scheme {}", scheme)));
      };
      let port = authority.port_u16().unwrap_or_else(|| default_port(&scheme));
      return Ok(Self::new(scheme, unbracket(authority.host()), port));
    }
    let host = head
      .headers
      .get(http::header::HOST)
      .and_then(|value| value.to_str().ok())
      .ok_or_else(|| Error::invalid_request("origin-form request without Host header"))?;
    let authority: Authority = host
      .parse()
      .map_err(|e| Error::invalid_request(format!("invalid Host header {}: {}", host, e)))?;
    Ok(Self::new(
      Scheme::HTTP,
      unbracket(authority.host()),
      authority.port_u16().unwrap_or(80),
    ))
  }

  /// host name or address, without brackets
  pub fn host(&self) -> &str {
    &self.host
  }

  /// port
  pub fn port(&self) -> u16 {
    self.port
  }

  /// `true` for `https` targets
  pub fn is_tls(&self) -> bool {
    self.scheme == Scheme::HTTPS
  }

  /// `host:port`, IPv6 addresses bracketed
  pub fn authority(&self) -> String {
    format!("{}:{}", self.bracketed_host(), self.port)
  }

  /// Absolute URL of `request_target` on this target.
  pub fn url_for(&self, request_target: &str) -> String {
    if request_target.contains("://") {
      return request_target.to_string();
    }
    let mut url = format!("{}://{}", self.scheme, self.bracketed_host());
    if self.port != default_port(&self.scheme) {
      url.push_str(&format!(":{}", self.port));
    }
    if !request_target.starts_with('/') {
      url.push('/');
    }
    url.push_str(request_target);
    url
  }

  fn bracketed_host(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]", self.host)
    } else {
      self.host.clone()
    }
  }
}

fn default_port(scheme: &Scheme) -> u16 {
  if *scheme == Scheme::HTTPS {
    443
  } else {
    80
  }
}

fn unbracket(host: &str) -> &str {
  host
    .strip_prefix('[')
    .and_then(|host| host.strip_suffix(']'))
    .unwrap_or(host)
}

/// Opens the outbound connection of each request and writes it.
///
/// Every forwarded request gets a fresh connection; nothing is pooled.
#[derive(Clone)]
pub struct RequestForwarder {
  connector: OutboundConnector,
  tls: TlsConnector,
  upstream: Option<UpstreamProxy>,
}

impl std::fmt::Debug for RequestForwarder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestForwarder")
      .field("connector", &self.connector)
      .field("upstream", &self.upstream)
      .finish()
  }
}

impl RequestForwarder {
  /// new forwarder
  pub fn new(connector: OutboundConnector, tls: TlsConnector, upstream: Option<UpstreamProxy>) -> Self {
    Self {
      connector,
      tls,
      upstream,
    }
  }

  /// Connects toward `target`, directly or through the upstream proxy.
  ///
  /// `cancel` aborts a tunnel still waiting for the upstream reply; the
  /// outbound gate is closed so nothing queued reaches the upstream.
  pub async fn connect(&self, target: &Target, cancel: &CancellationToken) -> Result<OutboundStream> {
    match (&self.upstream, target.is_tls()) {
      (None, false) => Ok(OutboundStream::Tcp(
        self.connector.connect(target.host(), target.port()).await?,
      )),
      (None, true) => {
        let tcp = self.connector.connect(target.host(), target.port()).await?;
        let tls = self.tls.connect(server_name(target.host())?, tcp).await?;
        Ok(OutboundStream::Tls(Box::new(tls)))
      }
      (Some(upstream), false) => {
        tracing::trace!("[recorder] {} via upstream {}", target.authority(), upstream.host());
        Ok(OutboundStream::Tcp(
          self.connector.connect(upstream.host(), upstream.port()).await?,
        ))
      }
      (Some(upstream), true) => self.tunnel(upstream, target, cancel).await,
    }
  }

  async fn tunnel(
    &self,
    upstream: &UpstreamProxy,
    target: &Target,
    cancel: &CancellationToken,
  ) -> Result<OutboundStream> {
    let mut tcp: TcpStream = self
      .connector
      .connect(upstream.host(), upstream.tunnel_port())
      .await?;
    tcp.write_all(&connect_preamble(upstream, &target.authority())).await?;
    tcp.flush().await?;
    let (gate, handle) = OutboundGate::new(tcp);
    let name = server_name(target.host())?;
    tokio::select! {
      _ = cancel.cancelled() => {
        handle.close();
        Err(Error::Cancelled)
      }
      tls = self.tls.connect(name, gate) => match tls {
        Ok(tls) => Ok(OutboundStream::Tunnel(Box::new(tls))),
        Err(e) => {
          handle.close();
          Err(Error::upstream_error(format!("tunnel to {} failed: {}", target.authority(), e)))
        }
      }
    }
  }

  /// Writes the request bytes exactly as received.
  pub async fn forward(&self, outbound: &mut OutboundStream, request: &RawRequest) -> Result<()> {
    outbound.write_all(&request.head.raw).await?;
    outbound.write_all(&request.body.wire).await?;
    outbound.flush().await?;
    Ok(())
  }
}

fn connect_preamble(upstream: &UpstreamProxy, authority: &str) -> Bytes {
  let mut raw = BytesMut::with_capacity(128);
  raw.put_slice(format!("CONNECT {} HTTP/1.1\r\n", authority).as_bytes());
  raw.put_slice(format!("Host: {}\r\n", authority).as_bytes());
  raw.put_slice(b"Proxy-Connection: Keep-Alive\r\n");
  if let Some(auth) = upstream.authorization() {
    raw.put_slice(b"Proxy-Authorization: ");
    raw.put_slice(auth.as_bytes());
    raw.put_slice(b"\r\n");
  }
  raw.put_slice(b"\r\n");
  raw.freeze()
}

/// Relays responses to the browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseForwarder;

impl ResponseForwarder {
  /// Writes interim heads, the final head and the body exactly as received.
  pub async fn relay<W>(&self, browser: &mut W, response: &RawResponse) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    for interim in &response.interim {
      browser.write_all(&interim.raw).await?;
    }
    browser.write_all(&response.head.raw).await?;
    browser.write_all(&response.body.wire).await?;
    browser.flush().await?;
    Ok(())
  }
}
