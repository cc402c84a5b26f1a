//! Per-connection processing stages
//!
//! A pipeline is the ordered list of stages a message goes through on one
//! side of the proxy. The factory builds them per session; building an
//! inbound TLS pipeline fails when no identity can be presented for the
//! target host, which closes the session before the CONNECT is answered.
use crate::codec::{decode_content, Decoder, RawRequest, RawResponse};
use crate::config::ProxyConfig;
use crate::errors::Result;
use crate::identity::TlsIdentityProvider;
use crate::record::{now_millis, CapturedRequest, CapturedResponse, Headers};
use crate::session::TransportMode;
use bytes::Bytes;
use http::Method;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio_rustls::TlsAcceptor;

/// One processing step.
///
/// A pipeline's stage list describes the order a session runs its steps in.
/// It is informational: the session loop drives the steps itself and does
/// not dispatch on the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  /// TLS termination (inbound) or origination (outbound)
  Tls,
  /// request line and header parsing
  RequestDecoder,
  /// status line and header parsing
  ResponseDecoder,
  /// body aggregation up to `max` bytes
  BodyAggregator {
    /// limit in bytes
    max: usize,
  },
  /// removes `Content-Encoding` from captured bodies
  ContentDecompressor,
  /// publishes the captured message
  EventCapture,
  /// forwards the request to the origin
  Forwarder,
  /// relays the response to the browser
  Relay,
}

/// Builds the inbound and outbound pipelines of each session.
#[derive(Debug, Clone)]
pub struct PipelineFactory {
  decoder: Decoder,
  decompress: bool,
  identities: Arc<TlsIdentityProvider>,
}

impl PipelineFactory {
  /// factory sharing `identities`
  pub fn new(config: &ProxyConfig, identities: Arc<TlsIdentityProvider>) -> Self {
    Self {
      decoder: Decoder::new(config.max_head_size, config.max_body_size),
      decompress: config.decompress_captured_bodies,
      identities,
    }
  }

  /// Browser side pipeline. `host` is the CONNECT target in tunnel mode.
  pub async fn inbound(&self, mode: TransportMode, host: Option<&str>) -> Result<InboundPipeline> {
    let acceptor = match mode {
      TransportMode::Plaintext => None,
      TransportMode::TlsTunnel => Some(self.identities.acceptor_for(host.unwrap_or_default()).await?),
    };
    let mut stages = Vec::with_capacity(6);
    if acceptor.is_some() {
      stages.push(Stage::Tls);
    }
    stages.extend([
      Stage::RequestDecoder,
      Stage::BodyAggregator {
        max: self.decoder.max_body(),
      },
    ]);
    if self.decompress {
      stages.push(Stage::ContentDecompressor);
    }
    stages.extend([Stage::EventCapture, Stage::Forwarder]);
    Ok(InboundPipeline {
      stages,
      acceptor,
      decoder: self.decoder,
      decompress: self.decompress,
    })
  }

  /// Origin side pipeline.
  pub fn outbound(&self, tls: bool) -> OutboundPipeline {
    let mut stages = Vec::with_capacity(6);
    if tls {
      stages.push(Stage::Tls);
    }
    stages.extend([
      Stage::ResponseDecoder,
      Stage::BodyAggregator {
        max: self.decoder.max_body(),
      },
    ]);
    if self.decompress {
      stages.push(Stage::ContentDecompressor);
    }
    stages.extend([Stage::EventCapture, Stage::Relay]);
    OutboundPipeline {
      stages,
      decoder: self.decoder,
      decompress: self.decompress,
    }
  }
}

fn captured_body(decompress: bool, headers: &Headers, content: &Bytes, limit: usize) -> Option<Bytes> {
  if content.is_empty() {
    None
  } else if decompress {
    Some(decode_content(headers, content, limit))
  } else {
    Some(content.clone())
  }
}

/// Browser side stages of a session.
#[derive(Clone)]
pub struct InboundPipeline {
  stages: Vec<Stage>,
  acceptor: Option<TlsAcceptor>,
  decoder: Decoder,
  decompress: bool,
}

impl std::fmt::Debug for InboundPipeline {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InboundPipeline")
      .field("stages", &self.stages)
      .field("decoder", &self.decoder)
      .finish()
  }
}

impl InboundPipeline {
  /// stages in processing order, for inspection only
  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  /// acceptor of the `Tls` stage
  pub fn acceptor(&self) -> Option<&TlsAcceptor> {
    self.acceptor.as_ref()
  }

  /// Decodes and aggregates the next request.
  pub async fn read_request<R>(&self, reader: &mut R) -> Result<Option<RawRequest>>
  where
    R: AsyncBufRead + Unpin,
  {
    self.decoder.read_request(reader).await
  }

  /// Builds the record published before `request` is forwarded.
  pub fn capture(&self, request: &RawRequest, id: u64, session_id: u64, url: String) -> CapturedRequest {
    CapturedRequest {
      id,
      session_id,
      method: request.head.method.clone(),
      url,
      version: request.head.version,
      headers: request.head.headers.clone(),
      body: captured_body(
        self.decompress,
        &request.head.headers,
        &request.body.content,
        self.decoder.max_body(),
      ),
      timestamp: now_millis(),
    }
  }
}

/// Origin side stages of an exchange.
#[derive(Debug, Clone)]
pub struct OutboundPipeline {
  stages: Vec<Stage>,
  decoder: Decoder,
  decompress: bool,
}

impl OutboundPipeline {
  /// stages in processing order, for inspection only
  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  /// Decodes and aggregates the response to a `method` request.
  pub async fn read_response<R>(&self, reader: &mut R, method: &Method) -> Result<RawResponse>
  where
    R: AsyncBufRead + Unpin,
  {
    self.decoder.read_response(reader, method).await
  }

  /// Builds the record published once `response` was relayed.
  pub fn capture(&self, response: &RawResponse, request_id: u64) -> CapturedResponse {
    CapturedResponse {
      request_id,
      status: response.head.status,
      version: response.head.version,
      headers: response.head.headers.clone(),
      body: captured_body(
        self.decompress,
        &response.head.headers,
        &response.body.content,
        self.decoder.max_body(),
      ),
      timestamp: now_millis(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::identity::HostIdentity;
  use tokio::io::BufReader;
  use tokio_rustls::rustls;

  fn factory(fallback: Option<HostIdentity>, decompress: bool) -> PipelineFactory {
    let config = ProxyConfig::default()
      .max_body_size(1024)
      .decompress_captured_bodies(decompress);
    let client = rustls::ClientConfig::builder()
      .with_root_certificates(rustls::RootCertStore::empty())
      .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client));
    let identities = TlsIdentityProvider::new(Vec::new(), fallback, connector);
    PipelineFactory::new(&config, Arc::new(identities))
  }

  #[tokio::test]
  async fn plaintext_stages() {
    let pipeline = factory(None, true)
      .inbound(TransportMode::Plaintext, None)
      .await
      .unwrap();
    assert_eq!(
      pipeline.stages(),
      [
        Stage::RequestDecoder,
        Stage::BodyAggregator { max: 1024 },
        Stage::ContentDecompressor,
        Stage::EventCapture,
        Stage::Forwarder,
      ]
    );
    assert!(pipeline.acceptor().is_none());
  }

  #[tokio::test]
  async fn tunnel_stages_start_with_tls() {
    let identity = HostIdentity::self_signed(vec!["localhost".to_string()]).unwrap();
    let pipeline = factory(Some(identity), false)
      .inbound(TransportMode::TlsTunnel, Some("localhost"))
      .await
      .unwrap();
    assert_eq!(pipeline.stages()[0], Stage::Tls);
    assert!(!pipeline.stages().contains(&Stage::ContentDecompressor));
    assert!(pipeline.acceptor().is_some());
  }

  #[tokio::test]
  async fn tunnel_without_identity_fails() {
    let result = factory(None, true)
      .inbound(TransportMode::TlsTunnel, Some("example.com"))
      .await;
    assert!(result.is_err());
  }

  #[test]
  fn outbound_stages() {
    let pipeline = factory(None, true).outbound(true);
    assert_eq!(
      pipeline.stages(),
      [
        Stage::Tls,
        Stage::ResponseDecoder,
        Stage::BodyAggregator { max: 1024 },
        Stage::ContentDecompressor,
        Stage::EventCapture,
        Stage::Relay,
      ]
    );
    assert_eq!(factory(None, true).outbound(false).stages()[0], Stage::ResponseDecoder);
  }

  #[tokio::test]
  async fn captured_request_body_is_decompressed() {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(b"a=1&b=2").unwrap();
    let body = encoder.finish().unwrap();
    let mut raw = format!(
      "POST /form HTTP/1.1\r\nHost: localhost\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      body.len()
    )
    .into_bytes();
    raw.extend_from_slice(&body);

    let pipeline = factory(None, true)
      .inbound(TransportMode::Plaintext, None)
      .await
      .unwrap();
    let request = pipeline
      .read_request(&mut BufReader::new(&raw[..]))
      .await
      .unwrap()
      .unwrap();
    let captured = pipeline.capture(&request, 7, 1, "http://localhost/form".to_string());
    assert_eq!(captured.id, 7);
    assert_eq!(captured.body.as_deref(), Some(&b"a=1&b=2"[..]));
    assert_eq!(&request.body.wire[..], &body[..]);
  }
}
