//! TLS identities presented to the browser and the connector used toward origins
//!
use crate::config::{IdentityConfig, ProxyConfig};
use crate::errors::{Error, Result};
use crate::matcher::{domain, is_authoritative};
use moka::future::Cache;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const ALPN_HTTP1: &[u8] = b"http/1.1";
const IDENTITY_CACHE_CAPACITY: u64 = 1000;

fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// A certificate chain and key, with the host names it may be presented for.
pub struct HostIdentity {
  names: Vec<String>,
  certs: Vec<CertificateDer<'static>>,
  acceptor: TlsAcceptor,
}

impl fmt::Debug for HostIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HostIdentity")
      .field("names", &self.names)
      .field("certs", &self.certs.len())
      .finish()
  }
}

impl HostIdentity {
  /// Build an identity from a DER chain (leaf first) and its private key.
  pub fn new(
    names: Vec<String>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
  ) -> Result<Self> {
    if certs.is_empty() {
      return Err(Error::certificate_error("identity without certificate"));
    }
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()?
      .with_no_client_auth()
      .with_single_cert(certs.clone(), key)
      .map_err(|e| Error::certificate_error(format!("failed to create TLS config: {}", e)))?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Self {
      names,
      certs,
      acceptor: TlsAcceptor::from(Arc::new(config)),
    })
  }

  /// Parses a PEM buffer holding at least one certificate and one private key.
  ///
  /// The private key may be PKCS#1, PKCS#8 or SEC1 encoded.
  pub fn from_pem(buf: &[u8], names: Vec<String>) -> Result<Self> {
    use rustls_pemfile::Item;
    use std::io::Cursor;

    let mut pem = Cursor::new(buf);
    let mut keys = Vec::<PrivateKeyDer<'static>>::new();
    let mut certs = Vec::<CertificateDer<'static>>::new();
    for result in rustls_pemfile::read_all(&mut pem) {
      match result {
        Ok(Item::X509Certificate(cert)) => certs.push(cert),
        Ok(Item::Pkcs1Key(key)) => keys.push(key.into()),
        Ok(Item::Pkcs8Key(key)) => keys.push(key.into()),
        Ok(Item::Sec1Key(key)) => keys.push(key.into()),
        Ok(_) => {}
        Err(_) => return Err(Error::certificate_error("invalid identity PEM file")),
      }
    }
    match (keys.pop(), certs.first()) {
      (Some(key), Some(leaf)) => {
        let names = identity_names(leaf, names)?;
        Self::new(names, certs, key)
      }
      _ => Err(Error::certificate_error(
        "private key or certificate not found",
      )),
    }
  }

  /// Loads the certificate and key files named by `config`.
  pub async fn load(config: &IdentityConfig) -> Result<Self> {
    let mut buf = read_file(&config.cert_path).await?;
    buf.push(b'\n');
    buf.extend(read_file(&config.key_path).await?);
    Self::from_pem(&buf, config.names.clone())
  }

  /// Self-signs a fresh identity for `names`.
  pub fn self_signed(names: Vec<String>) -> Result<Self> {
    let key_pair = rcgen::KeyPair::generate()?;
    let cert = rcgen::CertificateParams::new(names.clone())?.self_signed(&key_pair)?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("failed to serialize generated key"))?;
    tracing::info!("[recorder] generated self-signed identity for {:?}", names);
    Self::new(names, vec![cert.der().clone()], key)
  }

  /// Names this identity was issued for
  pub fn names(&self) -> &[String] {
    &self.names
  }

  /// Certificate chain, leaf first
  pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
    &self.certs
  }

  /// `true` when one of the names is authoritative for `host`
  pub fn covers(&self, host: &str) -> bool {
    self.names.iter().any(|name| is_authoritative(name, host))
  }

  /// Acceptor presenting this identity, no client authentication, ALPN `http/1.1`
  pub fn acceptor(&self) -> TlsAcceptor {
    self.acceptor.clone()
  }
}

/// DNS and IP subject alternative names of a DER certificate
fn certificate_names(cert: &CertificateDer<'_>) -> Result<Vec<String>> {
  let params = rcgen::CertificateParams::from_ca_cert_der(cert)?;
  Ok(
    params
      .subject_alt_names
      .iter()
      .filter_map(|san| match san {
        rcgen::SanType::DnsName(name) => Some(name.as_str().to_string()),
        rcgen::SanType::IpAddress(ip) => Some(ip.to_string()),
        _ => None,
      })
      .collect(),
  )
}

/// Names an identity is presented for.
///
/// The leaf's SANs are used as they are when nothing is configured.
/// Configured names restrict the identity to the ones the leaf covers.
fn identity_names(leaf: &CertificateDer<'_>, configured: Vec<String>) -> Result<Vec<String>> {
  let sans = certificate_names(leaf)?;
  if sans.is_empty() {
    if configured.is_empty() {
      return Err(Error::certificate_error(
        "certificate has no subject alternative names",
      ));
    }
    tracing::warn!(
      "[recorder] certificate has no subject alternative names, using {:?}",
      configured
    );
    return Ok(configured);
  }
  if configured.is_empty() {
    return Ok(sans);
  }
  let (covered, dropped): (Vec<String>, Vec<String>) = configured.into_iter().partition(|name| {
    sans
      .iter()
      .any(|san| san.eq_ignore_ascii_case(name) || is_authoritative(san, name))
  });
  if !dropped.is_empty() {
    tracing::warn!(
      "[recorder] names {:?} are not covered by the certificate {:?}",
      dropped,
      sans
    );
  }
  if covered.is_empty() {
    return Err(Error::certificate_error(format!(
      "none of the configured names is covered by the certificate {:?}",
      sans
    )));
  }
  Ok(covered)
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
  tokio::fs::read(path)
    .await
    .map_err(|e| Error::certificate_error(format!("failed to read {}: {}", path.display(), e)))
}

/// Selects the identity presented to the browser for each intercepted host.
///
/// Configured identities are tried in order; the first one with a name that
/// is authoritative for the host wins, otherwise the fallback is used.
pub struct TlsIdentityProvider {
  identities: Vec<Arc<HostIdentity>>,
  fallback: Option<Arc<HostIdentity>>,
  cache: Cache<String, Arc<HostIdentity>>,
  connector: TlsConnector,
}

impl fmt::Debug for TlsIdentityProvider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TlsIdentityProvider")
      .field("identities", &self.identities)
      .field("fallback", &self.fallback)
      .finish()
  }
}

impl TlsIdentityProvider {
  /// new provider
  pub fn new(
    identities: Vec<HostIdentity>,
    fallback: Option<HostIdentity>,
    connector: TlsConnector,
  ) -> Self {
    Self {
      identities: identities.into_iter().map(Arc::new).collect(),
      fallback: fallback.map(Arc::new),
      cache: Cache::builder()
        .max_capacity(IDENTITY_CACHE_CAPACITY)
        .build(),
      connector,
    }
  }

  /// Loads identities and builds the origin connector from the configuration.
  pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
    let mut identities = Vec::with_capacity(config.identities.len());
    for identity in &config.identities {
      identities.push(HostIdentity::load(identity).await?);
    }
    let fallback = match &config.fallback_identity {
      Some(identity) => Some(HostIdentity::load(identity).await?),
      None if config.generate_fallback_identity => {
        Some(HostIdentity::self_signed(config.fallback_names.clone())?)
      }
      None => None,
    };
    let connector = origin_connector(config).await?;
    Ok(Self::new(identities, fallback, connector))
  }

  /// Identity to present for `host`, memoized per normalized host name
  pub async fn identity_for(&self, host: &str) -> Option<Arc<HostIdentity>> {
    let host = domain(host);
    if let Some(hit) = self.cache.get(host).await {
      return Some(hit);
    }
    let selected = self
      .identities
      .iter()
      .find(|identity| identity.covers(host))
      .or(self.fallback.as_ref())
      .cloned()?;
    self.cache.insert(host.to_string(), selected.clone()).await;
    Some(selected)
  }

  /// Acceptor for `host`, or [`Error::Certificate`] when no identity is available
  pub async fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor> {
    match self.identity_for(host).await {
      Some(identity) => Ok(identity.acceptor()),
      None => Err(Error::certificate_error(format!(
        "no TLS identity available for {}",
        host
      ))),
    }
  }

  /// Fallback identity, if any
  pub fn fallback(&self) -> Option<&Arc<HostIdentity>> {
    self.fallback.as_ref()
  }

  /// Connector used for TLS toward origins
  pub fn connector(&self) -> TlsConnector {
    self.connector.clone()
  }

  /// Forget memoized selections
  pub fn clear_cache(&self) {
    self.cache.invalidate_all();
  }
}

/// Builds the connector used toward origins: platform roots plus the extra
/// configured bundles, or no verification at all when configured so.
pub async fn origin_connector(config: &ProxyConfig) -> Result<TlsConnector> {
  let provider = crypto_provider();
  let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
    .with_safe_default_protocol_versions()?;
  let mut tls = if config.accept_invalid_origin_certs {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
      .with_no_client_auth()
  } else {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
      tracing::debug!("[recorder] skipping platform root: {}", error);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!("[recorder] {} platform roots, {} ignored", added, ignored);
    for path in &config.extra_root_certificates {
      let pem = read_file(path).await?;
      for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|_| Error::certificate_error("invalid certificate encoding"))?;
        roots.add(cert)?;
      }
    }
    builder
      .with_root_certificates(roots)
      .with_no_client_auth()
  };
  tls.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(TlsConnector::from(Arc::new(tls)))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(domain(host).to_owned())
    .map_err(|e| Error::connection_error(format!("invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
struct NoVerifier {
  provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self
      .provider
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn provider_with(identities: Vec<HostIdentity>, fallback: Option<HostIdentity>) -> TlsIdentityProvider {
    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_root_certificates(RootCertStore::empty())
      .with_no_client_auth();
    TlsIdentityProvider::new(identities, fallback, TlsConnector::from(Arc::new(config)))
  }

  #[tokio::test]
  async fn first_covering_identity_wins() {
    let wildcard = HostIdentity::self_signed(vec!["*.example.com".to_string()]).unwrap();
    let exact = HostIdentity::self_signed(vec!["api.example.com".to_string()]).unwrap();
    let fallback = HostIdentity::self_signed(vec!["localhost".to_string()]).unwrap();
    let provider = provider_with(vec![wildcard, exact], Some(fallback));

    let selected = provider.identity_for("api.example.com").await.unwrap();
    assert_eq!(selected.names(), ["*.example.com".to_string()]);
    let selected = provider.identity_for("example.org").await.unwrap();
    assert_eq!(selected.names(), ["localhost".to_string()]);
  }

  #[tokio::test]
  async fn trailing_dot_is_normalized() {
    let wildcard = HostIdentity::self_signed(vec!["*.example.com".to_string()]).unwrap();
    let provider = provider_with(vec![wildcard], None);
    assert!(provider.identity_for("www.example.com.").await.is_some());
    assert!(provider.identity_for("www.example.com").await.is_some());
  }

  #[tokio::test]
  async fn missing_identity_is_a_certificate_error() {
    let provider = provider_with(Vec::new(), None);
    assert!(provider.identity_for("example.com").await.is_none());
    let result = provider.acceptor_for("example.com").await;
    assert!(matches!(result, Err(Error::Certificate(_))));
  }

  #[test]
  fn identity_from_pem() {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["pem.test".to_string()])
      .unwrap()
      .self_signed(&key_pair)
      .unwrap();
    let pem = format!("{}\n{}", cert.pem(), key_pair.serialize_pem());
    let identity = HostIdentity::from_pem(pem.as_bytes(), vec!["pem.test".to_string()]).unwrap();
    assert!(identity.covers("pem.test"));
    assert_eq!(identity.certificate_chain().len(), 1);
    assert!(HostIdentity::from_pem(cert.pem().as_bytes(), Vec::new()).is_err());
  }

  fn pem_for(names: &[&str]) -> String {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let names = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
    let cert = rcgen::CertificateParams::new(names)
      .unwrap()
      .self_signed(&key_pair)
      .unwrap();
    format!("{}\n{}", cert.pem(), key_pair.serialize_pem())
  }

  #[test]
  fn names_come_from_the_certificate() {
    let pem = pem_for(&["localhost", "127.0.0.1"]);
    let identity = HostIdentity::from_pem(pem.as_bytes(), Vec::new()).unwrap();
    assert_eq!(identity.names(), ["localhost", "127.0.0.1"]);
    assert!(identity.covers("localhost"));
    assert!(!identity.covers("example.com"));
  }

  #[test]
  fn configured_names_must_be_covered() {
    let pem = pem_for(&["localhost"]);
    assert!(HostIdentity::from_pem(pem.as_bytes(), vec!["*.example.com".to_string()]).is_err());

    let pem = pem_for(&["*.example.com"]);
    let identity = HostIdentity::from_pem(
      pem.as_bytes(),
      vec!["api.example.com".to_string(), "other.test".to_string()],
    )
    .unwrap();
    assert_eq!(identity.names(), ["api.example.com"]);
    assert!(identity.covers("api.example.com"));
    assert!(!identity.covers("www.example.com"));
  }
}
