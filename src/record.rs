//! Records of the traffic seen by the proxy
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, StatusCode, Version};
use percent_encoding::percent_decode_str;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header fields in wire order, duplicates preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(HeaderName, HeaderValue)>);

impl Headers {
  /// empty header list
  pub fn new() -> Self {
    Self::default()
  }
  /// Appends a field.
  pub fn push(&mut self, name: HeaderName, value: HeaderValue) {
    self.0.push((name, value));
  }
  /// First value of `name`
  pub fn get(&self, name: impl AsRef<str>) -> Option<&HeaderValue> {
    self.get_all(name).next()
  }
  /// Every value of `name`, in wire order
  pub fn get_all(&self, name: impl AsRef<str>) -> impl Iterator<Item = &HeaderValue> {
    let name = name.as_ref().to_ascii_lowercase();
    self
      .0
      .iter()
      .filter(move |(k, _)| k.as_str() == name)
      .map(|(_, v)| v)
  }
  /// `true` if one of the comma separated values of `name` equals `token`,
  /// ignoring ASCII case
  pub fn has_token(&self, name: impl AsRef<str>, token: &str) -> bool {
    self.get_all(name).any(|value| {
      value
        .to_str()
        .map(|value| {
          value
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
    })
  }
  /// iterate over fields
  pub fn iter(&self) -> impl Iterator<Item = &(HeaderName, HeaderValue)> {
    self.0.iter()
  }
  /// number of fields
  pub fn len(&self) -> usize {
    self.0.len()
  }
  /// `true` without any field
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl FromIterator<(HeaderName, HeaderValue)> for Headers {
  fn from_iter<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Headers {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
    for (name, value) in &self.0 {
      seq.serialize_element(&(name.as_str(), String::from_utf8_lossy(value.as_bytes())))?;
    }
    seq.end()
  }
}

#[cfg(feature = "serde")]
fn serialize_body<S: serde::Serializer>(
  body: &Option<Bytes>,
  serializer: S,
) -> Result<S::Ok, S::Error> {
  match body {
    Some(body) => serializer.serialize_some(&body[..]),
    None => serializer.serialize_none(),
  }
}

pub(crate) fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_millis() as u64)
    .unwrap_or_default()
}

/// A request as the browser sent it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CapturedRequest {
  /// unique per server, used to correlate the response
  pub id: u64,
  /// session the request arrived on
  pub session_id: u64,
  /// request method
  #[cfg_attr(feature = "serde", serde(with = "http_serde::method"))]
  pub method: Method,
  /// absolute target URL
  pub url: String,
  /// protocol version
  #[cfg_attr(feature = "serde", serde(with = "http_serde::version"))]
  pub version: Version,
  /// header fields
  pub headers: Headers,
  /// de-chunked, possibly decompressed body
  #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_body"))]
  pub body: Option<Bytes>,
  /// milliseconds since the Unix epoch
  pub timestamp: u64,
}

impl CapturedRequest {
  /// Decoded `application/x-www-form-urlencoded` body parameters, in order.
  ///
  /// Empty when the request is not a form submission.
  pub fn form_params(&self) -> Vec<(String, String)> {
    let is_form = self
      .headers
      .get(http::header::CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .map(|value| {
        value
          .to_ascii_lowercase()
          .starts_with("application/x-www-form-urlencoded")
      })
      .unwrap_or(false);
    match (&self.body, is_form) {
      (Some(body), true) => parse_form(body),
      _ => Vec::new(),
    }
  }

  /// Credentials of an `Authorization: Basic` header.
  pub fn basic_auth(&self) -> Option<(String, String)> {
    use base64::prelude::{Engine, BASE64_STANDARD};
    let value = self.headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
      return None;
    }
    let decoded = BASE64_STANDARD.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
  }

  /// Body as text, lossily decoded
  pub fn text(&self) -> Option<String> {
    self
      .body
      .as_ref()
      .map(|body| String::from_utf8_lossy(body).into_owned())
  }
}

fn parse_form(body: &[u8]) -> Vec<(String, String)> {
  let decode = |raw: &str| percent_decode_str(&raw.replace('+', " ")).decode_utf8_lossy().into_owned();
  String::from_utf8_lossy(body)
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| match pair.split_once('=') {
      Some((name, value)) => (decode(name), decode(value)),
      None => (decode(pair), String::new()),
    })
    .collect()
}

/// A response as the origin sent it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CapturedResponse {
  /// id of the request this answers
  pub request_id: u64,
  /// final status
  #[cfg_attr(feature = "serde", serde(with = "http_serde::status_code"))]
  pub status: StatusCode,
  /// protocol version
  #[cfg_attr(feature = "serde", serde(with = "http_serde::version"))]
  pub version: Version,
  /// header fields
  pub headers: Headers,
  /// de-chunked, possibly decompressed body
  #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_body"))]
  pub body: Option<Bytes>,
  /// milliseconds since the Unix epoch
  pub timestamp: u64,
}

/// A free text label inserted into the recording.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TagMarker {
  /// label
  pub label: String,
  /// milliseconds since the Unix epoch
  pub timestamp: u64,
}

impl TagMarker {
  /// new tag stamped now
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      timestamp: now_millis(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(headers: Headers, body: &'static [u8]) -> CapturedRequest {
    CapturedRequest {
      id: 1,
      session_id: 1,
      method: Method::POST,
      url: "http://localhost/login".to_string(),
      version: Version::HTTP_11,
      headers,
      body: Some(Bytes::from_static(body)),
      timestamp: now_millis(),
    }
  }

  #[test]
  fn headers_keep_order_and_duplicates() {
    let headers: Headers = vec![
      (http::header::SET_COOKIE, HeaderValue::from_static("a=1")),
      (http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain")),
      (http::header::SET_COOKIE, HeaderValue::from_static("b=2")),
    ]
    .into_iter()
    .collect();
    let cookies: Vec<_> = headers.get_all("Set-Cookie").collect();
    assert_eq!(cookies, ["a=1", "b=2"]);
    assert_eq!(headers.iter().nth(1).unwrap().0, http::header::CONTENT_TYPE);
  }

  #[test]
  fn connection_tokens() {
    let headers: Headers = vec![(
      http::header::CONNECTION,
      HeaderValue::from_static("Keep-Alive, Upgrade"),
    )]
    .into_iter()
    .collect();
    assert!(headers.has_token("connection", "upgrade"));
    assert!(!headers.has_token("connection", "close"));
  }

  #[test]
  fn form_params_are_decoded() {
    let headers: Headers = vec![(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
    )]
    .into_iter()
    .collect();
    let request = request(headers, b"user=jane+doe&pass=p%40ss&flag");
    assert_eq!(
      request.form_params(),
      vec![
        ("user".to_string(), "jane doe".to_string()),
        ("pass".to_string(), "p@ss".to_string()),
        ("flag".to_string(), String::new()),
      ]
    );
  }

  #[test]
  fn form_params_require_form_content_type() {
    let request = request(Headers::new(), b"user=jane");
    assert!(request.form_params().is_empty());
  }

  #[test]
  fn basic_auth_is_decoded() {
    let headers: Headers = vec![(
      http::header::AUTHORIZATION,
      HeaderValue::from_static("Basic dXNlcjpwYTpzcw=="),
    )]
    .into_iter()
    .collect();
    let request = request(headers, b"");
    assert_eq!(
      request.basic_auth(),
      Some(("user".to_string(), "pa:ss".to_string()))
    );
    assert_eq!(self::request(Headers::new(), b"").basic_auth(), None);
  }

  #[cfg(feature = "serde")]
  #[test]
  fn serializes_to_json() {
    let headers: Headers = vec![(http::header::HOST, HeaderValue::from_static("localhost"))]
      .into_iter()
      .collect();
    let value = serde_json::to_value(request(headers, b"ok")).unwrap();
    assert_eq!(value["method"], "POST");
    assert_eq!(value["version"], "HTTP/1.1");
    assert_eq!(value["headers"][0][0], "host");
    assert_eq!(value["body"], serde_json::json!([111, 107]));
  }
}
