//! HTTP/1.1 message framing
//!
//! Messages are read head first, then the body is aggregated according to its
//! framing. The exact bytes received are kept next to the parsed form so that
//! forwarding and relaying stay byte-identical.
use crate::errors::{new_io_error, Error, Result};
use crate::record::Headers;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::{HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io::{ErrorKind, Read};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_CHUNK_LINE: usize = 4096;

/// Request line and header section.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
  /// method
  pub method: Method,
  /// request target as sent (origin, absolute or authority form)
  pub target: String,
  /// version
  pub version: Version,
  /// header fields
  pub headers: Headers,
  /// the head exactly as received, terminating empty line included
  pub raw: Bytes,
}

impl RequestHead {
  /// Whether the browser allows the connection to be reused
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

/// Status line and header section.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
  /// version
  pub version: Version,
  /// status
  pub status: StatusCode,
  /// header fields
  pub headers: Headers,
  /// the head exactly as received
  pub raw: Bytes,
}

impl ResponseHead {
  /// 1xx other than `101 Switching Protocols`
  pub fn is_interim(&self) -> bool {
    self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
  }
}

fn keep_alive(version: Version, headers: &Headers) -> bool {
  if headers.has_token(http::header::CONNECTION, "close") {
    false
  } else if version == Version::HTTP_10 {
    headers.has_token(http::header::CONNECTION, "keep-alive")
  } else {
    true
  }
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
  /// no body
  Empty,
  /// `Content-Length`
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// read until the peer closes
  UntilClose,
}

/// An aggregated body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBody {
  /// bytes as received, chunk framing included
  pub wire: Bytes,
  /// payload with the transfer coding removed
  pub content: Bytes,
}

/// A complete request.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
  /// head
  pub head: RequestHead,
  /// body framing
  pub kind: BodyKind,
  /// body
  pub body: RawBody,
}

/// A complete response, with the interim heads that preceded it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
  /// `1xx` heads in arrival order
  pub interim: Vec<ResponseHead>,
  /// final head
  pub head: ResponseHead,
  /// body framing
  pub kind: BodyKind,
  /// body
  pub body: RawBody,
}

impl RawResponse {
  /// Whether the connection may carry another exchange afterwards
  pub fn keep_alive(&self) -> bool {
    self.kind != BodyKind::UntilClose && keep_alive(self.head.version, &self.head.headers)
  }
}

/// Reads HTTP/1.x messages under size limits.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
  max_head: usize,
  max_body: usize,
}

impl Decoder {
  /// decoder with the given limits
  pub fn new(max_head: usize, max_body: usize) -> Self {
    Self { max_head, max_body }
  }

  /// aggregated body limit
  pub fn max_body(&self) -> usize {
    self.max_body
  }

  /// Reads the next request. `None` when the peer closed between requests.
  pub async fn read_request<R>(&self, reader: &mut R) -> Result<Option<RawRequest>>
  where
    R: AsyncBufRead + Unpin,
  {
    let head = match self.read_request_head(reader).await? {
      Some(head) => head,
      None => return Ok(None),
    };
    let kind = request_body_kind(&head)?;
    let body = self.read_body(reader, kind).await?;
    Ok(Some(RawRequest { head, kind, body }))
  }

  /// Reads a response to a `method` request, interim heads included.
  pub async fn read_response<R>(&self, reader: &mut R, method: &Method) -> Result<RawResponse>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut interim = Vec::new();
    loop {
      let head = self.read_response_head(reader).await?;
      if head.is_interim() {
        tracing::trace!("[recorder] interim response {}", head.status);
        interim.push(head);
        continue;
      }
      let kind = response_body_kind(method, &head)?;
      let body = self.read_body(reader, kind).await?;
      return Ok(RawResponse {
        interim,
        head,
        kind,
        body,
      });
    }
  }

  /// Reads a request head, skipping empty lines before the request line.
  pub async fn read_request_head<R>(&self, reader: &mut R) -> Result<Option<RequestHead>>
  where
    R: AsyncBufRead + Unpin,
  {
    let raw = match self.read_head(reader).await? {
      Some(raw) => raw,
      None => return Ok(None),
    };
    let mut lines = raw.split(|b| *b == b'\n').map(trim_line);
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(|b| *b == b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(method), Some(target), Some(version), None) if !method.is_empty() && !target.is_empty() => {
        (method, target, version)
      }
      _ => {
        return Err(Error::invalid_request(format!(
          "malformed request line {:?}",
          String::from_utf8_lossy(request_line)
        )))
      }
    };
    let method = Method::from_bytes(method)
      .map_err(|e| Error::invalid_request(format!("invalid method: {}", e)))?;
    let target = std::str::from_utf8(target)
      .map_err(|_| Error::invalid_request("request target is not valid UTF-8"))?
      .to_string();
    let version = parser_version(version)?;
    let headers = parser_headers(lines)?;
    Ok(Some(RequestHead {
      method,
      target,
      version,
      headers,
      raw: Bytes::from(raw),
    }))
  }

  /// Reads a status line and header section.
  pub async fn read_response_head<R>(&self, reader: &mut R) -> Result<ResponseHead>
  where
    R: AsyncBufRead + Unpin,
  {
    let raw = self.read_head(reader).await?.ok_or_else(|| {
      new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed before the response",
      )
    })?;
    let mut lines = raw.split(|b| *b == b'\n').map(trim_line);
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, |b| *b == b' ');
    let version = parser_version(parts.next().unwrap_or_default())?;
    let status = StatusCode::from_bytes(parts.next().unwrap_or_default())
      .map_err(|e| Error::invalid_request(format!("invalid status code: {}", e)))?;
    let headers = parser_headers(lines)?;
    Ok(ResponseHead {
      version,
      status,
      headers,
      raw: Bytes::from(raw),
    })
  }

  async fn read_head<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut raw = Vec::new();
    loop {
      if read_line(reader, &mut raw, self.max_head).await? == 0 {
        return Ok(None);
      }
      if trim_line(&raw).is_empty() {
        raw.clear();
        continue;
      }
      break;
    }
    loop {
      let start = raw.len();
      let limit = self.max_head.saturating_sub(start);
      if read_line(reader, &mut raw, limit).await? == 0 {
        return Err(new_io_error(
          ErrorKind::UnexpectedEof,
          "connection closed inside the header section",
        ));
      }
      if trim_line(&raw[start..]).is_empty() {
        return Ok(Some(raw));
      }
    }
  }

  /// Aggregates a body framed as `kind`.
  pub async fn read_body<R>(&self, reader: &mut R, kind: BodyKind) -> Result<RawBody>
  where
    R: AsyncBufRead + Unpin,
  {
    match kind {
      BodyKind::Empty | BodyKind::Length(0) => Ok(RawBody::default()),
      BodyKind::Length(length) => {
        if length > self.max_body as u64 {
          return Err(self.too_large());
        }
        let mut body = vec![0; length as usize];
        reader.read_exact(&mut body).await?;
        let body = Bytes::from(body);
        Ok(RawBody {
          wire: body.clone(),
          content: body,
        })
      }
      BodyKind::Chunked => self.read_chunked_body(reader).await,
      BodyKind::UntilClose => {
        let mut body = Vec::new();
        AsyncReadExt::take(&mut *reader, (self.max_body as u64).saturating_add(1))
          .read_to_end(&mut body)
          .await?;
        if body.len() > self.max_body {
          return Err(self.too_large());
        }
        let body = Bytes::from(body);
        Ok(RawBody {
          wire: body.clone(),
          content: body,
        })
      }
    }
  }

  async fn read_chunked_body<R>(&self, reader: &mut R) -> Result<RawBody>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut wire = Vec::new();
    let mut content = Vec::new();
    loop {
      let start = wire.len();
      if read_line(reader, &mut wire, MAX_CHUNK_LINE).await? == 0 {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
      }
      let size = parse_chunk_size(trim_line(&wire[start..]))?;
      if size == 0 {
        // trailer section
        loop {
          let start = wire.len();
          if read_line(reader, &mut wire, MAX_CHUNK_LINE).await? == 0 {
            return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
          }
          if trim_line(&wire[start..]).is_empty() {
            break;
          }
        }
        break;
      }
      if content.len().saturating_add(size) > self.max_body {
        return Err(self.too_large());
      }
      let offset = content.len();
      content.resize(offset + size, 0);
      reader.read_exact(&mut content[offset..]).await?;
      wire.extend_from_slice(&content[offset..]);
      let start = wire.len();
      if read_line(reader, &mut wire, MAX_CHUNK_LINE).await? == 0
        || !trim_line(&wire[start..]).is_empty()
      {
        return Err(Error::invalid_request("chunk not terminated by CRLF"));
      }
    }
    Ok(RawBody {
      wire: Bytes::from(wire),
      content: Bytes::from(content),
    })
  }

  fn too_large(&self) -> Error {
    let error = Error::BodyTooLarge {
      limit: self.max_body,
    };
    tracing::warn!("[recorder] {}", error);
    error
  }
}

/// Reads one line, `\n` included, into `line`. Returns the number of bytes
/// read, `0` at end of stream.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let start = line.len();
  loop {
    let available = reader.fill_buf().await?;
    if available.is_empty() {
      return if line.len() == start {
        Ok(0)
      } else {
        Err(new_io_error(ErrorKind::UnexpectedEof, "truncated line"))
      };
    }
    let (done, used) = match available.iter().position(|b| *b == b'\n') {
      Some(position) => (true, position + 1),
      None => (false, available.len()),
    };
    if line.len() - start + used > limit {
      return Err(Error::invalid_request(format!(
        "line exceeds the limit of {} bytes",
        limit
      )));
    }
    line.extend_from_slice(&available[..used]);
    reader.consume(used);
    if done {
      return Ok(line.len() - start);
    }
  }
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn parser_version(version: &[u8]) -> Result<Version> {
  match version {
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    _ => Err(Error::invalid_request(format!(
      "unsupported version {:?}",
      String::from_utf8_lossy(version)
    ))),
  }
}

fn parser_headers<'a>(lines: impl Iterator<Item = &'a [u8]>) -> Result<Headers> {
  let mut headers = Headers::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    if line.starts_with(b" ") || line.starts_with(b"\t") {
      return Err(Error::invalid_request("obsolete header line folding"));
    }
    let colon = line
      .iter()
      .position(|b| *b == b':')
      .ok_or_else(|| Error::invalid_request("header line without colon"))?;
    let name = HeaderName::from_bytes(&line[..colon])
      .map_err(|e| Error::invalid_request(format!("invalid header name: {}", e)))?;
    let value = line[colon + 1..].trim_ascii();
    let value = HeaderValue::from_bytes(value)
      .map_err(|e| Error::invalid_request(format!("invalid header value: {}", e)))?;
    headers.push(name, value);
  }
  Ok(headers)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  std::str::from_utf8(size)
    .ok()
    .map(str::trim)
    .filter(|size| !size.is_empty() && size.bytes().all(|b| b.is_ascii_hexdigit()))
    .and_then(|size| usize::from_str_radix(size, 16).ok())
    .ok_or_else(|| Error::invalid_request("invalid chunk size"))
}

fn content_length(headers: &Headers) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all(http::header::CONTENT_LENGTH) {
    let value = value
      .to_str()
      .map_err(|_| Error::invalid_request("invalid Content-Length"))?;
    for part in value.split(',') {
      let parsed: u64 = part
        .trim()
        .parse()
        .map_err(|_| Error::invalid_request("invalid Content-Length"))?;
      match length {
        Some(previous) if previous != parsed => {
          return Err(Error::invalid_request("conflicting Content-Length values"))
        }
        _ => length = Some(parsed),
      }
    }
  }
  Ok(length)
}

fn chunked_is_last(headers: &Headers) -> Option<bool> {
  let mut last = None;
  for value in headers.get_all(http::header::TRANSFER_ENCODING) {
    let value = value.to_str().unwrap_or_default();
    for coding in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
      last = Some(coding.eq_ignore_ascii_case("chunked"));
    }
  }
  last
}

/// Body framing of a request.
pub fn request_body_kind(head: &RequestHead) -> Result<BodyKind> {
  if head.method == Method::CONNECT {
    return Ok(BodyKind::Empty);
  }
  match chunked_is_last(&head.headers) {
    Some(true) if head.headers.get(http::header::CONTENT_LENGTH).is_some() => Err(
      Error::invalid_request("both Transfer-Encoding and Content-Length"),
    ),
    Some(true) => Ok(BodyKind::Chunked),
    Some(false) => Err(Error::invalid_request(
      "request transfer coding does not end with chunked",
    )),
    None => Ok(
      content_length(&head.headers)?
        .map(BodyKind::Length)
        .unwrap_or(BodyKind::Empty),
    ),
  }
}

/// Body framing of a response to a `method` request.
pub fn response_body_kind(method: &Method, head: &ResponseHead) -> Result<BodyKind> {
  if method == Method::HEAD
    || head.status.is_informational()
    || head.status == StatusCode::NO_CONTENT
    || head.status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyKind::Empty);
  }
  Ok(match chunked_is_last(&head.headers) {
    Some(true) => BodyKind::Chunked,
    Some(false) => BodyKind::UntilClose,
    None => content_length(&head.headers)?
      .map(BodyKind::Length)
      .unwrap_or(BodyKind::UntilClose),
  })
}

/// Removes the `Content-Encoding` layers (`gzip`, `deflate`) from a payload.
///
/// Unknown codings, corrupt data or output larger than `limit` leave the
/// payload as received.
pub fn decode_content(headers: &Headers, content: &Bytes, limit: usize) -> Bytes {
  let codings: Vec<String> = headers
    .get_all(http::header::CONTENT_ENCODING)
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| value.split(','))
    .map(|coding| coding.trim().to_ascii_lowercase())
    .filter(|coding| !coding.is_empty())
    .collect();
  let mut body = content.clone();
  for coding in codings.iter().rev() {
    let decoded = match coding.as_str() {
      "identity" => continue,
      "gzip" | "x-gzip" => inflate(MultiGzDecoder::new(&body[..]), limit),
      "deflate" => inflate(ZlibDecoder::new(&body[..]), limit)
        .or_else(|_| inflate(DeflateDecoder::new(&body[..]), limit)),
      other => {
        tracing::debug!("[recorder] keeping body with content coding {}", other);
        return content.clone();
      }
    };
    match decoded {
      Ok(decoded) => body = decoded,
      Err(e) => {
        tracing::debug!("[recorder] failed to decode {} body: {}", coding, e);
        return content.clone();
      }
    }
  }
  body
}

fn inflate<R: Read>(reader: R, limit: usize) -> std::io::Result<Bytes> {
  let mut decoded = Vec::new();
  reader.take((limit as u64).saturating_add(1)).read_to_end(&mut decoded)?;
  if decoded.len() > limit {
    return Err(std::io::Error::new(
      ErrorKind::InvalidData,
      "decoded body exceeds the limit",
    ));
  }
  Ok(Bytes::from(decoded))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tokio::io::BufReader;

  fn decoder() -> Decoder {
    Decoder::new(1024, 64)
  }

  async fn request(bytes: &[u8]) -> Result<Option<RawRequest>> {
    decoder().read_request(&mut BufReader::new(bytes)).await
  }

  #[tokio::test]
  async fn content_length_request() {
    let raw = b"POST http://localhost/login HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let request = request(raw).await.unwrap().unwrap();
    assert_eq!(request.head.method, Method::POST);
    assert_eq!(request.head.target, "http://localhost/login");
    assert_eq!(request.kind, BodyKind::Length(5));
    assert_eq!(request.body.content, "hello");
    assert_eq!(request.head.raw.len() + request.body.wire.len(), raw.len());
  }

  #[tokio::test]
  async fn chunked_body_keeps_wire_bytes() {
    let body = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n";
    let mut raw = b"PUT /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    raw.extend_from_slice(body);
    let request = request(&raw).await.unwrap().unwrap();
    assert_eq!(request.kind, BodyKind::Chunked);
    assert_eq!(request.body.content, "Wikipedia");
    assert_eq!(&request.body.wire[..], &body[..]);
  }

  #[tokio::test]
  async fn oversized_bodies_are_fatal() {
    let raw = b"POST / HTTP/1.1\r\nContent-Length: 65\r\n\r\n";
    assert!(matches!(
      request(raw).await,
      Err(Error::BodyTooLarge { limit: 64 })
    ));
    let mut chunked = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    chunked.extend_from_slice(format!("41\r\n{}\r\n0\r\n\r\n", "a".repeat(65)).as_bytes());
    assert!(matches!(
      request(&chunked).await,
      Err(Error::BodyTooLarge { .. })
    ));
  }

  #[tokio::test]
  async fn oversized_head_is_rejected() {
    let raw = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(2048));
    assert!(matches!(
      request(raw.as_bytes()).await,
      Err(Error::InvalidRequest(_))
    ));
  }

  #[tokio::test]
  async fn eof_between_requests() {
    assert!(request(b"").await.unwrap().is_none());
    assert!(request(b"\r\n").await.unwrap().is_none());
    assert!(request(b"GET / HTTP/1.1\r\nHost: a").await.is_err());
  }

  #[tokio::test]
  async fn malformed_request_lines() {
    assert!(request(b"GET /\r\n\r\n").await.is_err());
    assert!(request(b"GET / HTTP/2.0\r\n\r\n").await.is_err());
    assert!(request(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").await.is_err());
  }

  #[tokio::test]
  async fn interim_heads_are_collected() {
    let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let response = decoder()
      .read_response(&mut BufReader::new(&raw[..]), &Method::POST)
      .await
      .unwrap();
    assert_eq!(response.interim.len(), 1);
    assert_eq!(response.head.status, StatusCode::OK);
    assert_eq!(response.body.content, "ok");
    assert!(response.keep_alive());
  }

  #[tokio::test]
  async fn bodiless_responses() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
    let response = decoder()
      .read_response(&mut BufReader::new(&raw[..]), &Method::HEAD)
      .await
      .unwrap();
    assert_eq!(response.kind, BodyKind::Empty);
    let raw = b"HTTP/1.1 304 Not Modified\r\nETag: x\r\n\r\n";
    let response = decoder()
      .read_response(&mut BufReader::new(&raw[..]), &Method::GET)
      .await
      .unwrap();
    assert_eq!(response.kind, BodyKind::Empty);
  }

  #[tokio::test]
  async fn body_until_close() {
    let raw = b"HTTP/1.0 200 OK\r\n\r\nall of it";
    let response = decoder()
      .read_response(&mut BufReader::new(&raw[..]), &Method::GET)
      .await
      .unwrap();
    assert_eq!(response.kind, BodyKind::UntilClose);
    assert_eq!(response.body.content, "all of it");
    assert!(!response.keep_alive());
  }

  #[tokio::test]
  async fn unlimited_body_until_close_is_read_whole() {
    let raw = b"HTTP/1.0 200 OK\r\n\r\nall of it";
    let response = Decoder::new(1024, usize::MAX)
      .read_response(&mut BufReader::new(&raw[..]), &Method::GET)
      .await
      .unwrap();
    assert_eq!(response.kind, BodyKind::UntilClose);
    assert_eq!(response.body.wire, "all of it");
  }

  #[test]
  fn unlimited_decoding_keeps_the_whole_body() {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"no limit").unwrap();
    let compressed = Bytes::from(encoder.finish().unwrap());
    let headers: Headers = vec![(
      http::header::CONTENT_ENCODING,
      HeaderValue::from_static("gzip"),
    )]
    .into_iter()
    .collect();
    assert_eq!(decode_content(&headers, &compressed, usize::MAX), "no limit");
  }

  #[tokio::test]
  async fn keep_alive_rules() {
    let head = |raw: &'static [u8]| async move {
      decoder()
        .read_request_head(&mut BufReader::new(raw))
        .await
        .unwrap()
        .unwrap()
    };
    assert!(head(b"GET / HTTP/1.1\r\n\r\n").await.keep_alive());
    assert!(!head(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.keep_alive());
    assert!(!head(b"GET / HTTP/1.0\r\n\r\n").await.keep_alive());
    assert!(head(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.keep_alive());
  }

  #[test]
  fn gzip_content_is_decoded() {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"recorded body").unwrap();
    let compressed = Bytes::from(encoder.finish().unwrap());
    let headers: Headers = vec![(
      http::header::CONTENT_ENCODING,
      HeaderValue::from_static("gzip"),
    )]
    .into_iter()
    .collect();
    assert_eq!(decode_content(&headers, &compressed, 1024), "recorded body");
    assert_eq!(decode_content(&headers, &compressed, 4), compressed);
    let garbage = Bytes::from_static(b"not gzip");
    assert_eq!(decode_content(&headers, &garbage, 1024), garbage);
  }

  #[test]
  fn deflate_content_is_decoded() {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"zlib wrapped").unwrap();
    let compressed = Bytes::from(encoder.finish().unwrap());
    let headers: Headers = vec![(
      http::header::CONTENT_ENCODING,
      HeaderValue::from_static("deflate"),
    )]
    .into_iter()
    .collect();
    assert_eq!(decode_content(&headers, &compressed, 1024), "zlib wrapped");
  }
}
