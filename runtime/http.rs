// Copyright 2018-2026 the Deno authors. MIT license.

//! Request/response records and the header wire protocol.
//!
//! Headers cross the ABI as NUL-delimited byte lists; multi-entry
//! enumerations use a cursor protocol where the host fills the caller's
//! buffer with whole NUL-terminated entries and reports where to resume.

use http::header::HeaderMap;
use http::header::CONTENT_LENGTH;
use http::header::TRANSFER_ENCODING;
use http::Method;
use http::StatusCode;
use url::Url;

use crate::error::FastlyStatus;

/// Cursor value signalling end-of-list.
pub const CURSOR_END: u32 = u32::MAX;

/// How framing headers are produced when a message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingHeadersMode {
  /// Strip `Content-Length`/`Transfer-Encoding` and let the transport
  /// frame the message.
  #[default]
  Automatic,
  /// Honor the framing headers set on the message, falling back to
  /// automatic when they are invalid.
  ManuallyFromHeaders,
}

impl FramingHeadersMode {
  pub fn from_u32(value: u32) -> Result<Self, FastlyStatus> {
    match value {
      0 => Ok(Self::Automatic),
      1 => Ok(Self::ManuallyFromHeaders),
      _ => Err(FastlyStatus::INVAL),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepaliveMode {
  #[default]
  Automatic,
  NoKeepalive,
}

impl KeepaliveMode {
  pub fn from_u32(value: u32) -> Result<Self, FastlyStatus> {
    match value {
      0 => Ok(Self::Automatic),
      1 => Ok(Self::NoKeepalive),
      _ => Err(FastlyStatus::INVAL),
    }
  }
}

/// Cache-override settings attached to a request. Stored faithfully but
/// semantically inert in the local runtime.
#[derive(Debug, Clone, Default)]
pub struct CacheOverride {
  pub tag: u32,
  pub ttl: u32,
  pub stale_while_revalidate: u32,
  pub surrogate_key: Option<Vec<u8>>,
}

/// The numeric HTTP version enum shared with the guest. Only 1.1 is
/// storable; everything else is accepted with a warning.
pub const HTTP_VERSION_H1: u32 = 2;

pub fn http_version_is_known(value: u32) -> bool {
  value <= 4
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub framing: FramingHeadersMode,
  pub cache_override: CacheOverride,
  pub auto_decompress_gzip: bool,
}

impl RequestRecord {
  pub fn new() -> Self {
    Self {
      method: Method::GET,
      url: Url::parse("http://localhost/").unwrap(),
      headers: HeaderMap::new(),
      framing: FramingHeadersMode::Automatic,
      cache_override: CacheOverride::default(),
      auto_decompress_gzip: false,
    }
  }
}

impl Default for RequestRecord {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone)]
pub struct ResponseRecord {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub framing: FramingHeadersMode,
  pub keepalive: KeepaliveMode,
}

impl ResponseRecord {
  pub fn new() -> Self {
    Self {
      status: StatusCode::OK,
      headers: HeaderMap::new(),
      framing: FramingHeadersMode::Automatic,
      keepalive: KeepaliveMode::Automatic,
    }
  }
}

impl Default for ResponseRecord {
  fn default() -> Self {
    Self::new()
  }
}

/// Parse a method, uppercasing it first so `get` and `GET` store the
/// same canonical method.
pub fn parse_method(bytes: &[u8]) -> Result<Method, FastlyStatus> {
  let text =
    std::str::from_utf8(bytes).map_err(|_| FastlyStatus::HTTPINVALID)?;
  Ok(Method::from_bytes(text.to_ascii_uppercase().as_bytes())?)
}

/// The lowercased, sorted, deduplicated header-name list used by the
/// name enumeration hostcalls.
pub fn sorted_header_names(headers: &HeaderMap) -> Vec<Vec<u8>> {
  let mut names: Vec<Vec<u8>> = headers
    .keys()
    .map(|name| name.as_str().as_bytes().to_vec())
    .collect();
  names.sort();
  names.dedup();
  names
}

pub fn header_values(headers: &HeaderMap, name: &str) -> Vec<Vec<u8>> {
  headers
    .get_all(name)
    .iter()
    .map(|value| value.as_bytes().to_vec())
    .collect()
}

/// Replace all values of `name` with a NUL-separated value list.
pub fn set_header_values(
  headers: &mut HeaderMap,
  name: &str,
  packed: &[u8],
) -> Result<(), FastlyStatus> {
  let name = http::header::HeaderName::from_bytes(name.as_bytes())?;
  headers.remove(&name);
  for raw in packed.split(|byte| *byte == 0) {
    if raw.is_empty() {
      continue;
    }
    let value = http::header::HeaderValue::from_bytes(raw)?;
    headers.append(&name, value);
  }
  Ok(())
}

/// One page of a cursor enumeration.
#[derive(Debug, PartialEq, Eq)]
pub struct CursorPage {
  /// NUL-terminated entries, as many as fit.
  pub payload: Vec<u8>,
  /// `CURSOR_END` when the list is exhausted, otherwise the index to
  /// resume from.
  pub next: u32,
}

/// Fill a page of NUL-terminated entries starting at `cursor`.
///
/// Entries are written whole: if the next entry would not fit, the page
/// ends early. A single entry larger than the whole buffer is a buffer
/// length error carrying the required size.
pub fn paginate(
  entries: &[Vec<u8>],
  cursor: u32,
  capacity: usize,
) -> Result<CursorPage, usize> {
  let start = cursor as usize;
  let mut payload = Vec::new();
  let mut index = start;
  while index < entries.len() {
    let needed = entries[index].len() + 1;
    if payload.len() + needed > capacity {
      if payload.is_empty() {
        return Err(needed);
      }
      break;
    }
    payload.extend_from_slice(&entries[index]);
    payload.push(0);
    index += 1;
  }
  let next = if index >= entries.len() {
    CURSOR_END
  } else {
    index as u32
  };
  Ok(CursorPage { payload, next })
}

/// Validate manual framing: exactly one all-digit `Content-Length`, or
/// exactly one `Transfer-Encoding: chunked`.
pub fn manual_framing_is_valid(headers: &HeaderMap) -> bool {
  let lengths: Vec<_> = headers.get_all(CONTENT_LENGTH).iter().collect();
  let encodings: Vec<_> = headers.get_all(TRANSFER_ENCODING).iter().collect();
  match (lengths.as_slice(), encodings.as_slice()) {
    ([length], []) => {
      let bytes = length.as_bytes();
      !bytes.is_empty() && bytes.iter().all(u8::is_ascii_digit)
    }
    ([], [encoding]) => encoding.as_bytes().eq_ignore_ascii_case(b"chunked"),
    _ => false,
  }
}

/// Apply the framing mode before a message is written to a transport:
/// either keep valid manual framing headers, or strip them and let the
/// transport frame the message.
pub fn apply_framing_mode(headers: &mut HeaderMap, mode: FramingHeadersMode) {
  if mode == FramingHeadersMode::ManuallyFromHeaders {
    if manual_framing_is_valid(headers) {
      return;
    }
    log::warn!(
      "invalid manual framing headers; falling back to automatic framing"
    );
  }
  headers.remove(CONTENT_LENGTH);
  headers.remove(TRANSFER_ENCODING);
}

#[cfg(test)]
mod tests {
  use http::header::HeaderValue;

  use super::*;

  #[test]
  fn methods_are_uppercased() {
    for method in [
      "get", "head", "post", "put", "patch", "delete", "connect", "options",
      "trace",
    ] {
      let parsed = parse_method(method.as_bytes()).unwrap();
      assert_eq!(parsed.as_str(), method.to_ascii_uppercase());
    }
    assert_eq!(
      parse_method(b"not a method").unwrap_err(),
      FastlyStatus::HTTPINVALID
    );
  }

  #[test]
  fn pagination_packs_whole_entries() {
    let entries: Vec<Vec<u8>> =
      vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()];
    // "alpha\0beta\0" fits in 11, "gamma\0" does not
    let page = paginate(&entries, 0, 11).unwrap();
    assert_eq!(page.payload, b"alpha\0beta\0");
    assert_eq!(page.next, 2);
    let page = paginate(&entries, 2, 11).unwrap();
    assert_eq!(page.payload, b"gamma\0");
    assert_eq!(page.next, CURSOR_END);
    // resuming past the end yields an empty terminal page
    let page = paginate(&entries, 17, 11).unwrap();
    assert!(page.payload.is_empty());
    assert_eq!(page.next, CURSOR_END);
  }

  #[test]
  fn pagination_reports_required_size_when_nothing_fits() {
    let entries = vec![b"oversized-entry".to_vec()];
    assert_eq!(paginate(&entries, 0, 4), Err(16));
  }

  #[test]
  fn sorted_names_and_packed_values_round_trip() {
    let mut headers = HeaderMap::new();
    set_header_values(&mut headers, "X-B", b"2\x003").unwrap();
    set_header_values(&mut headers, "x-a", b"1").unwrap();
    assert_eq!(
      sorted_header_names(&headers),
      vec![b"x-a".to_vec(), b"x-b".to_vec()]
    );
    assert_eq!(
      header_values(&headers, "x-b"),
      vec![b"2".to_vec(), b"3".to_vec()]
    );
    // replacement, not append
    set_header_values(&mut headers, "x-b", b"9").unwrap();
    assert_eq!(header_values(&headers, "x-b"), vec![b"9".to_vec()]);
  }

  #[test]
  fn manual_framing_keeps_chunked_and_rejects_gzip() {
    let mut headers = HeaderMap::new();
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    let mut manual = headers.clone();
    apply_framing_mode(&mut manual, FramingHeadersMode::ManuallyFromHeaders);
    assert!(manual.contains_key(TRANSFER_ENCODING));

    let mut headers = HeaderMap::new();
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
    apply_framing_mode(&mut headers, FramingHeadersMode::ManuallyFromHeaders);
    assert!(!headers.contains_key(TRANSFER_ENCODING));
    assert!(!headers.contains_key(CONTENT_LENGTH));
  }

  #[test]
  fn automatic_framing_strips_framing_headers() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    apply_framing_mode(&mut headers, FramingHeadersMode::Automatic);
    assert!(headers.is_empty());
  }

  #[test]
  fn content_length_must_be_all_digits() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12a"));
    assert!(!manual_framing_is_valid(&headers));
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("120"));
    assert!(manual_framing_is_valid(&headers));
  }
}
