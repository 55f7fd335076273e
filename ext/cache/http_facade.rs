// Copyright 2018-2026 the Deno authors. MIT license.

//! The HTTP-flavored cache façade: request cacheability, suggested cache
//! keys, and write options derived from response headers.

use std::time::Duration;

use cache_control::CacheControl;
use http::HeaderMap;
use http::Method;
use sha2::Digest;
use sha2::Sha256;

use crate::WriteOptions;

/// Freshness lifetime applied when the response carries no usable
/// `Cache-Control: max-age` directive.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Only GET and HEAD requests are cacheable.
pub fn is_request_cacheable(method: &Method) -> bool {
  matches!(*method, Method::GET | Method::HEAD)
}

/// The suggested cache key for a request: the SHA-256 of the full URL
/// string.
pub fn suggested_cache_key(url: &str) -> [u8; 32] {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hasher.finalize().into()
}

/// Derive write options from a backend response: `Cache-Control:
/// max-age=N` when present, one hour otherwise. Only max-age is
/// populated.
pub fn suggested_write_options(response_headers: &HeaderMap) -> WriteOptions {
  let max_age = response_headers
    .get(http::header::CACHE_CONTROL)
    .and_then(|value| value.to_str().ok())
    .and_then(CacheControl::from_value)
    .and_then(|cc| cc.max_age)
    .unwrap_or(DEFAULT_MAX_AGE);
  WriteOptions {
    max_age_ns: max_age.as_nanos() as u64,
    ..Default::default()
  }
}

#[cfg(test)]
mod tests {
  use http::HeaderValue;

  use super::*;

  #[test]
  fn only_get_and_head_are_cacheable() {
    assert!(is_request_cacheable(&Method::GET));
    assert!(is_request_cacheable(&Method::HEAD));
    assert!(!is_request_cacheable(&Method::POST));
    assert!(!is_request_cacheable(&Method::PUT));
    assert!(!is_request_cacheable(&Method::DELETE));
  }

  #[test]
  fn cache_key_is_the_sha256_of_the_url() {
    let key = suggested_cache_key("https://example.com/path?q=1");
    let mut hasher = Sha256::new();
    hasher.update(b"https://example.com/path?q=1");
    let expected: [u8; 32] = hasher.finalize().into();
    assert_eq!(key, expected);
  }

  #[test]
  fn max_age_comes_from_cache_control() {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CACHE_CONTROL,
      HeaderValue::from_static("public, max-age=120"),
    );
    let options = suggested_write_options(&headers);
    assert_eq!(options.max_age_ns, 120_000_000_000);
  }

  #[test]
  fn missing_cache_control_defaults_to_an_hour() {
    let options = suggested_write_options(&HeaderMap::new());
    assert_eq!(options.max_age_ns, 3600_000_000_000);
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CACHE_CONTROL,
      HeaderValue::from_static("no-store"),
    );
    let options = suggested_write_options(&headers);
    assert_eq!(options.max_age_ns, 3600_000_000_000);
  }
}
