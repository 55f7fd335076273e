// Copyright 2018-2026 the Deno authors. MIT license.

use http::HeaderMap;
use sha2::Digest;
use sha2::Sha256;

/// Hash a cache key, a vary rule and the canonicalized values of the
/// varied-on request headers down to a variant key.
///
/// Objects stored without a vary rule hash with an empty rule, so every
/// lookup computes a comparable key.
pub fn variant_key(
  key: &[u8],
  vary_rule: Option<&str>,
  request_headers: &HeaderMap,
) -> Vec<u8> {
  let rule = vary_rule.unwrap_or("");
  let mut hasher = Sha256::new();
  hasher.update(key);
  hasher.update([0u8]);
  hasher.update(rule.as_bytes());
  hasher.update([0u8]);
  hasher.update(canonicalize(rule, request_headers).as_bytes());
  hasher.finalize().to_vec()
}

/// Canonicalize the varied-on headers: lowercase names, trim whitespace,
/// names sorted ASCII-ascending, each header's values sorted
/// ASCII-ascending, one `name:value\n` line per value. Headers absent
/// from the request contribute nothing.
fn canonicalize(vary_rule: &str, request_headers: &HeaderMap) -> String {
  let mut names: Vec<String> = vary_rule
    .split(',')
    .map(|name| name.trim().to_ascii_lowercase())
    .filter(|name| !name.is_empty())
    .collect();
  names.sort();
  names.dedup();

  let mut out = String::new();
  for name in names {
    let mut values: Vec<String> = request_headers
      .get_all(&name)
      .iter()
      .filter_map(|value| value.to_str().ok())
      .map(|value| value.trim().to_string())
      .collect();
    values.sort();
    for value in values {
      out.push_str(&name);
      out.push(':');
      out.push_str(&value);
      out.push('\n');
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use http::HeaderValue;

  use super::*;

  fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
      map.append(
        http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_str(value).unwrap(),
      );
    }
    map
  }

  #[test]
  fn canonical_form_is_sorted_and_trimmed() {
    let headers = headers(&[
      ("Accept-Encoding", " gzip "),
      ("User-Agent", "curl"),
      ("Accept-Encoding", "br"),
    ]);
    let canon = canonicalize("User-Agent, Accept-Encoding", &headers);
    assert_eq!(canon, "accept-encoding:br\naccept-encoding:gzip\nuser-agent:curl\n");
  }

  #[test]
  fn variant_key_depends_on_varied_headers_only() {
    let gzip = headers(&[("accept-encoding", "gzip"), ("x-other", "1")]);
    let gzip_other = headers(&[("accept-encoding", "gzip"), ("x-other", "2")]);
    let br = headers(&[("accept-encoding", "br")]);

    let rule = Some("accept-encoding");
    let a = variant_key(b"K", rule, &gzip);
    let b = variant_key(b"K", rule, &gzip_other);
    let c = variant_key(b"K", rule, &br);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 32);
  }

  #[test]
  fn no_vary_rule_collapses_to_one_variant() {
    let a = variant_key(b"K", None, &headers(&[("accept", "1")]));
    let b = variant_key(b"K", None, &headers(&[("accept", "2")]));
    assert_eq!(a, b);
  }
}
