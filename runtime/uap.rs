// Copyright 2018-2026 the Deno authors. MIT license.

//! User-agent parsing.
//!
//! The embedder may plug in a real parser; the built-in fallback only
//! splits a leading `Product/major.minor.patch` token, which is enough
//! for local development.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgent {
  pub family: String,
  pub major: String,
  pub minor: String,
  pub patch: String,
}

pub fn parse_fallback(user_agent: &str) -> UserAgent {
  let token = user_agent.split_whitespace().next().unwrap_or("");
  let (family, version) = match token.split_once('/') {
    Some((family, version)) => (family, version),
    None => (token, ""),
  };
  let mut parts = version.split('.');
  UserAgent {
    family: family.to_string(),
    major: parts.next().unwrap_or("").to_string(),
    minor: parts.next().unwrap_or("").to_string(),
    patch: parts.next().unwrap_or("").to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_product_tokens() {
    let ua = parse_fallback("curl/8.5.0");
    assert_eq!(ua.family, "curl");
    assert_eq!(ua.major, "8");
    assert_eq!(ua.minor, "5");
    assert_eq!(ua.patch, "0");
  }

  #[test]
  fn tolerates_partial_versions_and_junk() {
    let ua = parse_fallback("Mozilla/5.0 (X11; Linux)");
    assert_eq!(ua.family, "Mozilla");
    assert_eq!(ua.major, "5");
    assert_eq!(ua.minor, "0");
    assert_eq!(ua.patch, "");

    let ua = parse_fallback("");
    assert_eq!(ua, UserAgent::default());
  }
}
