// Copyright 2018-2026 the Deno authors. MIT license.

//! Access control lists loaded from JSON.
//!
//! An ACL is an ordered list of `{prefix, action}` entries. Lookup is
//! longest-prefix match over entries of the queried address family; when
//! several entries share the longest matching prefix, the one latest in
//! input order wins.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AclError {
  #[error("invalid ACL JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("invalid ACL prefix {prefix:?}: {message}")]
  InvalidPrefix { prefix: String, message: String },
}

/// The wire format of a single ACL entry.
///
/// The optional `op` field mirrors the shape used by ACL update APIs
/// (create/delete); it carries no meaning for a load-once local ACL and
/// is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
  pub prefix: String,
  pub action: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub op: Option<String>,
}

#[derive(Debug, Clone)]
struct ParsedEntry {
  net: IpNet,
  entry: AclEntry,
}

#[derive(Debug, Clone, Default)]
pub struct Acl {
  entries: Vec<ParsedEntry>,
}

impl Acl {
  /// Parse an ACL from a JSON array of entries.
  pub fn from_json(json: &str) -> Result<Self, AclError> {
    let entries: Vec<AclEntry> = serde_json::from_str(json)?;
    Self::from_entries(entries)
  }

  pub fn from_entries(entries: Vec<AclEntry>) -> Result<Self, AclError> {
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
      let net = IpNet::from_str(&entry.prefix).map_err(|err| {
        AclError::InvalidPrefix {
          prefix: entry.prefix.clone(),
          message: err.to_string(),
        }
      })?;
      // Normalize: zero the bits outside the mask so the stored prefix
      // is canonical regardless of how the JSON spelled it.
      parsed.push(ParsedEntry {
        net: net.trunc(),
        entry,
      });
    }
    Ok(Self { entries: parsed })
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Longest-prefix lookup. Ties go to the entry latest in input order.
  /// An address never matches an entry of the other family.
  pub fn lookup(&self, ip: IpAddr) -> Option<&AclEntry> {
    let ip = canonical_ip(ip);
    let mut best: Option<&ParsedEntry> = None;
    for candidate in &self.entries {
      if !same_family(&candidate.net, &ip) {
        continue;
      }
      if !candidate.net.contains(&ip) {
        continue;
      }
      match best {
        Some(current) if candidate.net.prefix_len() < current.net.prefix_len() => {}
        // `>=` keeps the later entry on equal masks.
        _ => best = Some(candidate),
      }
    }
    best.map(|parsed| &parsed.entry)
  }
}

/// Fold IPv4-mapped IPv6 addresses to their 4-byte form before matching.
fn canonical_ip(ip: IpAddr) -> IpAddr {
  match ip {
    IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
      Some(v4) => IpAddr::V4(v4),
      None => ip,
    },
    IpAddr::V4(_) => ip,
  }
}

fn same_family(net: &IpNet, ip: &IpAddr) -> bool {
  matches!(
    (net, ip),
    (IpNet::V4(_), IpAddr::V4(_)) | (IpNet::V6(_), IpAddr::V6(_))
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_acl() -> Acl {
    Acl::from_json(
      r#"[
        {"prefix": "10.0.0.0/8", "action": "BLOCK"},
        {"prefix": "10.1.0.0/16", "action": "ALLOW"},
        {"prefix": "10.1.2.0/24", "action": "BLOCK"}
      ]"#,
    )
    .unwrap()
  }

  #[test]
  fn longest_prefix_wins() {
    let acl = test_acl();
    let entry = acl.lookup("10.1.2.5".parse().unwrap()).unwrap();
    assert_eq!(entry.prefix, "10.1.2.0/24");
    assert_eq!(entry.action, "BLOCK");

    let entry = acl.lookup("10.1.3.5".parse().unwrap()).unwrap();
    assert_eq!(entry.prefix, "10.1.0.0/16");
    assert_eq!(entry.action, "ALLOW");

    let entry = acl.lookup("10.2.0.5".parse().unwrap()).unwrap();
    assert_eq!(entry.prefix, "10.0.0.0/8");
    assert_eq!(entry.action, "BLOCK");
  }

  #[test]
  fn family_mismatch_never_matches() {
    let acl = test_acl();
    assert!(acl.lookup("::1".parse().unwrap()).is_none());

    let acl = Acl::from_json(
      r#"[{"prefix": "2001:db8::/32", "action": "BLOCK"}]"#,
    )
    .unwrap();
    assert!(acl.lookup("10.0.0.1".parse().unwrap()).is_none());
    assert!(acl.lookup("2001:db8::1".parse().unwrap()).is_some());
  }

  #[test]
  fn equal_masks_prefer_the_later_entry() {
    let acl = Acl::from_json(
      r#"[
        {"prefix": "192.0.2.0/24", "action": "ALLOW"},
        {"prefix": "192.0.2.7/24", "action": "BLOCK"}
      ]"#,
    )
    .unwrap();
    let entry = acl.lookup("192.0.2.9".parse().unwrap()).unwrap();
    assert_eq!(entry.action, "BLOCK");
  }

  #[test]
  fn prefixes_are_normalized_to_the_mask() {
    let acl = Acl::from_json(
      r#"[{"prefix": "10.1.2.250/24", "action": "ALLOW"}]"#,
    )
    .unwrap();
    assert!(acl.lookup("10.1.2.1".parse().unwrap()).is_some());
    assert!(acl.lookup("10.1.3.1".parse().unwrap()).is_none());
  }

  #[test]
  fn ipv4_mapped_ipv6_folds_to_ipv4() {
    let acl = test_acl();
    let entry = acl.lookup("::ffff:10.1.2.5".parse().unwrap()).unwrap();
    assert_eq!(entry.prefix, "10.1.2.0/24");
  }

  #[test]
  fn bad_prefix_is_rejected() {
    let err = Acl::from_json(r#"[{"prefix": "nonsense", "action": "A"}]"#);
    assert!(matches!(err, Err(AclError::InvalidPrefix { .. })));
  }
}
