// Copyright 2018-2026 the Deno authors. MIT license.

//! In-memory KV stores.
//!
//! Stores are process-wide, named, and safe for concurrent use; the
//! runtime exposes them to guests through asynchronous lookup, insert,
//! delete and list operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct KvValue {
  pub data: Bytes,
  pub metadata: Option<Bytes>,
  pub generation: u64,
}

#[derive(Debug, Default)]
struct StoreState {
  entries: BTreeMap<String, KvValue>,
  next_generation: u64,
}

/// One named store. Cheap to clone; clones share contents.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
  state: Arc<Mutex<StoreState>>,
}

/// One page of a list operation, serialized as JSON for the guest.
#[derive(Debug, Serialize)]
pub struct ListPage {
  pub data: Vec<String>,
  pub meta: ListMeta,
}

#[derive(Debug, Serialize)]
pub struct ListMeta {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub prefix: Option<String>,
  pub limit: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub next_cursor: Option<String>,
}

const DEFAULT_LIST_LIMIT: u32 = 1000;

impl KvStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lookup(&self, key: &str) -> Option<KvValue> {
    self.state.lock().entries.get(key).cloned()
  }

  pub fn insert(&self, key: &str, data: Bytes, metadata: Option<Bytes>) {
    let mut state = self.state.lock();
    state.next_generation += 1;
    let generation = state.next_generation;
    state.entries.insert(
      key.to_string(),
      KvValue {
        data,
        metadata,
        generation,
      },
    );
  }

  /// Returns whether the key was present.
  pub fn delete(&self, key: &str) -> bool {
    self.state.lock().entries.remove(key).is_some()
  }

  /// List keys in lexicographic order, optionally filtered by `prefix`,
  /// resuming strictly after `cursor`.
  pub fn list(
    &self,
    prefix: Option<&str>,
    limit: Option<u32>,
    cursor: Option<&str>,
  ) -> ListPage {
    let limit = match limit {
      Some(0) | None => DEFAULT_LIST_LIMIT,
      Some(n) => n,
    };
    let state = self.state.lock();
    let mut data = Vec::new();
    let mut more = false;
    for key in state.entries.keys() {
      if let Some(prefix) = prefix {
        if !key.starts_with(prefix) {
          continue;
        }
      }
      if let Some(cursor) = cursor {
        if key.as_str() <= cursor {
          continue;
        }
      }
      if data.len() as u32 == limit {
        more = true;
        break;
      }
      data.push(key.clone());
    }
    let next_cursor = if more { data.last().cloned() } else { None };
    ListPage {
      meta: ListMeta {
        prefix: prefix.map(str::to_string),
        limit,
        next_cursor,
      },
      data,
    }
  }
}

impl ListPage {
  pub fn to_json(&self) -> Vec<u8> {
    // Serialization of this shape cannot fail.
    serde_json::to_vec(self).unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insert_lookup_delete() {
    let store = KvStore::new();
    assert!(store.lookup("k").is_none());
    store.insert("k", Bytes::from_static(b"v1"), None);
    let first = store.lookup("k").unwrap();
    assert_eq!(first.data, Bytes::from_static(b"v1"));
    assert!(first.metadata.is_none());

    store.insert("k", Bytes::from_static(b"v2"), Some(Bytes::from_static(b"m")));
    let second = store.lookup("k").unwrap();
    assert_eq!(second.data, Bytes::from_static(b"v2"));
    assert_eq!(second.metadata, Some(Bytes::from_static(b"m")));
    assert!(second.generation > first.generation);

    assert!(store.delete("k"));
    assert!(!store.delete("k"));
    assert!(store.lookup("k").is_none());
  }

  #[test]
  fn list_pages_with_prefix_and_cursor() {
    let store = KvStore::new();
    for key in ["a/1", "a/2", "a/3", "b/1"] {
      store.insert(key, Bytes::from_static(b"x"), None);
    }
    let page = store.list(Some("a/"), Some(2), None);
    assert_eq!(page.data, vec!["a/1", "a/2"]);
    assert_eq!(page.meta.next_cursor.as_deref(), Some("a/2"));

    let page = store.list(Some("a/"), Some(2), Some("a/2"));
    assert_eq!(page.data, vec!["a/3"]);
    assert!(page.meta.next_cursor.is_none());

    let page = store.list(None, None, None);
    assert_eq!(page.data.len(), 4);
    let json = String::from_utf8(page.to_json()).unwrap();
    assert!(json.starts_with("{\"data\":[\"a/1\""));
  }
}
