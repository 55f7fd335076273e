// Copyright 2018-2026 the Deno authors. MIT license.

//! The in-memory core cache.
//!
//! Cached items live under an opaque byte key; each key holds an ordered
//! list of variants partitioned by the inserting object's vary rule.
//! Transactional lookups collapse concurrent misses onto a single
//! inserter, insertion streams (readers may consume the body while the
//! writer is still producing), and surrogate keys support bulk hard and
//! soft purging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use xqd_sync::ByteStream;
use xqd_sync::ReadyFlag;

mod http_facade;
mod object;
mod variant;

pub use http_facade::is_request_cacheable;
pub use http_facade::suggested_cache_key;
pub use http_facade::suggested_write_options;
pub use object::CacheObject;
pub use object::LookupState;
pub use object::WriteOptions;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The operation is not valid for the transaction's current state,
  /// e.g. update without a found object or insert without an
  /// insert-or-update obligation.
  #[error("invalid cache transaction operation")]
  InvalidOperation,
}

/// The result of a non-transactional lookup.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub state: LookupState,
  pub object: Option<Arc<CacheObject>>,
}

impl CacheEntry {
  fn not_found() -> Self {
    Self {
      state: LookupState::empty(),
      object: None,
    }
  }

  pub fn found(&self) -> bool {
    self.state.contains(LookupState::FOUND)
  }
}

/// A transactional lookup. At most one transaction per key may hold the
/// insert-or-update obligation at a time; others collapse onto it.
#[derive(Debug)]
pub struct Transaction {
  key: Vec<u8>,
  state: LookupState,
  object: Option<Arc<CacheObject>>,
  request_headers: HeaderMap,
  obligated: bool,
}

impl Transaction {
  pub fn key(&self) -> &[u8] {
    &self.key
  }

  pub fn state(&self) -> LookupState {
    self.state
  }

  pub fn object(&self) -> Option<&Arc<CacheObject>> {
    self.object.as_ref()
  }

  pub fn must_insert_or_update(&self) -> bool {
    self.state.contains(LookupState::MUST_INSERT_OR_UPDATE)
  }
}

#[derive(Debug, Default)]
struct CacheMap {
  /// key → variants, oldest first.
  objects: HashMap<Vec<u8>, Vec<Arc<CacheObject>>>,
  /// surrogate key → cache keys carrying it.
  surrogates: HashMap<String, Vec<Vec<u8>>>,
}

#[derive(Debug, Default)]
pub struct Cache {
  map: RwLock<CacheMap>,
  /// key → ready signal of the single in-flight transaction.
  pending: Mutex<HashMap<Vec<u8>, Arc<ReadyFlag>>>,
}

impl Cache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Non-transactional lookup. Never creates or waits for a pending
  /// transaction. If no variant matches the request headers exactly, the
  /// most recently inserted variant is returned.
  pub fn lookup(&self, key: &[u8], request_headers: &HeaderMap) -> CacheEntry {
    self.lookup_at(key, request_headers, Instant::now())
  }

  pub fn lookup_at(
    &self,
    key: &[u8],
    request_headers: &HeaderMap,
    now: Instant,
  ) -> CacheEntry {
    let map = self.map.read();
    let Some(variants) = map.objects.get(key) else {
      return CacheEntry::not_found();
    };
    let object = match select_variant(key, variants, request_headers) {
      Some(object) => object,
      None => match variants.last() {
        Some(object) => object.clone(),
        None => return CacheEntry::not_found(),
      },
    };
    object.record_hit();
    CacheEntry {
      state: object.lookup_state_at(now),
      object: Some(object),
    }
  }

  /// Transactional lookup with request collapsing.
  ///
  /// If another transaction is in flight for `key`, blocks until it
  /// completes and then retries, observing its result. Otherwise the
  /// lookup is strict about variant matching, and a miss (or a
  /// stale-and-unusable hit) takes on the insert-or-update obligation.
  pub fn transaction_lookup(
    &self,
    key: &[u8],
    request_headers: &HeaderMap,
  ) -> Transaction {
    self.transaction_lookup_at(key, request_headers, Instant::now())
  }

  pub fn transaction_lookup_at(
    &self,
    key: &[u8],
    request_headers: &HeaderMap,
    now: Instant,
  ) -> Transaction {
    loop {
      let mut pending = self.pending.lock();
      if let Some(flag) = pending.get(key).cloned() {
        drop(pending);
        flag.wait_blocking();
        continue;
      }
      let map = self.map.read();
      let object = map
        .objects
        .get(key)
        .and_then(|variants| select_variant(key, variants, request_headers));
      let mut state = LookupState::empty();
      match &object {
        Some(object) => {
          state |= object.lookup_state_at(now);
          if !object.is_usable_at(now) {
            state |= LookupState::MUST_INSERT_OR_UPDATE;
          } else {
            object.record_hit();
          }
        }
        None => state |= LookupState::MUST_INSERT_OR_UPDATE,
      }
      let obligated = state.contains(LookupState::MUST_INSERT_OR_UPDATE);
      if obligated {
        pending.insert(key.to_vec(), Arc::new(ReadyFlag::new()));
      }
      return Transaction {
        key: key.to_vec(),
        state,
        object,
        request_headers: request_headers.clone(),
        obligated,
      };
    }
  }

  /// Insert a fresh object under the transaction's key, releasing the
  /// collapsing obligation. Returns the write stream and the inserted
  /// object (whose body readers may consume concurrently).
  pub fn transaction_insert(
    &self,
    tx: &mut Transaction,
    options: WriteOptions,
  ) -> Result<(ByteStream, Arc<CacheObject>), CacheError> {
    self.transaction_insert_at(tx, options, Instant::now())
  }

  pub fn transaction_insert_at(
    &self,
    tx: &mut Transaction,
    options: WriteOptions,
    now: Instant,
  ) -> Result<(ByteStream, Arc<CacheObject>), CacheError> {
    if !tx.obligated {
      return Err(CacheError::InvalidOperation);
    }
    let object =
      self.insert_object(&tx.key, &tx.request_headers, options, now);
    tx.object = Some(object.clone());
    tx.state = object.lookup_state_at(now);
    self.release(tx);
    Ok((object.body(), object))
  }

  /// Non-transactional insert.
  pub fn insert(
    &self,
    key: &[u8],
    request_headers: &HeaderMap,
    options: WriteOptions,
  ) -> ByteStream {
    self
      .insert_object(key, request_headers, options, Instant::now())
      .body()
  }

  pub fn insert_at(
    &self,
    key: &[u8],
    request_headers: &HeaderMap,
    options: WriteOptions,
    now: Instant,
  ) -> ByteStream {
    self.insert_object(key, request_headers, options, now).body()
  }

  fn insert_object(
    &self,
    key: &[u8],
    request_headers: &HeaderMap,
    options: WriteOptions,
    now: Instant,
  ) -> Arc<CacheObject> {
    let variant_key = variant::variant_key(
      key,
      options.vary_rule.as_deref(),
      request_headers,
    );
    let object = Arc::new(CacheObject::new(
      &options,
      variant_key,
      request_headers.clone(),
      now,
    ));
    let mut map = self.map.write();
    let variants = map.objects.entry(key.to_vec()).or_default();
    // One variant per variant key: a new insert supersedes its
    // predecessor.
    variants.retain(|existing| existing.variant_key != object.variant_key);
    variants.push(object.clone());
    for surrogate in object.surrogate_keys() {
      let keys = map.surrogates.entry(surrogate).or_default();
      if !keys.iter().any(|existing| existing == key) {
        keys.push(key.to_vec());
      }
    }
    object
  }

  /// Rewrite the found object's metadata in place and reset its age,
  /// releasing the collapsing obligation.
  pub fn transaction_update(
    &self,
    tx: &mut Transaction,
    options: WriteOptions,
  ) -> Result<(), CacheError> {
    self.transaction_update_at(tx, options, Instant::now())
  }

  pub fn transaction_update_at(
    &self,
    tx: &mut Transaction,
    options: WriteOptions,
    now: Instant,
  ) -> Result<(), CacheError> {
    if !tx.obligated {
      return Err(CacheError::InvalidOperation);
    }
    let Some(object) = tx.object.clone() else {
      return Err(CacheError::InvalidOperation);
    };
    object.update_at(&options, now);
    {
      let mut map = self.map.write();
      for surrogate in object.surrogate_keys() {
        let keys = map.surrogates.entry(surrogate).or_default();
        if !keys.iter().any(|existing| existing == &tx.key) {
          keys.push(tx.key.clone());
        }
      }
    }
    tx.state = object.lookup_state_at(now);
    self.release(tx);
    Ok(())
  }

  /// Abandon the transaction. Idempotent: a second cancel is a no-op.
  /// Collapsed waiters unblock and retry (one of them will take over the
  /// obligation).
  pub fn transaction_cancel(&self, tx: &mut Transaction) {
    self.release(tx);
  }

  /// Finish with the transaction, releasing the obligation if it is
  /// still held.
  pub fn complete(&self, tx: &mut Transaction) {
    self.release(tx);
  }

  fn release(&self, tx: &mut Transaction) {
    if !tx.obligated {
      return;
    }
    tx.obligated = false;
    if let Some(flag) = self.pending.lock().remove(&tx.key) {
      flag.set();
    }
  }

  /// Remove every variant of every key tagged with `surrogate`, and the
  /// surrogate index entry itself.
  pub fn purge_surrogate_key(&self, surrogate: &str) {
    let mut map = self.map.write();
    let Some(keys) = map.surrogates.remove(surrogate) else {
      return;
    };
    log::debug!("purging {} cache keys tagged {surrogate:?}", keys.len());
    for key in &keys {
      map.objects.remove(key);
    }
    // Scrub dangling keys from the other surrogate lists.
    let CacheMap {
      objects,
      surrogates,
    } = &mut *map;
    for list in surrogates.values_mut() {
      list.retain(|key| objects.contains_key(key));
    }
    surrogates.retain(|_, list| !list.is_empty());
  }

  /// Make every object tagged with `surrogate` immediately stale while
  /// leaving it usable through stale-while-revalidate.
  pub fn soft_purge_surrogate_key(&self, surrogate: &str) {
    self.soft_purge_surrogate_key_at(surrogate, Instant::now());
  }

  pub fn soft_purge_surrogate_key_at(&self, surrogate: &str, now: Instant) {
    let map = self.map.read();
    let Some(keys) = map.surrogates.get(surrogate) else {
      return;
    };
    for key in keys {
      let Some(variants) = map.objects.get(key) else {
        continue;
      };
      for object in variants {
        if object.surrogate_keys().iter().any(|sk| sk == surrogate) {
          object.soft_purge_at(now);
        }
      }
    }
  }
}

/// Strict variant selection: the stored variant whose variant key equals
/// the one derived from its vary rule and the presented request headers.
/// Most recent wins.
fn select_variant(
  key: &[u8],
  variants: &[Arc<CacheObject>],
  request_headers: &HeaderMap,
) -> Option<Arc<CacheObject>> {
  variants
    .iter()
    .rev()
    .find(|object| {
      let candidate = variant::variant_key(
        key,
        object.vary_rule.as_deref(),
        request_headers,
      );
      candidate == object.variant_key
    })
    .cloned()
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use pretty_assertions::assert_eq;

  use super::*;

  fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
      map.append(
        http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
        http::HeaderValue::from_str(value).unwrap(),
      );
    }
    map
  }

  fn write_options(max_age: Duration) -> WriteOptions {
    WriteOptions {
      max_age_ns: max_age.as_nanos() as u64,
      ..Default::default()
    }
  }

  fn insert_done(cache: &Cache, key: &[u8], body: &[u8], opts: WriteOptions) {
    let mut tx = cache.transaction_lookup(key, &HeaderMap::new());
    let (stream, _) = cache.transaction_insert(&mut tx, opts).unwrap();
    stream.write(body).unwrap();
    stream.finish();
  }

  #[test]
  fn miss_then_insert_then_hit() {
    let cache = Cache::new();
    let entry = cache.lookup(b"K", &HeaderMap::new());
    assert!(!entry.found());

    insert_done(&cache, b"K", b"payload", write_options(Duration::from_secs(60)));

    let entry = cache.lookup(b"K", &HeaderMap::new());
    assert!(entry.found());
    let object = entry.object.unwrap();
    assert!(entry.state.contains(LookupState::USABLE));
    assert_eq!(
      object.body().read_at(0, 100, true).unwrap(),
      b"payload".to_vec()
    );
    assert_eq!(object.hits(), 1);
  }

  #[test]
  fn request_collapsing_one_insert_two_observers() {
    let cache = Arc::new(Cache::new());
    let first = cache.transaction_lookup(b"K", &HeaderMap::new());
    assert!(first.must_insert_or_update());

    let waiter = {
      let cache = cache.clone();
      std::thread::spawn(move || {
        cache.transaction_lookup(b"K", &HeaderMap::new())
      })
    };
    // Give the waiter time to block on the pending transaction.
    std::thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    let mut first = first;
    let (stream, _) = cache
      .transaction_insert(&mut first, write_options(Duration::from_secs(60)))
      .unwrap();
    stream.write(b"once").unwrap();
    stream.finish();

    let second = waiter.join().unwrap();
    assert!(second.state().contains(LookupState::FOUND));
    assert!(second.state().contains(LookupState::USABLE));
    assert!(!second.must_insert_or_update());
    assert_eq!(
      second.object().unwrap().body().read_at(0, 10, true).unwrap(),
      b"once".to_vec()
    );
    assert_eq!(cache.map.read().objects.get(&b"K"[..]).unwrap().len(), 1);
  }

  #[test]
  fn cancelled_transaction_hands_the_obligation_over() {
    let cache = Arc::new(Cache::new());
    let mut first = cache.transaction_lookup(b"K", &HeaderMap::new());
    let waiter = {
      let cache = cache.clone();
      std::thread::spawn(move || {
        cache.transaction_lookup(b"K", &HeaderMap::new())
      })
    };
    std::thread::sleep(Duration::from_millis(30));
    cache.transaction_cancel(&mut first);
    // Second cancel is a no-op.
    cache.transaction_cancel(&mut first);
    let second = waiter.join().unwrap();
    assert!(second.must_insert_or_update());
  }

  #[test]
  fn vary_selects_the_matching_variant() {
    let cache = Cache::new();
    let gzip = headers(&[("accept-encoding", "gzip")]);
    let mut tx = cache.transaction_lookup(b"K", &gzip);
    let (stream, _) = cache
      .transaction_insert(
        &mut tx,
        WriteOptions {
          max_age_ns: Duration::from_secs(60).as_nanos() as u64,
          vary_rule: Some("accept-encoding".to_string()),
          ..Default::default()
        },
      )
      .unwrap();
    stream.write(b"gzip-body").unwrap();
    stream.finish();

    // Matching headers: the variant is found in both paths.
    let entry = cache.lookup(b"K", &gzip);
    assert!(entry.found());

    // Non-matching headers: the non-transactional path falls back to
    // the most recent variant, the transactional path misses.
    let brotli = headers(&[("accept-encoding", "br")]);
    let entry = cache.lookup(b"K", &brotli);
    assert!(entry.found());

    let mut tx = cache.transaction_lookup(b"K", &brotli);
    assert!(tx.must_insert_or_update());
    assert!(tx.object().is_none());
    cache.transaction_cancel(&mut tx);
  }

  #[test]
  fn streaming_insert_with_concurrent_reader() {
    let cache = Cache::new();
    let mut tx = cache.transaction_lookup(b"K", &HeaderMap::new());
    let (writer, object) = cache
      .transaction_insert(&mut tx, write_options(Duration::from_secs(60)))
      .unwrap();
    let reader = object.body();

    writer.write(b"abc").unwrap();
    assert_eq!(reader.read_at(0, 16, true).unwrap(), b"abc".to_vec());
    writer.write(b"de").unwrap();
    writer.finish();
    assert_eq!(reader.read_at(3, 16, true).unwrap(), b"de".to_vec());
    assert_eq!(reader.read_at(5, 16, true).unwrap(), Vec::<u8>::new());
    assert_eq!(object.known_length(), Some(5));
  }

  #[test]
  fn hard_purge_removes_tagged_keys_and_the_index_entry() {
    let cache = Cache::new();
    let tagged = WriteOptions {
      max_age_ns: Duration::from_secs(60).as_nanos() as u64,
      surrogate_keys: vec!["sk1".to_string()],
      ..Default::default()
    };
    insert_done(&cache, b"A", b"a", tagged.clone());
    insert_done(&cache, b"B", b"b", tagged);
    insert_done(&cache, b"C", b"c", write_options(Duration::from_secs(60)));

    cache.purge_surrogate_key("sk1");

    assert!(!cache.lookup(b"A", &HeaderMap::new()).found());
    assert!(!cache.lookup(b"B", &HeaderMap::new()).found());
    assert!(cache.lookup(b"C", &HeaderMap::new()).found());
    assert!(cache.map.read().surrogates.get("sk1").is_none());
  }

  #[test]
  fn soft_purge_leaves_objects_usable_through_swr() {
    let cache = Cache::new();
    insert_done(
      &cache,
      b"A",
      b"a",
      WriteOptions {
        max_age_ns: Duration::from_secs(60).as_nanos() as u64,
        stale_while_revalidate_ns: Duration::from_secs(30).as_nanos() as u64,
        surrogate_keys: vec!["sk1".to_string()],
        ..Default::default()
      },
    );
    let now = Instant::now();
    cache.soft_purge_surrogate_key_at("sk1", now);

    let entry = cache.lookup_at(b"A", &HeaderMap::new(), now);
    assert!(entry.found());
    assert!(entry.state.contains(LookupState::STALE));
    assert!(entry.state.contains(LookupState::USABLE));

    let later = now + Duration::from_secs(31);
    let entry = cache.lookup_at(b"A", &HeaderMap::new(), later);
    assert!(entry.found());
    assert!(!entry.state.contains(LookupState::USABLE));
    // Still indexed: soft purge removes nothing.
    assert!(cache.map.read().surrogates.get("sk1").is_some());
  }

  #[test]
  fn transaction_update_requires_a_found_object() {
    let cache = Cache::new();
    let mut tx = cache.transaction_lookup(b"K", &HeaderMap::new());
    let err = cache
      .transaction_update(&mut tx, write_options(Duration::from_secs(1)));
    assert!(matches!(err, Err(CacheError::InvalidOperation)));
    cache.transaction_cancel(&mut tx);
  }

  #[test]
  fn stale_hit_carries_the_update_obligation() {
    let cache = Cache::new();
    let now = Instant::now();
    let mut tx = cache.transaction_lookup_at(b"K", &HeaderMap::new(), now);
    let (stream, _) = cache
      .transaction_insert_at(&mut tx, write_options(Duration::from_secs(1)), now)
      .unwrap();
    stream.write(b"v1").unwrap();
    stream.finish();

    // Well past max-age with no swr: stale and unusable.
    let later = now + Duration::from_secs(10);
    let mut tx = cache.transaction_lookup_at(b"K", &HeaderMap::new(), later);
    assert!(tx.must_insert_or_update());
    assert!(tx.state().contains(LookupState::STALE));
    assert!(tx.object().is_some());

    cache
      .transaction_update_at(&mut tx, write_options(Duration::from_secs(60)), later)
      .unwrap();
    let entry = cache.lookup_at(b"K", &HeaderMap::new(), later);
    assert!(entry.state.contains(LookupState::USABLE));
    // The body survives an update untouched.
    assert_eq!(
      entry.object.unwrap().body().read_at(0, 10, true).unwrap(),
      b"v1".to_vec()
    );
  }
}
