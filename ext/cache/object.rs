// Copyright 2018-2026 the Deno authors. MIT license.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use http::HeaderMap;
use xqd_sync::ByteStream;

bitflags::bitflags! {
  /// Guest-visible lookup state bits.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct LookupState: u32 {
    const FOUND = 1;
    const USABLE = 2;
    const STALE = 4;
    const MUST_INSERT_OR_UPDATE = 8;
  }
}

/// Metadata supplied when inserting or updating a cached object.
#[derive(Debug, Clone)]
pub struct WriteOptions {
  pub max_age_ns: u64,
  pub initial_age_ns: u64,
  pub stale_while_revalidate_ns: u64,
  pub edge_max_age_ns: u64,
  pub vary_rule: Option<String>,
  pub surrogate_keys: Vec<String>,
  pub user_metadata: Bytes,
  pub length: Option<u64>,
  pub sensitive_data: bool,
}

impl Default for WriteOptions {
  fn default() -> Self {
    Self {
      max_age_ns: 0,
      initial_age_ns: 0,
      stale_while_revalidate_ns: 0,
      edge_max_age_ns: 0,
      vary_rule: None,
      surrogate_keys: Vec::new(),
      user_metadata: Bytes::new(),
      length: None,
      sensitive_data: false,
    }
  }
}

/// Mutable freshness metadata; rewritten by `transaction_update` and by
/// soft purge.
#[derive(Debug, Clone)]
pub(crate) struct ObjectMeta {
  pub max_age_ns: u64,
  pub initial_age_ns: u64,
  pub stale_while_revalidate_ns: u64,
  pub edge_max_age_ns: u64,
  pub user_metadata: Bytes,
  pub surrogate_keys: Vec<String>,
  pub inserted: Instant,
}

/// One cached variant.
#[derive(Debug)]
pub struct CacheObject {
  pub(crate) body: ByteStream,
  pub(crate) meta: parking_lot::Mutex<ObjectMeta>,
  pub(crate) vary_rule: Option<String>,
  pub(crate) variant_key: Vec<u8>,
  pub(crate) request_headers: HeaderMap,
  pub(crate) length: Option<u64>,
  pub(crate) sensitive_data: bool,
  pub(crate) hits: AtomicU64,
}

impl CacheObject {
  pub(crate) fn new(
    options: &WriteOptions,
    variant_key: Vec<u8>,
    request_headers: HeaderMap,
    now: Instant,
  ) -> Self {
    Self {
      body: ByteStream::new(),
      meta: parking_lot::Mutex::new(ObjectMeta {
        max_age_ns: options.max_age_ns,
        initial_age_ns: options.initial_age_ns,
        stale_while_revalidate_ns: options.stale_while_revalidate_ns,
        edge_max_age_ns: options.edge_max_age_ns,
        user_metadata: options.user_metadata.clone(),
        surrogate_keys: options.surrogate_keys.clone(),
        inserted: now,
      }),
      vary_rule: options.vary_rule.clone(),
      variant_key,
      request_headers,
      length: options.length,
      sensitive_data: options.sensitive_data,
      hits: AtomicU64::new(0),
    }
  }

  /// The body channel. Readers may consume it while the inserting writer
  /// is still streaming.
  pub fn body(&self) -> ByteStream {
    self.body.clone()
  }

  /// `age = (now − insertion) + initial_age`.
  pub fn age_ns_at(&self, now: Instant) -> u64 {
    let meta = self.meta.lock();
    let since_insert =
      now.saturating_duration_since(meta.inserted).as_nanos() as u64;
    since_insert.saturating_add(meta.initial_age_ns)
  }

  pub fn age_ns(&self) -> u64 {
    self.age_ns_at(Instant::now())
  }

  pub fn is_stale_at(&self, now: Instant) -> bool {
    self.age_ns_at(now) > self.meta.lock().max_age_ns
  }

  /// Usable: fresh, or within the stale-while-revalidate grace window.
  pub fn is_usable_at(&self, now: Instant) -> bool {
    let age = self.age_ns_at(now);
    let meta = self.meta.lock();
    age <= meta.max_age_ns
      || age <= meta.max_age_ns.saturating_add(meta.stale_while_revalidate_ns)
  }

  pub(crate) fn lookup_state_at(&self, now: Instant) -> LookupState {
    let mut state = LookupState::FOUND;
    if self.is_stale_at(now) {
      state |= LookupState::STALE;
    }
    if self.is_usable_at(now) {
      state |= LookupState::USABLE;
    }
    state
  }

  /// Make the object stale immediately while leaving the
  /// stale-while-revalidate window open from `now`.
  pub(crate) fn soft_purge_at(&self, now: Instant) {
    let mut meta = self.meta.lock();
    meta.initial_age_ns = meta.max_age_ns.saturating_add(1);
    meta.inserted = now;
  }

  /// Rewrite metadata in place and reset the object's age.
  pub(crate) fn update_at(&self, options: &WriteOptions, now: Instant) {
    let mut meta = self.meta.lock();
    meta.max_age_ns = options.max_age_ns;
    meta.initial_age_ns = options.initial_age_ns;
    meta.stale_while_revalidate_ns = options.stale_while_revalidate_ns;
    meta.edge_max_age_ns = options.edge_max_age_ns;
    meta.user_metadata = options.user_metadata.clone();
    meta.surrogate_keys = options.surrogate_keys.clone();
    meta.inserted = now;
  }

  pub fn max_age_ns(&self) -> u64 {
    self.meta.lock().max_age_ns
  }

  pub fn stale_while_revalidate_ns(&self) -> u64 {
    self.meta.lock().stale_while_revalidate_ns
  }

  pub fn user_metadata(&self) -> Bytes {
    self.meta.lock().user_metadata.clone()
  }

  pub fn surrogate_keys(&self) -> Vec<String> {
    self.meta.lock().surrogate_keys.clone()
  }

  /// The object length: the declared length if one was given, otherwise
  /// the body length once the writer has finished.
  pub fn known_length(&self) -> Option<u64> {
    self.length.or_else(|| self.body.known_length())
  }

  pub fn is_sensitive(&self) -> bool {
    self.sensitive_data
  }

  pub(crate) fn record_hit(&self) -> u64 {
    self.hits.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub fn hits(&self) -> u64 {
    self.hits.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  fn duration_ns(duration: Duration) -> u64 {
    duration.as_nanos() as u64
  }

  fn object(max_age: Duration, swr: Duration, initial: Duration) -> CacheObject {
    let options = WriteOptions {
      max_age_ns: duration_ns(max_age),
      initial_age_ns: duration_ns(initial),
      stale_while_revalidate_ns: duration_ns(swr),
      ..Default::default()
    };
    CacheObject::new(&options, Vec::new(), HeaderMap::new(), Instant::now())
  }

  #[test]
  fn age_accumulates_from_initial_age() {
    let obj = object(
      Duration::from_secs(60),
      Duration::ZERO,
      Duration::from_secs(10),
    );
    let inserted = obj.meta.lock().inserted;
    assert_eq!(
      obj.age_ns_at(inserted + Duration::from_secs(5)),
      duration_ns(Duration::from_secs(15))
    );
  }

  #[test]
  fn stale_and_usable_track_the_freshness_windows() {
    let obj = object(
      Duration::from_secs(60),
      Duration::from_secs(30),
      Duration::ZERO,
    );
    let inserted = obj.meta.lock().inserted;

    let fresh = inserted + Duration::from_secs(59);
    assert!(!obj.is_stale_at(fresh));
    assert!(obj.is_usable_at(fresh));

    let graced = inserted + Duration::from_secs(80);
    assert!(obj.is_stale_at(graced));
    assert!(obj.is_usable_at(graced));
    assert_eq!(
      obj.lookup_state_at(graced),
      LookupState::FOUND | LookupState::STALE | LookupState::USABLE
    );

    let dead = inserted + Duration::from_secs(91);
    assert!(obj.is_stale_at(dead));
    assert!(!obj.is_usable_at(dead));
  }

  #[test]
  fn soft_purge_is_stale_but_usable_within_swr() {
    let obj = object(
      Duration::from_secs(60),
      Duration::from_secs(30),
      Duration::ZERO,
    );
    let now = Instant::now();
    obj.soft_purge_at(now);
    assert!(obj.is_stale_at(now));
    assert!(obj.is_usable_at(now + Duration::from_secs(29)));
    assert!(!obj.is_usable_at(now + Duration::from_secs(31)));
  }

  #[test]
  fn update_resets_age() {
    let obj = object(
      Duration::from_secs(1),
      Duration::ZERO,
      Duration::from_secs(100),
    );
    let now = Instant::now() + Duration::from_secs(5);
    assert!(obj.is_stale_at(now));
    obj.update_at(
      &WriteOptions {
        max_age_ns: duration_ns(Duration::from_secs(60)),
        ..Default::default()
      },
      now,
    );
    assert!(!obj.is_stale_at(now));
    assert_eq!(obj.age_ns_at(now), 0);
  }
}
