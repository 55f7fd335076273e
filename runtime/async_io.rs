// Copyright 2018-2026 the Deno authors. MIT license.

//! The async coordinator.
//!
//! Every guest-observable in-flight operation is an [`AsyncItem`] in one
//! unified handle table: bodies, pending subrequests, pending KV
//! operations, busy cache lookups and the downstream next-request
//! promise. Each resolves to a completion signal, which is what the
//! n-way `select` and the non-blocking readiness poll consume.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use xqd_sync::ReadyFlag;

use crate::body::Body;
use crate::pending::PendingRequest;

/// Sentinel written by `select` on timeout.
pub const SELECT_TIMEOUT: u32 = u32::MAX;

/// A KV operation completing in the background, parameterized by its
/// result.
pub struct PendingKv<T> {
  ready: Arc<ReadyFlag>,
  result: Arc<Mutex<Option<T>>>,
}

impl<T> PendingKv<T> {
  /// An operation that already completed with `value`.
  pub fn resolved(value: T) -> Self {
    let ready = Arc::new(ReadyFlag::new());
    ready.set();
    Self {
      ready,
      result: Arc::new(Mutex::new(Some(value))),
    }
  }

  pub fn ready_flag(&self) -> Arc<ReadyFlag> {
    self.ready.clone()
  }

  pub fn is_done(&self) -> bool {
    self.ready.is_set()
  }

  /// Take the result; `None` until completion (or after a prior take).
  pub fn take(&self) -> Option<T> {
    self.result.lock().take()
  }
}

/// A transactional cache lookup resolving in the background (it may be
/// parked behind another transaction on the same key).
pub struct CacheBusy {
  ready: Arc<ReadyFlag>,
  transaction: Arc<Mutex<Option<xqd_cache::Transaction>>>,
  cancelled: Arc<AtomicBool>,
}

impl CacheBusy {
  pub fn new() -> Self {
    Self {
      ready: Arc::new(ReadyFlag::new()),
      transaction: Arc::new(Mutex::new(None)),
      cancelled: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn ready_flag(&self) -> Arc<ReadyFlag> {
    self.ready.clone()
  }

  pub fn resolver(&self) -> CacheBusyResolver {
    CacheBusyResolver {
      ready: self.ready.clone(),
      transaction: self.transaction.clone(),
      cancelled: self.cancelled.clone(),
    }
  }

  pub fn take(&self) -> Option<xqd_cache::Transaction> {
    self.transaction.lock().take()
  }

  /// Mark the handle closed before resolution; the resolver will cancel
  /// the transaction instead of parking it.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }
}

impl Default for CacheBusy {
  fn default() -> Self {
    Self::new()
  }
}

/// The write half handed to the background lookup task.
pub struct CacheBusyResolver {
  ready: Arc<ReadyFlag>,
  transaction: Arc<Mutex<Option<xqd_cache::Transaction>>>,
  cancelled: Arc<AtomicBool>,
}

impl CacheBusyResolver {
  pub fn resolve(
    self,
    cache: &xqd_cache::Cache,
    mut transaction: xqd_cache::Transaction,
  ) {
    if self.cancelled.load(Ordering::SeqCst) {
      cache.transaction_cancel(&mut transaction);
    } else {
      *self.transaction.lock() = Some(transaction);
    }
    self.ready.set();
  }
}

/// The promise handed out by `fastly_http_downstream::next_request`. A
/// single-request session never produces another downstream request, so
/// the promise only ever completes by abandonment.
pub struct DownstreamNext {
  ready: Arc<ReadyFlag>,
  abandoned: Arc<AtomicBool>,
}

impl DownstreamNext {
  pub fn new() -> Self {
    Self {
      ready: Arc::new(ReadyFlag::new()),
      abandoned: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn ready_flag(&self) -> Arc<ReadyFlag> {
    self.ready.clone()
  }

  pub fn abandon(&self) {
    self.abandoned.store(true, Ordering::SeqCst);
    self.ready.set();
  }

  pub fn is_abandoned(&self) -> bool {
    self.abandoned.load(Ordering::SeqCst)
  }
}

impl Default for DownstreamNext {
  fn default() -> Self {
    Self::new()
  }
}

/// Everything the guest can wait on, all in one handle space.
pub enum AsyncItem {
  Body(Body),
  PendingReq(PendingRequest),
  KvLookup(PendingKv<Option<xqd_kv::KvValue>>),
  KvInsert(PendingKv<()>),
  KvDelete(PendingKv<bool>),
  KvList(PendingKv<Vec<u8>>),
  CacheBusy(CacheBusy),
  DownstreamNext(DownstreamNext),
}

impl AsyncItem {
  pub fn as_body(&self) -> Option<&Body> {
    match self {
      Self::Body(body) => Some(body),
      _ => None,
    }
  }

  pub fn as_body_mut(&mut self) -> Option<&mut Body> {
    match self {
      Self::Body(body) => Some(body),
      _ => None,
    }
  }

  pub fn as_pending_req(&self) -> Option<&PendingRequest> {
    match self {
      Self::PendingReq(pending) => Some(pending),
      _ => None,
    }
  }

  /// Non-blocking readiness: true when a wait would return without
  /// suspending.
  pub fn is_ready(&self) -> bool {
    match self {
      Self::Body(body) => body.stream().is_ready_at(body.read_offset()),
      Self::PendingReq(pending) => pending.is_done(),
      Self::KvLookup(op) => op.is_done(),
      Self::KvInsert(op) => op.is_done(),
      Self::KvDelete(op) => op.is_done(),
      Self::KvList(op) => op.is_done(),
      Self::CacheBusy(busy) => busy.ready_flag().is_set(),
      Self::DownstreamNext(next) => next.ready_flag().is_set(),
    }
  }

  /// A future resolving when the item becomes ready. Owns its clocks and
  /// clones, so the session is free while a waiter is parked on it.
  pub fn ready_future(&self) -> BoxFuture<'static, ()> {
    match self {
      Self::Body(body) => {
        let stream = body.stream();
        let offset = body.read_offset();
        async move { stream.ready_at(offset).await }.boxed()
      }
      Self::PendingReq(pending) => {
        let flag = pending.ready_flag();
        async move { flag.wait().await }.boxed()
      }
      Self::KvLookup(op) => flag_future(op.ready_flag()),
      Self::KvInsert(op) => flag_future(op.ready_flag()),
      Self::KvDelete(op) => flag_future(op.ready_flag()),
      Self::KvList(op) => flag_future(op.ready_flag()),
      Self::CacheBusy(busy) => flag_future(busy.ready_flag()),
      Self::DownstreamNext(next) => flag_future(next.ready_flag()),
    }
  }
}

fn flag_future(flag: Arc<ReadyFlag>) -> BoxFuture<'static, ()> {
  async move { flag.wait().await }.boxed()
}

/// Wait for the first of `futures` to complete, up to `timeout_ms`
/// (0 = no timeout). Returns the winning index, or `None` on timeout.
///
/// Runs on the guest thread via `Handle::block_on`; the caller pauses
/// CPU accounting around it.
pub fn block_until_first(
  handle: &tokio::runtime::Handle,
  futures: Vec<BoxFuture<'static, ()>>,
  timeout_ms: u32,
) -> Option<u32> {
  handle.block_on(async move {
    let race = async move {
      if futures.is_empty() {
        // Nothing can ever fire; park until the timeout does.
        futures::future::pending::<()>().await;
        unreachable!();
      }
      let (_, index, _) = futures::future::select_all(futures).await;
      index as u32
    };
    if timeout_ms == 0 {
      Some(race.await)
    } else {
      let timeout = std::time::Duration::from_millis(u64::from(timeout_ms));
      tokio::time::timeout(timeout, race).await.ok()
    }
  })
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  fn flag_item(set: bool) -> AsyncItem {
    let pending = PendingRequest::new();
    if set {
      pending.publish(Err("done".to_string()));
    }
    AsyncItem::PendingReq(pending)
  }

  #[test]
  fn readiness_reflects_completion() {
    assert!(!flag_item(false).is_ready());
    assert!(flag_item(true).is_ready());
    let resolved = AsyncItem::KvInsert(PendingKv::resolved(()));
    assert!(resolved.is_ready());
  }

  #[test]
  fn select_returns_the_first_completion() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let items: Vec<PendingRequest> =
      (0..3).map(|_| PendingRequest::new()).collect();
    for (index, delay_ms) in [(0u32, 50u64), (1, 30), (2, 100)] {
      let pending = items[index as usize].clone();
      runtime.spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        pending.publish(Err("done".to_string()));
      });
    }
    let futures = items
      .iter()
      .map(|pending| AsyncItem::PendingReq(pending.clone()).ready_future())
      .collect();
    let winner = block_until_first(runtime.handle(), futures, 200);
    assert_eq!(winner, Some(1));
  }

  #[test]
  fn select_times_out_with_the_sentinel_path() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pending = PendingRequest::new();
    let futures =
      vec![AsyncItem::PendingReq(pending.clone()).ready_future()];
    let winner = block_until_first(runtime.handle(), futures, 20);
    assert_eq!(winner, None);
  }

  #[test]
  fn empty_select_with_timeout_sleeps_then_times_out() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let started = std::time::Instant::now();
    let winner = block_until_first(runtime.handle(), Vec::new(), 30);
    assert_eq!(winner, None);
    assert!(started.elapsed() >= Duration::from_millis(25));
  }

  #[test]
  fn cache_busy_resolution_parks_or_cancels() {
    let cache = xqd_cache::Cache::new();
    let busy = CacheBusy::new();
    let resolver = busy.resolver();
    let tx = cache.transaction_lookup(b"K", &http::HeaderMap::new());
    resolver.resolve(&cache, tx);
    assert!(busy.ready_flag().is_set());
    let mut tx = busy.take().unwrap();
    assert!(tx.must_insert_or_update());
    cache.transaction_cancel(&mut tx);

    // A closed busy handle cancels on resolution, releasing the key for
    // the next transaction without blocking.
    let busy = CacheBusy::new();
    busy.cancel();
    let resolver = busy.resolver();
    let tx = cache.transaction_lookup(b"K2", &http::HeaderMap::new());
    resolver.resolve(&cache, tx);
    assert!(busy.take().is_none());
    let mut retry = cache.transaction_lookup(b"K2", &http::HeaderMap::new());
    assert!(retry.must_insert_or_update());
    cache.transaction_cancel(&mut retry);
  }
}
