// Copyright 2018-2026 the Deno authors. MIT license.

//! Per-request state.
//!
//! One session is attached to each wasm store; every hostcall retrieves
//! it through the caller's store data. All handle tables live here, as
//! does the downstream metadata and the active-CPU-time accounting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use url::Url;
use xqd_acl::Acl;
use xqd_kv::KvStore;

use crate::async_io::AsyncItem;
use crate::body::Body;
use crate::config::DictionaryFn;
use crate::config::LogSinkFn;
use crate::config::RuntimeConfig;
use crate::config::SecretFn;
use crate::config::TlsInfo;
use crate::error::FastlyStatus;
use crate::handles::HandleTable;
use crate::http::RequestRecord;
use crate::http::ResponseRecord;
use crate::pending::PendingRequest;

/// Wall-clock accounting of time the guest actually runs; paused while a
/// hostcall has the guest parked on a wait.
#[derive(Debug)]
pub struct CpuTimer {
  accumulated: Duration,
  resumed_at: Option<Instant>,
}

impl CpuTimer {
  pub fn started() -> Self {
    Self {
      accumulated: Duration::ZERO,
      resumed_at: Some(Instant::now()),
    }
  }

  pub fn pause(&mut self) {
    if let Some(resumed_at) = self.resumed_at.take() {
      self.accumulated += resumed_at.elapsed();
    }
  }

  pub fn resume(&mut self) {
    if self.resumed_at.is_none() {
      self.resumed_at = Some(Instant::now());
    }
  }

  pub fn total(&self) -> Duration {
    match self.resumed_at {
      Some(resumed_at) => self.accumulated + resumed_at.elapsed(),
      None => self.accumulated,
    }
  }

  pub fn total_ms(&self) -> u64 {
    self.total().as_millis() as u64
  }
}

/// Transport-level facts about the downstream connection.
#[derive(Debug, Clone)]
pub struct DownstreamMetadata {
  pub client_addr: SocketAddr,
  pub server_addr: SocketAddr,
  pub original_header_names: Vec<String>,
  pub tls: Option<TlsInfo>,
}

/// A guest-held cache handle: the captured lookup result plus, for
/// transactional handles, the live transaction.
pub struct CacheEntryRecord {
  pub key: Vec<u8>,
  pub state: xqd_cache::LookupState,
  pub object: Option<Arc<xqd_cache::CacheObject>>,
  pub transaction: Option<xqd_cache::Transaction>,
}

pub struct Logger {
  pub name: String,
  pub sink: LogSinkFn,
}

pub struct Session {
  pub(crate) config: Arc<RuntimeConfig>,
  pub(crate) handle: tokio::runtime::Handle,
  pub(crate) requests: HandleTable<RequestRecord>,
  pub(crate) responses: HandleTable<ResponseRecord>,
  pub(crate) async_items: HandleTable<AsyncItem>,
  pub(crate) cache_entries: HandleTable<CacheEntryRecord>,
  pub(crate) acls: HandleTable<Arc<Acl>>,
  pub(crate) dictionaries: HandleTable<DictionaryFn>,
  pub(crate) secret_stores: HandleTable<SecretFn>,
  pub(crate) secrets: HandleTable<Vec<u8>>,
  pub(crate) kv_stores: HandleTable<KvStore>,
  pub(crate) loggers: HandleTable<Logger>,
  pub(crate) downstream: DownstreamMetadata,
  downstream_original: (RequestRecord, Bytes),
  downstream_taken: bool,
  response_sender: Option<oneshot::Sender<(ResponseRecord, Vec<u8>)>>,
  pub(crate) cpu: CpuTimer,
  pub(crate) abi_initialized: bool,
}

impl Session {
  pub fn new(
    config: Arc<RuntimeConfig>,
    handle: tokio::runtime::Handle,
    inbound: http::Request<Bytes>,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    response_sender: oneshot::Sender<(ResponseRecord, Vec<u8>)>,
  ) -> Self {
    let (parts, body) = inbound.into_parts();
    let secure = (config.secure)(&parts);
    let record = inbound_record(&parts, secure);
    let original_header_names = parts
      .headers
      .keys()
      .map(|name| name.as_str().to_string())
      .collect();

    let mut session = Self {
      handle,
      requests: HandleTable::new(),
      responses: HandleTable::new(),
      async_items: HandleTable::new(),
      cache_entries: HandleTable::new(),
      acls: HandleTable::new(),
      dictionaries: HandleTable::new(),
      secret_stores: HandleTable::new(),
      secrets: HandleTable::new(),
      kv_stores: HandleTable::new(),
      loggers: HandleTable::new(),
      downstream: DownstreamMetadata {
        client_addr,
        server_addr,
        original_header_names,
        tls: secure.then(|| config.tls_info.clone()),
      },
      downstream_original: (record.clone(), body.clone()),
      downstream_taken: false,
      response_sender: Some(response_sender),
      cpu: CpuTimer::started(),
      abi_initialized: false,
      config,
    };
    // Handle 0 on both tables is the inbound pair.
    session.requests.insert(record);
    session
      .async_items
      .insert(AsyncItem::Body(Body::received(body.to_vec())));
    session
  }

  /// The downstream request/body pair. The seeded handles are handed out
  /// once; later calls clone the pristine inbound again.
  pub fn downstream_pair(&mut self) -> (u32, u32) {
    if !self.downstream_taken {
      self.downstream_taken = true;
      return (0, 0);
    }
    let (record, body) = self.downstream_original.clone();
    let req = self.requests.insert(record);
    let body = self
      .async_items
      .insert(AsyncItem::Body(Body::received(body.to_vec())));
    (req, body)
  }

  pub fn request(&self, handle: u32) -> Result<&RequestRecord, FastlyStatus> {
    self.requests.get(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn request_mut(
    &mut self,
    handle: u32,
  ) -> Result<&mut RequestRecord, FastlyStatus> {
    self.requests.get_mut(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn response(
    &self,
    handle: u32,
  ) -> Result<&ResponseRecord, FastlyStatus> {
    self.responses.get(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn response_mut(
    &mut self,
    handle: u32,
  ) -> Result<&mut ResponseRecord, FastlyStatus> {
    self.responses.get_mut(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn async_item(&self, handle: u32) -> Result<&AsyncItem, FastlyStatus> {
    self.async_items.get(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn async_item_mut(
    &mut self,
    handle: u32,
  ) -> Result<&mut AsyncItem, FastlyStatus> {
    self.async_items.get_mut(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn body(&self, handle: u32) -> Result<&Body, FastlyStatus> {
    self
      .async_item(handle)?
      .as_body()
      .ok_or(FastlyStatus::BADF)
  }

  pub fn body_mut(&mut self, handle: u32) -> Result<&mut Body, FastlyStatus> {
    self
      .async_item_mut(handle)?
      .as_body_mut()
      .ok_or(FastlyStatus::BADF)
  }

  pub fn insert_body(&mut self, body: Body) -> u32 {
    self.async_items.insert(AsyncItem::Body(body))
  }

  /// Close a body handle; the write side finishes so host-side readers
  /// of the same stream observe EOF.
  pub fn close_body(&mut self, handle: u32) -> Result<Body, FastlyStatus> {
    self.body(handle)?;
    match self.async_items.close(handle) {
      Some(AsyncItem::Body(body)) => {
        body.finish();
        Ok(body)
      }
      _ => Err(FastlyStatus::BADF),
    }
  }

  pub fn pending_req(
    &self,
    handle: u32,
  ) -> Result<&PendingRequest, FastlyStatus> {
    self
      .async_item(handle)?
      .as_pending_req()
      .ok_or(FastlyStatus::BADF)
  }

  pub fn cache_entry(
    &self,
    handle: u32,
  ) -> Result<&CacheEntryRecord, FastlyStatus> {
    self.cache_entries.get(handle).ok_or(FastlyStatus::BADF)
  }

  pub fn cache_entry_mut(
    &mut self,
    handle: u32,
  ) -> Result<&mut CacheEntryRecord, FastlyStatus> {
    self.cache_entries.get_mut(handle).ok_or(FastlyStatus::BADF)
  }

  /// Flush the downstream response. Only the first send succeeds.
  pub fn send_downstream_response(
    &mut self,
    response: ResponseRecord,
    body: Vec<u8>,
  ) -> Result<(), FastlyStatus> {
    let sender =
      self.response_sender.take().ok_or(FastlyStatus::ERROR)?;
    sender
      .send((response, body))
      .map_err(|_| FastlyStatus::ERROR)
  }

  /// Run a blocking wait with CPU accounting paused.
  pub fn with_cpu_paused<T>(&mut self, wait: impl FnOnce() -> T) -> T {
    self.cpu.pause();
    let out = wait();
    self.cpu.resume();
    out
  }
}

/// Reassemble an absolute URL for the inbound request from its parts and
/// the transport's notion of security.
fn inbound_record(parts: &http::request::Parts, secure: bool) -> RequestRecord {
  let scheme = if secure { "https" } else { "http" };
  let authority = parts
    .uri
    .authority()
    .map(|authority| authority.to_string())
    .or_else(|| {
      parts
        .headers
        .get(http::header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(str::to_string)
    })
    .unwrap_or_else(|| "localhost".to_string());
  let path_and_query = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = Url::parse(&format!("{scheme}://{authority}{path_and_query}"))
    .unwrap_or_else(|_| Url::parse("http://localhost/").unwrap());
  RequestRecord {
    method: parts.method.clone(),
    url,
    headers: parts.headers.clone(),
    ..RequestRecord::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  pub(crate) fn test_session() -> (Session, oneshot::Receiver<(ResponseRecord, Vec<u8>)>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .build()
      .unwrap();
    let handle = runtime.handle().clone();
    // Keep the runtime alive for the life of the process under test.
    std::mem::forget(runtime);
    let (tx, rx) = oneshot::channel();
    let request = http::Request::builder()
      .method(http::Method::POST)
      .uri("/path?q=1")
      .header("Host", "example.com")
      .header("X-Second", "2")
      .header("X-First", "1")
      .body(Bytes::from_static(b"ping"))
      .unwrap();
    let session = Session::new(
      Arc::new(RuntimeConfig::new()),
      handle,
      request,
      "203.0.113.7:5000".parse().unwrap(),
      "127.0.0.1:80".parse().unwrap(),
      tx,
    );
    (session, rx)
  }

  #[test]
  fn seeds_the_inbound_pair_at_handle_zero() {
    let (mut session, _rx) = test_session();
    let (req, body) = session.downstream_pair();
    assert_eq!((req, body), (0, 0));
    let record = session.request(req).unwrap();
    assert_eq!(record.method, http::Method::POST);
    assert_eq!(record.url.as_str(), "http://example.com/path?q=1");
    let body_ref = session.body_mut(body).unwrap();
    assert_eq!(body_ref.read(10).unwrap(), b"ping");

    // a second take clones the pristine inbound
    let (req2, body2) = session.downstream_pair();
    assert!(req2 > req && body2 > body);
    let clone = session.body_mut(body2).unwrap();
    assert_eq!(clone.read(10).unwrap(), b"ping");
  }

  #[test]
  fn original_header_names_preserve_received_order() {
    let (session, _rx) = test_session();
    assert_eq!(
      session.downstream.original_header_names,
      vec!["host", "x-second", "x-first"]
    );
  }

  #[test]
  fn downstream_response_can_be_sent_once() {
    let (mut session, mut rx) = test_session();
    session
      .send_downstream_response(ResponseRecord::new(), b"out".to_vec())
      .unwrap();
    let err = session
      .send_downstream_response(ResponseRecord::new(), Vec::new());
    assert_eq!(err, Err(FastlyStatus::ERROR));
    let (_, body) = rx.try_recv().unwrap();
    assert_eq!(body, b"out");
  }

  #[test]
  fn cpu_timer_pauses_during_waits() {
    let (mut session, _rx) = test_session();
    std::thread::sleep(Duration::from_millis(10));
    let before = session.cpu.total();
    session.with_cpu_paused(|| {
      std::thread::sleep(Duration::from_millis(50));
    });
    let after = session.cpu.total();
    assert!(after - before < Duration::from_millis(40));
  }

  #[test]
  fn unknown_handles_are_rejected() {
    let (mut session, _rx) = test_session();
    assert_eq!(session.request(99).unwrap_err(), FastlyStatus::BADF);
    assert_eq!(session.body_mut(99).unwrap_err(), FastlyStatus::BADF);
    assert_eq!(session.response(0).unwrap_err(), FastlyStatus::BADF);
  }
}
