// Copyright 2018-2026 the Deno authors. MIT license.

//! Embedder configuration.
//!
//! Everything the guest can reach by name (backends, dictionaries,
//! config stores, secret stores, ACLs, KV stores, log endpoints and the
//! pluggable lookup functions) is injected here once at program load
//! and shared read-only across requests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use xqd_acl::Acl;
use xqd_cache::Cache;
use xqd_erl::PenaltyBox;
use xqd_erl::RateCounter;
use xqd_kv::KvStore;

use crate::http::RequestRecord;
use crate::uap::UserAgent;

pub type DictionaryFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type SecretFn = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;
pub type DeviceDetectionFn =
  Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type GeolocationFn = Arc<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;
pub type UapFn = Arc<dyn Fn(&str) -> UserAgent + Send + Sync>;
pub type ImageOptimizerFn = Arc<
  dyn Fn(&RequestRecord, Bytes) -> anyhow::Result<http::Response<Bytes>>
    + Send
    + Sync,
>;
pub type LogSinkFn = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
pub type SecureFn = Arc<dyn Fn(&http::request::Parts) -> bool + Send + Sync>;

/// TLS metadata surfaced for connections the secure predicate accepts.
#[derive(Debug, Clone)]
pub struct TlsInfo {
  pub cipher: String,
  pub protocol: String,
  pub client_hello: Vec<u8>,
}

impl Default for TlsInfo {
  fn default() -> Self {
    Self {
      cipher: "TLS_AES_128_GCM_SHA256".to_string(),
      protocol: "TLSv1.3".to_string(),
      client_hello: Vec::new(),
    }
  }
}

/// A named origin the guest can send subrequests to.
pub trait Backend: Send + Sync {
  fn send(
    &self,
    req: http::Request<Bytes>,
  ) -> BoxFuture<'static, anyhow::Result<http::Response<Bytes>>>;
}

/// A backend backed by a plain async function; the form tests and most
/// embedders use.
pub struct FnBackend<F>(pub F);

impl<F, Fut> Backend for FnBackend<F>
where
  F: Fn(http::Request<Bytes>) -> Fut + Send + Sync,
  Fut: std::future::Future<Output = anyhow::Result<http::Response<Bytes>>>
    + Send
    + 'static,
{
  fn send(
    &self,
    req: http::Request<Bytes>,
  ) -> BoxFuture<'static, anyhow::Result<http::Response<Bytes>>> {
    (self.0)(req).boxed()
  }
}

/// A backend that proxies to a base URI over plain HTTP.
pub struct UriBackend {
  base: http::Uri,
  client: Client<HttpConnector, Full<Bytes>>,
}

impl UriBackend {
  pub fn new(base: http::Uri) -> Self {
    Self {
      base,
      client: Client::builder(TokioExecutor::new()).build_http(),
    }
  }
}

impl Backend for UriBackend {
  fn send(
    &self,
    req: http::Request<Bytes>,
  ) -> BoxFuture<'static, anyhow::Result<http::Response<Bytes>>> {
    let client = self.client.clone();
    let base = self.base.clone();
    async move {
      let (mut parts, body) = req.into_parts();
      let mut uri = http::Uri::builder();
      if let Some(scheme) = base.scheme() {
        uri = uri.scheme(scheme.clone());
      }
      if let Some(authority) = base.authority() {
        uri = uri.authority(authority.clone());
      }
      if let Some(path_and_query) = parts.uri.path_and_query() {
        uri = uri.path_and_query(path_and_query.clone());
      }
      parts.uri = uri.build()?;
      let request = http::Request::from_parts(parts, Full::new(body));
      let response = client.request(request).await?;
      let (parts, body) = response.into_parts();
      let collected = body.collect().await?.to_bytes();
      Ok(http::Response::from_parts(parts, collected))
    }
    .boxed()
  }
}

/// Named rate counters and penalty boxes, created on first use and
/// shared across requests.
#[derive(Default)]
pub struct ErlRegistry {
  rate_counters: Mutex<HashMap<String, Arc<RateCounter>>>,
  penalty_boxes: Mutex<HashMap<String, Arc<PenaltyBox>>>,
}

impl ErlRegistry {
  pub fn rate_counter(&self, name: &str) -> Arc<RateCounter> {
    self
      .rate_counters
      .lock()
      .entry(name.to_string())
      .or_default()
      .clone()
  }

  pub fn penalty_box(&self, name: &str) -> Arc<PenaltyBox> {
    self
      .penalty_boxes
      .lock()
      .entry(name.to_string())
      .or_default()
      .clone()
  }
}

pub struct RuntimeConfig {
  pub(crate) backends: HashMap<String, Arc<dyn Backend>>,
  pub(crate) dictionaries: HashMap<String, DictionaryFn>,
  pub(crate) config_stores: HashMap<String, DictionaryFn>,
  pub(crate) secret_stores: HashMap<String, SecretFn>,
  pub(crate) acls: HashMap<String, Arc<Acl>>,
  pub(crate) kv_stores: HashMap<String, KvStore>,
  pub(crate) log_sinks: HashMap<String, LogSinkFn>,
  pub(crate) geolocation: Option<GeolocationFn>,
  pub(crate) device_detection: Option<DeviceDetectionFn>,
  pub(crate) image_optimizer: Option<ImageOptimizerFn>,
  pub(crate) uap: Option<UapFn>,
  pub(crate) secure: SecureFn,
  pub(crate) tls_info: TlsInfo,
  pub(crate) erl: ErlRegistry,
  pub(crate) cache: Arc<Cache>,
  pub(crate) request_deadline: Option<Duration>,
  /// Tag appended as `cdn-loop` to every subrequest.
  pub(crate) runtime_tag: String,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self::new()
  }
}

impl RuntimeConfig {
  pub fn new() -> Self {
    Self {
      backends: HashMap::new(),
      dictionaries: HashMap::new(),
      config_stores: HashMap::new(),
      secret_stores: HashMap::new(),
      acls: HashMap::new(),
      kv_stores: HashMap::new(),
      log_sinks: HashMap::new(),
      geolocation: None,
      device_detection: None,
      image_optimizer: None,
      uap: None,
      secure: Arc::new(|_| false),
      tls_info: TlsInfo::default(),
      erl: ErlRegistry::default(),
      cache: Arc::new(Cache::new()),
      request_deadline: None,
      runtime_tag: "xqd-local".to_string(),
    }
  }

  pub fn with_backend(
    mut self,
    name: impl Into<String>,
    backend: Arc<dyn Backend>,
  ) -> Self {
    self.backends.insert(name.into(), backend);
    self
  }

  pub fn with_dictionary(
    mut self,
    name: impl Into<String>,
    lookup: DictionaryFn,
  ) -> Self {
    self.dictionaries.insert(name.into(), lookup);
    self
  }

  pub fn with_config_store(
    mut self,
    name: impl Into<String>,
    lookup: DictionaryFn,
  ) -> Self {
    self.config_stores.insert(name.into(), lookup);
    self
  }

  pub fn with_secret_store(
    mut self,
    name: impl Into<String>,
    lookup: SecretFn,
  ) -> Self {
    self.secret_stores.insert(name.into(), lookup);
    self
  }

  pub fn with_acl(mut self, name: impl Into<String>, acl: Acl) -> Self {
    self.acls.insert(name.into(), Arc::new(acl));
    self
  }

  pub fn with_kv_store(mut self, name: impl Into<String>) -> Self {
    self.kv_stores.insert(name.into(), KvStore::new());
    self
  }

  pub fn with_log_sink(
    mut self,
    name: impl Into<String>,
    sink: LogSinkFn,
  ) -> Self {
    self.log_sinks.insert(name.into(), sink);
    self
  }

  pub fn with_geolocation(mut self, lookup: GeolocationFn) -> Self {
    self.geolocation = Some(lookup);
    self
  }

  pub fn with_device_detection(mut self, lookup: DeviceDetectionFn) -> Self {
    self.device_detection = Some(lookup);
    self
  }

  pub fn with_image_optimizer(mut self, transform: ImageOptimizerFn) -> Self {
    self.image_optimizer = Some(transform);
    self
  }

  pub fn with_uap(mut self, parser: UapFn) -> Self {
    self.uap = Some(parser);
    self
  }

  pub fn with_secure(mut self, secure: SecureFn) -> Self {
    self.secure = secure;
    self
  }

  pub fn with_tls_info(mut self, tls_info: TlsInfo) -> Self {
    self.tls_info = tls_info;
    self
  }

  pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
    self.request_deadline = Some(deadline);
    self
  }

  pub fn cache(&self) -> &Arc<Cache> {
    &self.cache
  }
}
