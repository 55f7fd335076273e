// Copyright 2018-2026 the Deno authors. MIT license.

//! Pending subrequests.
//!
//! Each subrequest runs as a background task that builds a real HTTP
//! request from the guest's request record, dispatches it to the named
//! backend, and publishes exactly one completion on a broadcast flag.
//! The guest observes completion through `poll`, `wait` and `select`.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderValue;
use http::HeaderMap;
use http::StatusCode;
use parking_lot::Mutex;
use xqd_sync::ByteStream;
use xqd_sync::ReadyFlag;

use crate::config::Backend;
use crate::http::apply_framing_mode;
use crate::http::RequestRecord;

/// A completed subrequest response, cheap to clone so repeated waits can
/// observe the same result.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

#[derive(Debug)]
enum PendingState {
  Pending,
  Ready(CompletedResponse),
  Failed(String),
}

/// The guest-visible record of an in-flight subrequest.
#[derive(Clone)]
pub struct PendingRequest {
  ready: Arc<ReadyFlag>,
  state: Arc<Mutex<PendingState>>,
}

impl PendingRequest {
  pub fn new() -> Self {
    Self {
      ready: Arc::new(ReadyFlag::new()),
      state: Arc::new(Mutex::new(PendingState::Pending)),
    }
  }

  pub fn ready_flag(&self) -> Arc<ReadyFlag> {
    self.ready.clone()
  }

  pub fn is_done(&self) -> bool {
    self.ready.is_set()
  }

  /// Publish the completion. Idempotent: only the first transition
  /// sticks.
  pub fn publish(&self, result: Result<CompletedResponse, String>) {
    {
      let mut state = self.state.lock();
      if !matches!(*state, PendingState::Pending) {
        return;
      }
      *state = match result {
        Ok(response) => PendingState::Ready(response),
        Err(message) => PendingState::Failed(message),
      };
    }
    self.ready.set();
  }

  /// The completion, if any. `Some(Err(_))` is a failed dispatch.
  pub fn peek(&self) -> Option<Result<CompletedResponse, String>> {
    match &*self.state.lock() {
      PendingState::Pending => None,
      PendingState::Ready(response) => Some(Ok(response.clone())),
      PendingState::Failed(message) => Some(Err(message.clone())),
    }
  }
}

impl Default for PendingRequest {
  fn default() -> Self {
    Self::new()
  }
}

/// The upload body for a dispatch: either a snapshot taken at call time
/// (buffered sends) or a stream the dispatcher drains to completion
/// before contacting the backend (streaming sends).
pub enum Upload {
  Complete(Bytes),
  Streamed(ByteStream),
}

/// Spawn the background dispatch task for one subrequest.
pub fn dispatch(
  handle: &tokio::runtime::Handle,
  backend: Arc<dyn Backend>,
  record: RequestRecord,
  upload: Upload,
  runtime_tag: String,
) -> PendingRequest {
  let pending = PendingRequest::new();
  let publisher = pending.clone();
  handle.spawn(async move {
    let result = run_dispatch(backend, record, upload, runtime_tag).await;
    publisher.publish(result.map_err(|err| {
      log::warn!("subrequest dispatch failed: {err:#}");
      err.to_string()
    }));
  });
  pending
}

async fn run_dispatch(
  backend: Arc<dyn Backend>,
  record: RequestRecord,
  upload: Upload,
  runtime_tag: String,
) -> anyhow::Result<CompletedResponse> {
  let body = match upload {
    Upload::Complete(bytes) => bytes,
    Upload::Streamed(stream) => {
      // The guest is still writing; drain on a blocking thread.
      let drained =
        tokio::task::spawn_blocking(move || stream.read_to_end_blocking(0))
          .await??;
      Bytes::from(drained)
    }
  };

  let auto_decompress = record.auto_decompress_gzip;
  let request = build_request(record, body, &runtime_tag)?;
  let response = backend.send(request).await?;
  let (parts, mut body) = response.into_parts();
  let mut headers = parts.headers;
  if auto_decompress && is_gzip(&headers) {
    body = gunzip(&body)?;
    headers.remove(http::header::CONTENT_ENCODING);
    headers.remove(http::header::CONTENT_LENGTH);
  }
  Ok(CompletedResponse {
    status: parts.status,
    headers,
    body,
  })
}

fn build_request(
  record: RequestRecord,
  body: Bytes,
  runtime_tag: &str,
) -> anyhow::Result<http::Request<Bytes>> {
  let RequestRecord {
    method,
    url,
    mut headers,
    framing,
    ..
  } = record;
  apply_framing_mode(&mut headers, framing);
  // Loop detection tag, appended so an upstream hop can spot us.
  headers.append(
    http::header::HeaderName::from_static("cdn-loop"),
    HeaderValue::from_str(runtime_tag)?,
  );
  if !headers.contains_key(http::header::CONTENT_LENGTH) {
    headers.insert(
      http::header::CONTENT_LENGTH,
      HeaderValue::from_str(&body.len().to_string())?,
    );
  }
  let mut request = http::Request::builder()
    .method(method)
    .uri(url.as_str())
    .body(body)?;
  *request.headers_mut() = headers;
  Ok(request)
}

fn is_gzip(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::CONTENT_ENCODING)
    .map(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"))
    .unwrap_or(false)
}

fn gunzip(body: &Bytes) -> anyhow::Result<Bytes> {
  let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use crate::config::FnBackend;

  use super::*;

  fn record_for(url: &str) -> RequestRecord {
    let mut record = RequestRecord::new();
    record.url = url::Url::parse(url).unwrap();
    record
  }

  #[test]
  fn publish_is_idempotent() {
    let pending = PendingRequest::new();
    assert!(pending.peek().is_none());
    pending.publish(Err("boom".to_string()));
    pending.publish(Ok(CompletedResponse {
      status: StatusCode::OK,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }));
    assert!(matches!(pending.peek(), Some(Err(message)) if message == "boom"));
    assert!(pending.is_done());
  }

  #[test]
  fn requests_carry_the_loop_tag_and_content_length() {
    let request = build_request(
      record_for("http://origin.test/path"),
      Bytes::from_static(b"hello"),
      "xqd-local",
    )
    .unwrap();
    assert_eq!(request.headers()["cdn-loop"], "xqd-local");
    assert_eq!(request.headers()["content-length"], "5");
    assert_eq!(request.uri(), "http://origin.test/path");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn dispatch_publishes_the_backend_response() {
    let backend = Arc::new(FnBackend(|req: http::Request<Bytes>| async move {
      assert_eq!(req.headers()["cdn-loop"], "test-tag");
      Ok(
        http::Response::builder()
          .status(StatusCode::CREATED)
          .body(Bytes::from_static(b"made"))
          .unwrap(),
      )
    }));
    let pending = dispatch(
      &tokio::runtime::Handle::current(),
      backend,
      record_for("http://origin.test/"),
      Upload::Complete(Bytes::new()),
      "test-tag".to_string(),
    );
    pending.ready_flag().wait().await;
    let response = pending.peek().unwrap().unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body, Bytes::from_static(b"made"));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn streamed_uploads_wait_for_the_writer() {
    let backend = Arc::new(FnBackend(|req: http::Request<Bytes>| async move {
      Ok(http::Response::new(req.into_body()))
    }));
    let stream = ByteStream::new();
    let pending = dispatch(
      &tokio::runtime::Handle::current(),
      backend,
      record_for("http://origin.test/"),
      Upload::Streamed(stream.clone()),
      "t".to_string(),
    );
    assert!(!pending.is_done());
    stream.write(b"late ").unwrap();
    stream.write(b"bytes").unwrap();
    stream.finish();
    pending.ready_flag().wait().await;
    let response = pending.peek().unwrap().unwrap();
    assert_eq!(response.body, Bytes::from_static(b"late bytes"));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn gzip_responses_are_decompressed_on_request() {
    let backend = Arc::new(FnBackend(|_req| async move {
      let mut encoder = flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
      );
      encoder.write_all(b"clear text").unwrap();
      let compressed = encoder.finish().unwrap();
      Ok(
        http::Response::builder()
          .header(http::header::CONTENT_ENCODING, "gzip")
          .body(Bytes::from(compressed))
          .unwrap(),
      )
    }));
    let mut record = record_for("http://origin.test/");
    record.auto_decompress_gzip = true;
    let pending = dispatch(
      &tokio::runtime::Handle::current(),
      backend,
      record,
      Upload::Complete(Bytes::new()),
      "t".to_string(),
    );
    pending.ready_flag().wait().await;
    let response = pending.peek().unwrap().unwrap();
    assert_eq!(response.body, Bytes::from_static(b"clear text"));
    assert!(!response.headers.contains_key(http::header::CONTENT_ENCODING));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn backend_errors_publish_a_failure() {
    let backend = Arc::new(FnBackend(|_req| async move {
      anyhow::bail!("connection refused")
    }));
    let pending = dispatch(
      &tokio::runtime::Handle::current(),
      backend,
      record_for("http://origin.test/"),
      Upload::Complete(Bytes::new()),
      "t".to_string(),
    );
    pending.ready_flag().wait().await;
    assert!(matches!(pending.peek(), Some(Err(_))));
  }
}
