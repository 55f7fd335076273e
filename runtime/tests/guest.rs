// Copyright 2018-2026 the Deno authors. MIT license.

//! End-to-end tests driving a real wasm guest through the ABI surface.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use xqd_runtime::ExecuteCtx;
use xqd_runtime::FnBackend;
use xqd_runtime::HandlerError;
use xqd_runtime::RuntimeConfig;

const CLIENT: &str = "203.0.113.9:40000";
const SERVER: &str = "127.0.0.1:7676";

fn request(body: &'static [u8]) -> http::Request<Bytes> {
  http::Request::builder()
    .method(http::Method::GET)
    .uri("/hello?x=1")
    .header("Host", "example.com")
    .body(Bytes::from_static(body))
    .unwrap()
}

/// Initializes the ABI, makes a teapot response and streams a fixed
/// payload downstream.
const ECHO_GUEST: &str = r#"
(module
  (import "fastly_abi" "init" (func $init (param i64) (result i32)))
  (import "fastly_http_req" "body_downstream_get"
    (func $downstream (param i32 i32) (result i32)))
  (import "fastly_http_resp" "new" (func $resp_new (param i32) (result i32)))
  (import "fastly_http_resp" "status_set"
    (func $status_set (param i32 i32) (result i32)))
  (import "fastly_http_body" "new" (func $body_new (param i32) (result i32)))
  (import "fastly_http_body" "write"
    (func $body_write (param i32 i32 i32 i32 i32) (result i32)))
  (import "fastly_http_resp" "send_downstream"
    (func $send (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "hello from guest")
  (func (export "_start")
    (drop (call $init (i64.const 1)))
    (drop (call $downstream (i32.const 0) (i32.const 4)))
    (drop (call $resp_new (i32.const 8)))
    (drop (call $status_set (i32.load (i32.const 8)) (i32.const 418)))
    (drop (call $body_new (i32.const 12)))
    (drop (call $body_write
      (i32.load (i32.const 12))
      (i32.const 64) (i32.const 16)
      (i32.const 1)
      (i32.const 16)))
    (drop (call $send
      (i32.load (i32.const 8))
      (i32.load (i32.const 12))
      (i32.const 0)))))
"#;

/// Calls `fastly_abi::init` with a bogus version and stores the status
/// in the response status (400 + status) so the host can observe it.
const BAD_ABI_GUEST: &str = r#"
(module
  (import "fastly_abi" "init" (func $init (param i64) (result i32)))
  (import "fastly_http_resp" "new" (func $resp_new (param i32) (result i32)))
  (import "fastly_http_resp" "status_set"
    (func $status_set (param i32 i32) (result i32)))
  (import "fastly_http_body" "new" (func $body_new (param i32) (result i32)))
  (import "fastly_http_resp" "send_downstream"
    (func $send (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (local $status i32)
    (local.set $status (call $init (i64.const 9)))
    (drop (call $resp_new (i32.const 0)))
    (drop (call $status_set
      (i32.load (i32.const 0))
      (i32.add (i32.const 400) (local.get $status))))
    (drop (call $body_new (i32.const 4)))
    (drop (call $send
      (i32.load (i32.const 0))
      (i32.load (i32.const 4))
      (i32.const 0)))))
"#;

/// Runs to completion without ever sending a response.
const SILENT_GUEST: &str = r#"
(module
  (import "fastly_abi" "init" (func $init (param i64) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (call $init (i64.const 1)))))
"#;

/// Spins forever; only a wall-clock deadline can stop it.
const SPIN_GUEST: &str = r#"
(module
  (import "fastly_abi" "init" (func $init (param i64) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (call $init (i64.const 1)))
    (loop $spin (br $spin))))
"#;

/// Sends the downstream request to a backend and relays the subrequest
/// response status and body downstream.
const PROXY_GUEST: &str = r#"
(module
  (import "fastly_abi" "init" (func $init (param i64) (result i32)))
  (import "fastly_http_req" "body_downstream_get"
    (func $downstream (param i32 i32) (result i32)))
  (import "fastly_http_req" "send"
    (func $req_send (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "fastly_http_resp" "send_downstream"
    (func $send (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 32) "origin")
  (func (export "_start")
    (drop (call $init (i64.const 1)))
    (drop (call $downstream (i32.const 0) (i32.const 4)))
    ;; send(req, body, backend="origin", resp_out=8, body_out=12)
    (drop (call $req_send
      (i32.load (i32.const 0))
      (i32.load (i32.const 4))
      (i32.const 32) (i32.const 6)
      (i32.const 8) (i32.const 12)))
    (drop (call $send
      (i32.load (i32.const 8))
      (i32.load (i32.const 12))
      (i32.const 0)))))
"#;

#[tokio::test(flavor = "multi_thread")]
async fn guest_builds_and_sends_a_response() {
  let ctx = ExecuteCtx::new(RuntimeConfig::new(), ECHO_GUEST.as_bytes())
    .expect("guest should compile");
  let response = ctx
    .handle_request(
      request(b""),
      CLIENT.parse().unwrap(),
      SERVER.parse().unwrap(),
    )
    .await
    .expect("guest should respond");
  assert_eq!(response.status(), http::StatusCode::IM_A_TEAPOT);
  assert_eq!(response.body().as_ref(), b"hello from guest");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_abi_version_is_unsupported() {
  let ctx = ExecuteCtx::new(RuntimeConfig::new(), BAD_ABI_GUEST.as_bytes())
    .expect("guest should compile");
  let response = ctx
    .handle_request(
      request(b""),
      CLIENT.parse().unwrap(),
      SERVER.parse().unwrap(),
    )
    .await
    .expect("guest should respond");
  // 400 + UNSUPPORTED(5)
  assert_eq!(response.status().as_u16(), 405);
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_without_a_response_is_an_error() {
  let ctx = ExecuteCtx::new(RuntimeConfig::new(), SILENT_GUEST.as_bytes())
    .expect("guest should compile");
  let err = ctx
    .handle_request(
      request(b""),
      CLIENT.parse().unwrap(),
      SERVER.parse().unwrap(),
    )
    .await
    .expect_err("no response should surface as an error");
  assert!(matches!(err, HandlerError::NoResponse));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadlines_are_enforced_per_request() {
  let config = RuntimeConfig::new()
    .with_request_deadline(Duration::from_millis(200));
  let ctx = ExecuteCtx::new(config, SPIN_GUEST.as_bytes())
    .expect("guest should compile");

  let first = {
    let ctx = ctx.clone();
    tokio::spawn(async move {
      ctx
        .handle_request(
          request(b""),
          CLIENT.parse().unwrap(),
          SERVER.parse().unwrap(),
        )
        .await
    })
  };
  // Stagger the second request into the middle of the first one's
  // budget.
  tokio::time::sleep(Duration::from_millis(100)).await;
  let started = Instant::now();
  let second = ctx
    .handle_request(
      request(b""),
      CLIENT.parse().unwrap(),
      SERVER.parse().unwrap(),
    )
    .await;
  let second_elapsed = started.elapsed();

  let first = first.await.unwrap();
  assert!(matches!(first, Err(HandlerError::GuestTrap(_))));
  assert!(matches!(second, Err(HandlerError::GuestTrap(_))));
  // The second request gets its own full budget. If deadlines leaked
  // across stores it would be cut down when the first one expired,
  // roughly 100ms in.
  assert!(
    second_elapsed >= Duration::from_millis(150),
    "second request was cut short after {second_elapsed:?}"
  );
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_proxies_through_a_configured_backend() {
  let config = RuntimeConfig::new().with_backend(
    "origin",
    Arc::new(FnBackend(|req: http::Request<Bytes>| async move {
      assert_eq!(req.headers()["cdn-loop"], "xqd-local");
      assert_eq!(req.uri().path(), "/hello");
      Ok(
        http::Response::builder()
          .status(http::StatusCode::ACCEPTED)
          .body(Bytes::from_static(b"from origin"))
          .unwrap(),
      )
    })),
  );
  let ctx = ExecuteCtx::new(config, PROXY_GUEST.as_bytes())
    .expect("guest should compile");
  let response = ctx
    .handle_request(
      request(b"upload"),
      CLIENT.parse().unwrap(),
      SERVER.parse().unwrap(),
    )
    .await
    .expect("guest should respond");
  assert_eq!(response.status(), http::StatusCode::ACCEPTED);
  assert_eq!(response.body().as_ref(), b"from origin");
}
