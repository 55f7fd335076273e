// Copyright 2018-2026 the Deno authors. MIT license.

//! The downstream HTTP server: accept loop, per-connection serving, and
//! the bridge from transport requests to guest instances.

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::instance::ExecuteCtx;

/// Accept connections on `addr` and run each request through a fresh
/// guest instance.
pub async fn serve(ctx: ExecuteCtx, addr: SocketAddr) -> anyhow::Result<()> {
  let listener = TcpListener::bind(addr).await?;
  let local_addr = listener.local_addr()?;
  log::info!("listening on http://{local_addr}");
  loop {
    let (stream, client_addr) = listener.accept().await?;
    let server_addr = stream.local_addr().unwrap_or(local_addr);
    let io = TokioIo::new(stream);
    let ctx = ctx.clone();
    tokio::spawn(async move {
      let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { handle(ctx, req, client_addr, server_addr).await }
      });
      let result =
        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
          .serve_connection(io, service)
          .await;
      if let Err(err) = result {
        log::debug!("connection from {client_addr} ended: {err:?}");
      }
    });
  }
}

async fn handle(
  ctx: ExecuteCtx,
  req: http::Request<hyper::body::Incoming>,
  client_addr: SocketAddr,
  server_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, std::convert::Infallible> {
  let (parts, body) = req.into_parts();
  let body = match body.collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(err) => {
      log::warn!("failed to read downstream request body: {err}");
      return Ok(plain_status(http::StatusCode::BAD_REQUEST));
    }
  };
  let inbound = http::Request::from_parts(parts, body);
  match ctx.handle_request(inbound, client_addr, server_addr).await {
    Ok(response) => Ok(response.map(Full::new)),
    Err(err) => {
      log::error!("request failed: {err}");
      Ok(plain_status(http::StatusCode::INTERNAL_SERVER_ERROR))
    }
  }
}

fn plain_status(status: http::StatusCode) -> http::Response<Full<Bytes>> {
  http::Response::builder()
    .status(status)
    .body(Full::new(Bytes::new()))
    .unwrap()
}
