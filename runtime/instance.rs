// Copyright 2018-2026 the Deno authors. MIT license.

//! Instance lifecycle.
//!
//! The engine, compiled module and populated linker are built once per
//! configured program. Each request gets a fresh store carrying its own
//! [`Session`]; the instance runs the guest's `_start` on a blocking
//! thread and is discarded when the request ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use wasmtime::Engine;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;

use crate::config::RuntimeConfig;
use crate::error::HandlerError;
use crate::session::Session;

/// Granularity of the epoch ticker driving wall-clock deadlines. Each
/// store's deadline is a per-request tick count, so concurrent requests
/// never observe one another's budgets.
const EPOCH_TICK: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct ExecuteCtx {
  engine: Engine,
  module: Module,
  linker: Arc<Linker<Session>>,
  config: Arc<RuntimeConfig>,
  /// Per-request epoch budget, in ticker intervals.
  deadline_ticks: Option<u64>,
}

impl ExecuteCtx {
  /// Compile the program and build the host-function linker.
  pub fn new(config: RuntimeConfig, wasm: &[u8]) -> anyhow::Result<Self> {
    let mut engine_config = wasmtime::Config::new();
    engine_config.epoch_interruption(config.request_deadline.is_some());
    let engine = Engine::new(&engine_config)?;
    let module = Module::new(&engine, wasm)?;
    let mut linker = Linker::new(&engine);
    crate::abi::link(&mut linker)?;

    let deadline_ticks = match config.request_deadline {
      Some(deadline) => {
        spawn_epoch_ticker(&engine);
        let ticks = deadline.as_millis().div_ceil(EPOCH_TICK.as_millis());
        Some((ticks as u64).max(1))
      }
      None => None,
    };

    Ok(Self {
      engine,
      module,
      linker: Arc::new(linker),
      config: Arc::new(config),
      deadline_ticks,
    })
  }

  pub fn config(&self) -> &Arc<RuntimeConfig> {
    &self.config
  }

  /// Run one request through a fresh guest instance.
  ///
  /// Resolves as soon as the guest sends its downstream response; the
  /// instance may keep running (e.g. to finish background work) and is
  /// torn down when `_start` returns. A guest that never sends is an
  /// error surfaced to the embedder.
  pub async fn handle_request(
    &self,
    inbound: http::Request<Bytes>,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
  ) -> Result<http::Response<Bytes>, HandlerError> {
    let (response_tx, response_rx) = oneshot::channel();
    let session = Session::new(
      self.config.clone(),
      tokio::runtime::Handle::current(),
      inbound,
      client_addr,
      server_addr,
      response_tx,
    );

    let engine = self.engine.clone();
    let module = self.module.clone();
    let linker = self.linker.clone();
    let deadline_ticks = self.deadline_ticks;
    let guest = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
      let mut store = Store::new(&engine, session);
      if let Some(ticks) = deadline_ticks {
        // Relative to the epoch at this instant: this request's budget
        // only, regardless of how many other stores are in flight.
        store.set_epoch_deadline(ticks);
      }
      let instance = linker.instantiate(&mut store, &module)?;
      let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
      start.call(&mut store, ())?;
      Ok(())
    });

    match response_rx.await {
      Ok((record, body)) => {
        let mut builder = http::Response::builder().status(record.status);
        if let Some(headers) = builder.headers_mut() {
          *headers = record.headers;
        }
        let response = builder
          .body(Bytes::from(body))
          .map_err(|err| HandlerError::GuestTrap(err.into()))?;
        Ok(response)
      }
      // The sender dropped without a response: the guest finished or
      // trapped first.
      Err(_) => match guest.await {
        Ok(Ok(())) => Err(HandlerError::NoResponse),
        Ok(Err(trap)) => Err(HandlerError::GuestTrap(trap)),
        Err(join_error) => Err(HandlerError::GuestTrap(join_error.into())),
      },
    }
  }
}

/// One ticker per engine: bump the epoch on a fixed interval and exit
/// once the engine is dropped.
fn spawn_epoch_ticker(engine: &Engine) {
  let weak = engine.weak();
  std::thread::spawn(move || loop {
    std::thread::sleep(EPOCH_TICK);
    match weak.upgrade() {
      Some(engine) => engine.increment_epoch(),
      None => break,
    }
  });
}
