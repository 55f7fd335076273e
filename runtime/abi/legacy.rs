// Copyright 2018-2026 the Deno authors. MIT license.

//! Legacy-only stubs: hostcalls old guests still import but that carry
//! no meaning in this runtime. They log and return a canned status.

use wasmtime::Caller;

use crate::error::FastlyStatus;
use crate::session::Session;

pub(crate) fn downstream_tls_raw_client_certificate(
  _caller: Caller<'_, Session>,
  _buf: u32,
  _buf_len: u32,
  _nwritten_out: u32,
) -> u32 {
  log::debug!("stubbed legacy hostcall: downstream_tls_raw_client_certificate");
  FastlyStatus::NONE.code
}

pub(crate) fn body_close_downstream(
  _caller: Caller<'_, Session>,
  _body_handle: u32,
) -> u32 {
  log::debug!("stubbed legacy hostcall: body_close_downstream");
  FastlyStatus::OK.code
}

pub(crate) fn resp_close_downstream(
  _caller: Caller<'_, Session>,
  _resp_handle: u32,
) -> u32 {
  log::debug!("stubbed legacy hostcall: resp_close_downstream");
  FastlyStatus::OK.code
}
