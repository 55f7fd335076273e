// Copyright 2018-2026 the Deno authors. MIT license.

//! The hostcall surface.
//!
//! Every exported function reads its arguments out of guest linear
//! memory, validates handles, delegates to the owning component, writes
//! results back, and returns a numeric status. Panics are contained per
//! call and surfaced as `ERROR`.
//!
//! Each function is registered twice: under its modern module name
//! (`fastly_http_req`, `fastly_cache`, ...) and under the legacy flat
//! `env` module with an `xqd_`-prefixed name (`abi_init` additionally as
//! `fastly::init`).

use wasmtime::Caller;
use wasmtime::Linker;

use crate::error::FastlyStatus;
use crate::memory::GuestMemory;
use crate::session::Session;

/// Wrap a hostcall body with panic containment and status mapping.
macro_rules! hostcalls {
  ($( fn $name:ident($caller:ident $(, $arg:ident : $ty:ty)* $(,)?) $body:block )*) => {
    $(
      pub(crate) fn $name(
        #[allow(unused_mut)] mut $caller: wasmtime::Caller<'_, crate::session::Session>,
        $($arg: $ty,)*
      ) -> u32 {
        let result = std::panic::catch_unwind(
          std::panic::AssertUnwindSafe(
            || -> Result<(), crate::error::FastlyStatus> { $body }
          ),
        );
        crate::abi::finish(stringify!($name), result)
      }
    )*
  };
}

pub(crate) use hostcalls;

pub(crate) mod acl;
pub(crate) mod backend;
pub(crate) mod body;
pub(crate) mod cache;
pub(crate) mod downstream;
pub(crate) mod erl;
pub(crate) mod headers;
pub(crate) mod http_cache;
pub(crate) mod kv;
pub(crate) mod legacy;
pub(crate) mod log_endpoint;
pub(crate) mod lookup;
pub(crate) mod purge;
pub(crate) mod req;
pub(crate) mod resp;
pub(crate) mod runtime;

pub(crate) fn finish(
  name: &str,
  result: std::thread::Result<Result<(), FastlyStatus>>,
) -> u32 {
  match result {
    Ok(Ok(())) => FastlyStatus::OK.code,
    Ok(Err(status)) => {
      log::debug!("hostcall {name} returned {status:?}");
      status.code
    }
    Err(panic) => {
      let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_string());
      log::error!("hostcall {name} panicked: {message}");
      FastlyStatus::ERROR.code
    }
  }
}

/// The guest's exported linear memory plus the per-request session, both
/// borrowed for the duration of one hostcall.
pub(crate) fn ctx<'a>(
  caller: &'a mut Caller<'_, Session>,
) -> Result<(GuestMemory<'a>, &'a mut Session), FastlyStatus> {
  let memory = match caller.get_export("memory") {
    Some(wasmtime::Extern::Memory(memory)) => memory,
    _ => return Err(FastlyStatus::ERROR),
  };
  let (data, session) = memory.data_and_store_mut(caller);
  Ok((GuestMemory::new(data), session))
}

/// Write `payload` under the buffer-length discipline: a too-small
/// buffer gets the required size in `nwritten` and `BUFLEN`, never a
/// partial payload.
pub(crate) fn write_buf(
  mem: &mut GuestMemory<'_>,
  buf: u32,
  buf_len: u32,
  nwritten_out: u32,
  payload: &[u8],
) -> Result<(), FastlyStatus> {
  if payload.len() > buf_len as usize {
    mem.write_u32(nwritten_out, payload.len() as u32)?;
    return Err(FastlyStatus::BUFLEN);
  }
  mem.write(buf, payload)?;
  mem.write_u32(nwritten_out, payload.len() as u32)?;
  Ok(())
}

/// Write one page of a cursor enumeration (NUL-terminated entries).
pub(crate) fn write_cursor_page(
  mem: &mut GuestMemory<'_>,
  entries: &[Vec<u8>],
  cursor: u32,
  buf: u32,
  buf_len: u32,
  ending_cursor_out: u32,
  nwritten_out: u32,
) -> Result<(), FastlyStatus> {
  match crate::http::paginate(entries, cursor, buf_len as usize) {
    Ok(page) => {
      mem.write(buf, &page.payload)?;
      mem.write_u32(nwritten_out, page.payload.len() as u32)?;
      mem.write_u32(ending_cursor_out, page.next)?;
      Ok(())
    }
    Err(needed) => {
      mem.write_u32(nwritten_out, needed as u32)?;
      Err(FastlyStatus::BUFLEN)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_buf_never_writes_partial_payloads() {
    let mut backing = vec![0u8; 64];
    let mut mem = GuestMemory::new(&mut backing);
    // 32-byte payload into a 16-byte buffer: BUFLEN, required size in
    // nwritten, target buffer untouched.
    let payload = [0xAB_u8; 32];
    let err = write_buf(&mut mem, 0, 16, 40, &payload).unwrap_err();
    assert_eq!(err, FastlyStatus::BUFLEN);
    assert_eq!(mem.read_u32(40).unwrap(), 32);
    assert_eq!(mem.slice(0, 16).unwrap(), &[0u8; 16]);

    write_buf(&mut mem, 0, 32, 40, &payload).unwrap();
    assert_eq!(mem.read_u32(40).unwrap(), 32);
    assert_eq!(mem.slice(0, 32).unwrap(), &payload[..]);
  }

  #[test]
  fn cursor_pages_terminate_with_the_sentinel() {
    let mut backing = vec![0u8; 64];
    let mut mem = GuestMemory::new(&mut backing);
    let entries = vec![b"aa".to_vec(), b"bb".to_vec()];
    write_cursor_page(&mut mem, &entries, 0, 0, 32, 40, 44).unwrap();
    assert_eq!(mem.slice(0, 6).unwrap(), b"aa\0bb\0");
    assert_eq!(mem.read_u32(44).unwrap(), 6);
    assert_eq!(mem.read_u32(40).unwrap(), crate::http::CURSOR_END);
  }
}

macro_rules! reg {
  ($linker:ident, $module:literal, { $( $name:literal => $f:path as $legacy:literal, )* }) => {
    $(
      $linker.func_wrap($module, $name, $f)?;
      $linker.func_wrap("env", $legacy, $f)?;
    )*
  };
}

/// Register the whole surface on a linker.
pub fn link(linker: &mut Linker<Session>) -> anyhow::Result<()> {
  reg!(linker, "fastly_abi", {
    "init" => runtime::abi_init as "xqd_init",
  });
  linker.func_wrap("fastly", "init", runtime::abi_init)?;

  reg!(linker, "fastly_uap", {
    "parse" => runtime::uap_parse as "xqd_uap_parse",
  });

  reg!(linker, "fastly_http_body", {
    "new" => body::new as "xqd_body_new",
    "append" => body::append as "xqd_body_append",
    "read" => body::read as "xqd_body_read",
    "write" => body::write as "xqd_body_write",
    "abandon" => body::abandon as "xqd_body_abandon",
    "close" => body::close as "xqd_body_close",
    "known_length" => body::known_length as "xqd_body_known_length",
    "trailer_append" => body::trailer_append as "xqd_body_trailer_append",
    "trailer_names_get" => body::trailer_names_get as "xqd_body_trailer_names_get",
    "trailer_value_get" => body::trailer_value_get as "xqd_body_trailer_value_get",
    "trailer_values_get" => body::trailer_values_get as "xqd_body_trailer_values_get",
  });

  reg!(linker, "fastly_http_req", {
    "new" => req::new as "xqd_req_new",
    "body_downstream_get" => req::body_downstream_get as "xqd_req_body_downstream_get",
    "close" => req::close as "xqd_req_close",
    "method_get" => req::method_get as "xqd_req_method_get",
    "method_set" => req::method_set as "xqd_req_method_set",
    "uri_get" => req::uri_get as "xqd_req_uri_get",
    "uri_set" => req::uri_set as "xqd_req_uri_set",
    "version_get" => req::version_get as "xqd_req_version_get",
    "version_set" => req::version_set as "xqd_req_version_set",
    "header_names_get" => req::header_names_get as "xqd_req_header_names_get",
    "header_value_get" => req::header_value_get as "xqd_req_header_value_get",
    "header_values_get" => req::header_values_get as "xqd_req_header_values_get",
    "header_values_set" => req::header_values_set as "xqd_req_header_values_set",
    "header_insert" => req::header_insert as "xqd_req_header_insert",
    "header_append" => req::header_append as "xqd_req_header_append",
    "header_remove" => req::header_remove as "xqd_req_header_remove",
    "original_header_names_get" => req::original_header_names_get as "xqd_req_original_header_names_get",
    "original_header_count" => req::original_header_count as "xqd_req_original_header_count",
    "downstream_client_ip_addr" => req::downstream_client_ip_addr as "xqd_req_downstream_client_ip_addr",
    "downstream_server_ip_addr" => req::downstream_server_ip_addr as "xqd_req_downstream_server_ip_addr",
    "downstream_tls_cipher_openssl_name" => req::downstream_tls_cipher_openssl_name as "xqd_req_downstream_tls_cipher_openssl_name",
    "downstream_tls_protocol" => req::downstream_tls_protocol as "xqd_req_downstream_tls_protocol",
    "downstream_tls_client_hello" => req::downstream_tls_client_hello as "xqd_req_downstream_tls_client_hello",
    "cache_override_set" => req::cache_override_set as "xqd_req_cache_override_set",
    "cache_override_v2_set" => req::cache_override_v2_set as "xqd_req_cache_override_v2_set",
    "framing_headers_mode_set" => req::framing_headers_mode_set as "xqd_req_framing_headers_mode_set",
    "auto_decompress_response_set" => req::auto_decompress_response_set as "xqd_req_auto_decompress_response_set",
    "send" => req::send as "xqd_req_send",
    "send_async" => req::send_async as "xqd_req_send_async",
    "send_async_streaming" => req::send_async_streaming as "xqd_req_send_async_streaming",
    "send_async_v2" => req::send_async_v2 as "xqd_req_send_async_v2",
    "pending_req_poll" => req::pending_req_poll as "xqd_req_pending_req_poll",
    "pending_req_wait" => req::pending_req_wait as "xqd_req_pending_req_wait",
    "pending_req_select" => req::pending_req_select as "xqd_req_pending_req_select",
    "upgrade_websocket" => req::upgrade_websocket as "xqd_req_upgrade_websocket",
    "redirect_to_websocket_proxy" => req::redirect_to_websocket_proxy as "xqd_req_redirect_to_websocket_proxy",
    "redirect_to_grip_proxy" => req::redirect_to_grip_proxy as "xqd_req_redirect_to_grip_proxy",
  });

  reg!(linker, "fastly_http_resp", {
    "new" => resp::new as "xqd_resp_new",
    "close" => resp::close as "xqd_resp_close",
    "status_get" => resp::status_get as "xqd_resp_status_get",
    "status_set" => resp::status_set as "xqd_resp_status_set",
    "version_get" => resp::version_get as "xqd_resp_version_get",
    "version_set" => resp::version_set as "xqd_resp_version_set",
    "header_names_get" => resp::header_names_get as "xqd_resp_header_names_get",
    "header_value_get" => resp::header_value_get as "xqd_resp_header_value_get",
    "header_values_get" => resp::header_values_get as "xqd_resp_header_values_get",
    "header_values_set" => resp::header_values_set as "xqd_resp_header_values_set",
    "header_insert" => resp::header_insert as "xqd_resp_header_insert",
    "header_append" => resp::header_append as "xqd_resp_header_append",
    "header_remove" => resp::header_remove as "xqd_resp_header_remove",
    "framing_headers_mode_set" => resp::framing_headers_mode_set as "xqd_resp_framing_headers_mode_set",
    "http_keepalive_mode_set" => resp::http_keepalive_mode_set as "xqd_resp_http_keepalive_mode_set",
    "send_downstream" => resp::send_downstream as "xqd_resp_send_downstream",
  });

  reg!(linker, "fastly_cache", {
    "lookup" => cache::lookup as "xqd_cache_lookup",
    "insert" => cache::insert as "xqd_cache_insert",
    "transaction_lookup" => cache::transaction_lookup as "xqd_cache_transaction_lookup",
    "transaction_lookup_async" => cache::transaction_lookup_async as "xqd_cache_transaction_lookup_async",
    "cache_busy_handle_wait" => cache::cache_busy_handle_wait as "xqd_cache_cache_busy_handle_wait",
    "transaction_insert" => cache::transaction_insert as "xqd_cache_transaction_insert",
    "transaction_insert_and_stream_back" => cache::transaction_insert_and_stream_back as "xqd_cache_transaction_insert_and_stream_back",
    "transaction_update" => cache::transaction_update as "xqd_cache_transaction_update",
    "transaction_cancel" => cache::transaction_cancel as "xqd_cache_transaction_cancel",
    "close_busy" => cache::close_busy as "xqd_cache_close_busy",
    "close" => cache::close as "xqd_cache_close",
    "get_state" => cache::get_state as "xqd_cache_get_state",
    "get_user_metadata" => cache::get_user_metadata as "xqd_cache_get_user_metadata",
    "get_body" => cache::get_body as "xqd_cache_get_body",
    "get_length" => cache::get_length as "xqd_cache_get_length",
    "get_max_age_ns" => cache::get_max_age_ns as "xqd_cache_get_max_age_ns",
    "get_stale_while_revalidate_ns" => cache::get_stale_while_revalidate_ns as "xqd_cache_get_stale_while_revalidate_ns",
    "get_age_ns" => cache::get_age_ns as "xqd_cache_get_age_ns",
    "get_hits" => cache::get_hits as "xqd_cache_get_hits",
  });

  reg!(linker, "fastly_http_cache", {
    "is_request_cacheable" => http_cache::is_request_cacheable as "xqd_http_cache_is_request_cacheable",
    "get_suggested_cache_key" => http_cache::get_suggested_cache_key as "xqd_http_cache_get_suggested_cache_key",
    "get_suggested_backend_request" => http_cache::get_suggested_backend_request as "xqd_http_cache_get_suggested_backend_request",
    "get_suggested_cache_options" => http_cache::get_suggested_cache_options as "xqd_http_cache_get_suggested_cache_options",
  });

  reg!(linker, "fastly_kv_store", {
    "open" => kv::open as "xqd_kv_store_open",
    "lookup" => kv::lookup as "xqd_kv_store_lookup",
    "lookup_wait" => kv::lookup_wait as "xqd_kv_store_lookup_wait",
    "insert" => kv::insert as "xqd_kv_store_insert",
    "insert_wait" => kv::insert_wait as "xqd_kv_store_insert_wait",
    "delete" => kv::delete as "xqd_kv_store_delete",
    "delete_wait" => kv::delete_wait as "xqd_kv_store_delete_wait",
    "list" => kv::list as "xqd_kv_store_list",
    "list_wait" => kv::list_wait as "xqd_kv_store_list_wait",
  });

  reg!(linker, "fastly_acl", {
    "open" => acl::open as "xqd_acl_open",
    "lookup" => acl::lookup as "xqd_acl_lookup",
  });

  reg!(linker, "fastly_erl", {
    "check_rate" => erl::check_rate as "xqd_erl_check_rate",
    "ratecounter_increment" => erl::ratecounter_increment as "xqd_erl_ratecounter_increment",
    "ratecounter_lookup_rate" => erl::ratecounter_lookup_rate as "xqd_erl_ratecounter_lookup_rate",
    "ratecounter_lookup_count" => erl::ratecounter_lookup_count as "xqd_erl_ratecounter_lookup_count",
    "penaltybox_add" => erl::penaltybox_add as "xqd_erl_penaltybox_add",
    "penaltybox_has" => erl::penaltybox_has as "xqd_erl_penaltybox_has",
  });

  reg!(linker, "fastly_purge", {
    "purge_surrogate_key" => purge::purge_surrogate_key as "xqd_purge_surrogate_key",
  });

  reg!(linker, "fastly_log", {
    "endpoint_get" => log_endpoint::endpoint_get as "xqd_log_endpoint_get",
    "write" => log_endpoint::write as "xqd_log_write",
  });

  reg!(linker, "fastly_dictionary", {
    "open" => lookup::dictionary_open as "xqd_dictionary_open",
    "get" => lookup::dictionary_get as "xqd_dictionary_get",
  });

  reg!(linker, "fastly_config_store", {
    "open" => lookup::config_store_open as "xqd_config_store_open",
    "get" => lookup::config_store_get as "xqd_config_store_get",
  });

  reg!(linker, "fastly_secret_store", {
    "open" => lookup::secret_store_open as "xqd_secret_store_open",
    "get" => lookup::secret_store_get as "xqd_secret_store_get",
    "plaintext" => lookup::secret_plaintext as "xqd_secret_store_plaintext",
  });

  reg!(linker, "fastly_device_detection", {
    "lookup" => lookup::device_detection_lookup as "xqd_device_detection_lookup",
  });

  reg!(linker, "fastly_image_optimizer", {
    "transform_image_optimizer_request" => lookup::transform_image_optimizer_request as "xqd_image_optimizer_transform_image_optimizer_request",
  });

  reg!(linker, "fastly_geo", {
    "ip_lookup" => lookup::geo_ip_lookup as "xqd_geo_ip_lookup",
  });

  reg!(linker, "fastly_backend", {
    "exists" => backend::exists as "xqd_backend_exists",
    "is_healthy" => backend::is_healthy as "xqd_backend_is_healthy",
    "is_dynamic" => backend::is_dynamic as "xqd_backend_is_dynamic",
  });

  reg!(linker, "fastly_compute_runtime", {
    "get_vcpu_ms" => runtime::get_vcpu_ms as "xqd_compute_runtime_get_vcpu_ms",
  });

  reg!(linker, "fastly_async_io", {
    "select" => runtime::async_select as "xqd_async_io_select",
    "is_ready" => runtime::async_is_ready as "xqd_async_io_is_ready",
  });

  reg!(linker, "fastly_http_downstream", {
    "next_request" => downstream::next_request as "xqd_http_downstream_next_request",
    "next_request_wait" => downstream::next_request_wait as "xqd_http_downstream_next_request_wait",
    "next_request_abandon" => downstream::next_request_abandon as "xqd_http_downstream_next_request_abandon",
  });

  // Legacy-only stubs with no modern counterpart.
  linker.func_wrap(
    "env",
    "xqd_req_downstream_tls_raw_client_certificate",
    legacy::downstream_tls_raw_client_certificate,
  )?;
  linker.func_wrap(
    "env",
    "xqd_body_close_downstream",
    legacy::body_close_downstream,
  )?;
  linker.func_wrap(
    "env",
    "xqd_resp_close_downstream",
    legacy::resp_close_downstream,
  )?;

  Ok(())
}
