// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_http_req`.

use std::net::IpAddr;

use bytes::Bytes;

use crate::abi::hostcalls;
use crate::async_io::AsyncItem;
use crate::body::Body;
use crate::error::FastlyStatus;
use crate::handles::INVALID_HANDLE;
use crate::http::CacheOverride;
use crate::http::FramingHeadersMode;
use crate::http::RequestRecord;
use crate::http::ResponseRecord;
use crate::http::HTTP_VERSION_H1;
use crate::memory::GuestMemory;
use crate::pending::dispatch;
use crate::pending::CompletedResponse;
use crate::pending::Upload;
use crate::session::Session;

/// Fold IPv4-mapped addresses down to their 4-byte form.
fn ip_octets(ip: IpAddr) -> Vec<u8> {
  match ip {
    IpAddr::V4(v4) => v4.octets().to_vec(),
    IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
      Some(v4) => v4.octets().to_vec(),
      None => v6.octets().to_vec(),
    },
  }
}

/// Start a subrequest dispatch and return the pending handle.
fn start_send(
  mem: &GuestMemory<'_>,
  sess: &mut Session,
  req_handle: u32,
  body_handle: u32,
  backend_ptr: u32,
  backend_len: u32,
  streaming: bool,
) -> Result<u32, FastlyStatus> {
  let name = mem.copy_from_guest(backend_ptr, backend_len)?;
  let name =
    String::from_utf8(name).map_err(|_| FastlyStatus::INVAL)?;
  let backend = sess
    .config
    .backends
    .get(&name)
    .cloned()
    .ok_or(FastlyStatus::INVAL)?;
  let record = sess.request(req_handle)?.clone();
  let upload = if streaming {
    // The handle stays open; the dispatcher drains the stream once the
    // guest finishes writing it.
    Upload::Streamed(sess.body(body_handle)?.stream())
  } else {
    let body = sess.close_body(body_handle)?;
    Upload::Complete(Bytes::from(body.stream().content()?))
  };
  let tag = sess.config.runtime_tag.clone();
  let handle = sess.handle.clone();
  let pending = dispatch(&handle, backend, record, upload, tag);
  Ok(sess.async_items.insert(AsyncItem::PendingReq(pending)))
}

/// Materialize a completed subrequest as a response/body handle pair.
fn finish_completed(
  mem: &mut GuestMemory<'_>,
  sess: &mut Session,
  result: Result<CompletedResponse, String>,
  resp_handle_out: u32,
  body_handle_out: u32,
) -> Result<(), FastlyStatus> {
  match result {
    Ok(completed) => {
      let response = ResponseRecord {
        status: completed.status,
        headers: completed.headers,
        ..ResponseRecord::new()
      };
      let resp_handle = sess.responses.insert(response);
      let body_handle =
        sess.insert_body(Body::received(completed.body.to_vec()));
      mem.write_u32(resp_handle_out, resp_handle)?;
      mem.write_u32(body_handle_out, body_handle)?;
      Ok(())
    }
    Err(_) => {
      mem.write_u32(resp_handle_out, INVALID_HANDLE)?;
      mem.write_u32(body_handle_out, INVALID_HANDLE)?;
      Err(FastlyStatus::ERROR)
    }
  }
}

hostcalls! {
  fn new(caller, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let handle = sess.requests.insert(RequestRecord::new());
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn body_downstream_get(caller, req_handle_out: u32, body_handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let (req_handle, body_handle) = sess.downstream_pair();
    mem.write_u32(req_handle_out, req_handle)?;
    mem.write_u32(body_handle_out, body_handle)?;
    Ok(())
  }

  fn close(caller, handle: u32) {
    let sess = caller.data_mut();
    // Idempotent within a request's lifetime.
    if sess.requests.close(handle).is_none() {
      log::debug!("closing already-closed request handle {handle}");
    }
    Ok(())
  }

  fn method_get(caller, handle: u32, buf: u32, buf_len: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let method = sess.request(handle)?.method.clone();
    crate::abi::write_buf(
      &mut mem,
      buf,
      buf_len,
      nwritten_out,
      method.as_str().as_bytes(),
    )
  }

  fn method_set(caller, handle: u32, method_ptr: u32, method_len: u32) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let method = crate::http::parse_method(mem.slice(method_ptr, method_len)?)?;
    sess.request_mut(handle)?.method = method;
    Ok(())
  }

  fn uri_get(caller, handle: u32, buf: u32, buf_len: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let uri = sess.request(handle)?.url.to_string();
    crate::abi::write_buf(&mut mem, buf, buf_len, nwritten_out, uri.as_bytes())
  }

  fn uri_set(caller, handle: u32, uri_ptr: u32, uri_len: u32) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let raw = mem.slice(uri_ptr, uri_len)?;
    let text =
      std::str::from_utf8(raw).map_err(|_| FastlyStatus::HTTPINVALID)?;
    let url = url::Url::parse(text)?;
    sess.request_mut(handle)?.url = url;
    Ok(())
  }

  fn version_get(caller, handle: u32, version_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    sess.request(handle)?;
    mem.write_u32(version_out, HTTP_VERSION_H1)?;
    Ok(())
  }

  fn version_set(caller, handle: u32, version: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.request(handle)?;
    if !crate::http::http_version_is_known(version) {
      return Err(FastlyStatus::INVAL);
    }
    if version != HTTP_VERSION_H1 {
      log::warn!("unsupported HTTP version {version} stored as HTTP/1.1");
    }
    Ok(())
  }

  fn header_names_get(
    caller,
    handle: u32,
    buf: u32,
    buf_len: u32,
    cursor: u32,
    ending_cursor_out: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &sess.request(handle)?.headers;
    crate::abi::headers::names_get(
      &mut mem,
      headers,
      buf,
      buf_len,
      cursor,
      ending_cursor_out,
      nwritten_out,
    )
  }

  fn header_value_get(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_buf: u32,
    value_max_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &sess.request(handle)?.headers;
    crate::abi::headers::value_get(
      &mut mem,
      headers,
      name_ptr,
      name_len,
      value_buf,
      value_max_len,
      nwritten_out,
    )
  }

  fn header_values_get(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    buf: u32,
    buf_len: u32,
    cursor: u32,
    ending_cursor_out: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &sess.request(handle)?.headers;
    crate::abi::headers::values_get(
      &mut mem,
      headers,
      name_ptr,
      name_len,
      buf,
      buf_len,
      cursor,
      ending_cursor_out,
      nwritten_out,
    )
  }

  fn header_values_set(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    values_ptr: u32,
    values_len: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &mut sess.request_mut(handle)?.headers;
    crate::abi::headers::values_set(
      &mem, headers, name_ptr, name_len, values_ptr, values_len,
    )
  }

  fn header_insert(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &mut sess.request_mut(handle)?.headers;
    crate::abi::headers::insert(
      &mem, headers, name_ptr, name_len, value_ptr, value_len,
    )
  }

  fn header_append(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &mut sess.request_mut(handle)?.headers;
    crate::abi::headers::append(
      &mem, headers, name_ptr, name_len, value_ptr, value_len,
    )
  }

  fn header_remove(caller, handle: u32, name_ptr: u32, name_len: u32) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &mut sess.request_mut(handle)?.headers;
    crate::abi::headers::remove(&mem, headers, name_ptr, name_len)
  }

  fn original_header_names_get(
    caller,
    buf: u32,
    buf_len: u32,
    cursor: u32,
    ending_cursor_out: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let names: Vec<Vec<u8>> = sess
      .downstream
      .original_header_names
      .iter()
      .map(|name| name.as_bytes().to_vec())
      .collect();
    crate::abi::write_cursor_page(
      &mut mem,
      &names,
      cursor,
      buf,
      buf_len,
      ending_cursor_out,
      nwritten_out,
    )
  }

  fn original_header_count(caller, count_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let count = sess.downstream.original_header_names.len() as u32;
    mem.write_u32(count_out, count)?;
    Ok(())
  }

  fn downstream_client_ip_addr(caller, octets_out: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let octets = ip_octets(sess.downstream.client_addr.ip());
    mem.write(octets_out, &octets)?;
    mem.write_u32(nwritten_out, octets.len() as u32)?;
    Ok(())
  }

  fn downstream_server_ip_addr(caller, octets_out: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let octets = ip_octets(sess.downstream.server_addr.ip());
    mem.write(octets_out, &octets)?;
    mem.write_u32(nwritten_out, octets.len() as u32)?;
    Ok(())
  }

  fn downstream_tls_cipher_openssl_name(
    caller,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let tls = sess.downstream.tls.as_ref().ok_or(FastlyStatus::NONE)?;
    let cipher = tls.cipher.clone();
    crate::abi::write_buf(&mut mem, buf, buf_len, nwritten_out, cipher.as_bytes())
  }

  fn downstream_tls_protocol(caller, buf: u32, buf_len: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let tls = sess.downstream.tls.as_ref().ok_or(FastlyStatus::NONE)?;
    let protocol = tls.protocol.clone();
    crate::abi::write_buf(
      &mut mem,
      buf,
      buf_len,
      nwritten_out,
      protocol.as_bytes(),
    )
  }

  fn downstream_tls_client_hello(caller, buf: u32, buf_len: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let tls = sess.downstream.tls.as_ref().ok_or(FastlyStatus::NONE)?;
    let hello = tls.client_hello.clone();
    crate::abi::write_buf(&mut mem, buf, buf_len, nwritten_out, &hello)
  }

  fn cache_override_set(caller, handle: u32, tag: u32, ttl: u32, swr: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.request_mut(handle)?.cache_override = CacheOverride {
      tag,
      ttl,
      stale_while_revalidate: swr,
      surrogate_key: None,
    };
    Ok(())
  }

  fn cache_override_v2_set(
    caller,
    handle: u32,
    tag: u32,
    ttl: u32,
    swr: u32,
    sk_ptr: u32,
    sk_len: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let surrogate_key = if sk_len == 0 {
      None
    } else {
      Some(mem.copy_from_guest(sk_ptr, sk_len)?)
    };
    sess.request_mut(handle)?.cache_override = CacheOverride {
      tag,
      ttl,
      stale_while_revalidate: swr,
      surrogate_key,
    };
    Ok(())
  }

  fn framing_headers_mode_set(caller, handle: u32, mode: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    let mode = FramingHeadersMode::from_u32(mode)?;
    sess.request_mut(handle)?.framing = mode;
    Ok(())
  }

  fn auto_decompress_response_set(caller, handle: u32, encodings: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    if encodings & !1 != 0 {
      return Err(FastlyStatus::INVAL);
    }
    sess.request_mut(handle)?.auto_decompress_gzip = encodings & 1 != 0;
    Ok(())
  }

  fn send(
    caller,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pending_handle = start_send(
      &mem, sess, req_handle, body_handle, backend_ptr, backend_len, false,
    )?;
    let pending = sess.pending_req(pending_handle)?.clone();
    let flag = pending.ready_flag();
    sess.with_cpu_paused(|| flag.wait_blocking());
    let result = pending.peek().ok_or(FastlyStatus::ERROR)?;
    sess.async_items.close(pending_handle);
    finish_completed(&mut mem, sess, result, resp_handle_out, body_handle_out)
  }

  fn send_async(
    caller,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pending_handle = start_send(
      &mem, sess, req_handle, body_handle, backend_ptr, backend_len, false,
    )?;
    mem.write_u32(pending_handle_out, pending_handle)?;
    Ok(())
  }

  fn send_async_streaming(
    caller,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pending_handle = start_send(
      &mem, sess, req_handle, body_handle, backend_ptr, backend_len, true,
    )?;
    mem.write_u32(pending_handle_out, pending_handle)?;
    Ok(())
  }

  fn send_async_v2(
    caller,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    streaming: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pending_handle = start_send(
      &mem,
      sess,
      req_handle,
      body_handle,
      backend_ptr,
      backend_len,
      streaming != 0,
    )?;
    mem.write_u32(pending_handle_out, pending_handle)?;
    Ok(())
  }

  fn pending_req_poll(
    caller,
    pending_handle: u32,
    is_done_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pending = sess.pending_req(pending_handle)?.clone();
    match pending.peek() {
      None => {
        mem.write_u32(is_done_out, 0)?;
        mem.write_u32(resp_handle_out, INVALID_HANDLE)?;
        mem.write_u32(body_handle_out, INVALID_HANDLE)?;
        Ok(())
      }
      Some(result) => {
        mem.write_u32(is_done_out, 1)?;
        finish_completed(
          &mut mem,
          sess,
          result,
          resp_handle_out,
          body_handle_out,
        )
      }
    }
  }

  fn pending_req_wait(
    caller,
    pending_handle: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pending = sess.pending_req(pending_handle)?.clone();
    let flag = pending.ready_flag();
    sess.with_cpu_paused(|| flag.wait_blocking());
    let result = pending.peek().ok_or(FastlyStatus::ERROR)?;
    finish_completed(&mut mem, sess, result, resp_handle_out, body_handle_out)
  }

  fn pending_req_select(
    caller,
    pending_handles_ptr: u32,
    pending_handles_len: u32,
    done_index_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if pending_handles_len == 0 {
      return Err(FastlyStatus::INVAL);
    }
    let mut pendings = Vec::with_capacity(pending_handles_len as usize);
    for index in 0..pending_handles_len {
      let handle = mem.read_u32(pending_handles_ptr + index * 4)?;
      pendings.push(sess.pending_req(handle)?.clone());
    }
    let futures = pendings
      .iter()
      .map(|pending| {
        let flag = pending.ready_flag();
        use futures::FutureExt;
        async move { flag.wait().await }.boxed()
      })
      .collect();
    let handle = sess.handle.clone();
    let winner = sess.with_cpu_paused(|| {
      crate::async_io::block_until_first(&handle, futures, 0)
    });
    let index = winner.ok_or(FastlyStatus::ERROR)?;
    let result = pendings[index as usize].peek().ok_or(FastlyStatus::ERROR)?;
    mem.write_u32(done_index_out, index)?;
    finish_completed(&mut mem, sess, result, resp_handle_out, body_handle_out)
  }

  fn upgrade_websocket(caller, _backend_ptr: u32, _backend_len: u32) {
    let _ = crate::abi::ctx(&mut caller)?;
    Err(FastlyStatus::UNSUPPORTED)
  }

  fn redirect_to_websocket_proxy(caller, _backend_ptr: u32, _backend_len: u32) {
    let _ = crate::abi::ctx(&mut caller)?;
    Err(FastlyStatus::UNSUPPORTED)
  }

  fn redirect_to_grip_proxy(caller, _backend_ptr: u32, _backend_len: u32) {
    let _ = crate::abi::ctx(&mut caller)?;
    Err(FastlyStatus::UNSUPPORTED)
  }
}
