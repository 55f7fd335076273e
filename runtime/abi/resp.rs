// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_http_resp`.

use crate::abi::hostcalls;
use crate::body::BodyKind;
use crate::error::FastlyStatus;
use crate::http::apply_framing_mode;
use crate::http::FramingHeadersMode;
use crate::http::KeepaliveMode;
use crate::http::ResponseRecord;
use crate::http::HTTP_VERSION_H1;

hostcalls! {
  fn new(caller, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let handle = sess.responses.insert(ResponseRecord::new());
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn close(caller, handle: u32) {
    let sess = caller.data_mut();
    if sess.responses.close(handle).is_none() {
      log::debug!("closing already-closed response handle {handle}");
    }
    Ok(())
  }

  fn status_get(caller, handle: u32, status_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let status = sess.response(handle)?.status.as_u16();
    mem.write_u32(status_out, u32::from(status))?;
    Ok(())
  }

  fn status_set(caller, handle: u32, status: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    let status = u16::try_from(status)
      .map_err(|_| FastlyStatus::HTTPINVALID)
      .and_then(|code| Ok(http::StatusCode::from_u16(code)?))?;
    sess.response_mut(handle)?.status = status;
    Ok(())
  }

  fn version_get(caller, handle: u32, version_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    sess.response(handle)?;
    mem.write_u32(version_out, HTTP_VERSION_H1)?;
    Ok(())
  }

  fn version_set(caller, handle: u32, version: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.response(handle)?;
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
    let headers = &sess.response(handle)?.headers;
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
    let headers = &sess.response(handle)?.headers;
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
    let headers = &sess.response(handle)?.headers;
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
    let headers = &mut sess.response_mut(handle)?.headers;
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
    let headers = &mut sess.response_mut(handle)?.headers;
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
    let headers = &mut sess.response_mut(handle)?.headers;
    crate::abi::headers::append(
      &mem, headers, name_ptr, name_len, value_ptr, value_len,
    )
  }

  fn header_remove(caller, handle: u32, name_ptr: u32, name_len: u32) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &mut sess.response_mut(handle)?.headers;
    crate::abi::headers::remove(&mem, headers, name_ptr, name_len)
  }

  fn framing_headers_mode_set(caller, handle: u32, mode: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    let mode = FramingHeadersMode::from_u32(mode)?;
    sess.response_mut(handle)?.framing = mode;
    Ok(())
  }

  fn http_keepalive_mode_set(caller, handle: u32, mode: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    let mode = KeepaliveMode::from_u32(mode)?;
    sess.response_mut(handle)?.keepalive = mode;
    Ok(())
  }

  fn send_downstream(caller, handle: u32, body_handle: u32, streaming: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    if streaming != 0 {
      return Err(FastlyStatus::UNSUPPORTED);
    }
    let mut record = sess.responses.close(handle).ok_or(FastlyStatus::BADF)?;
    let body = sess.close_body(body_handle)?;
    let stream = body.stream();
    // A body read error here is fatal for the request.
    let content = match body.kind() {
      BodyKind::Buffer => stream.content()?,
      BodyKind::Streaming => {
        sess.with_cpu_paused(|| stream.read_to_end_blocking(0))?
      }
    };
    apply_framing_mode(&mut record.headers, record.framing);
    sess.send_downstream_response(record, content)?;
    Ok(())
  }
}
