// Copyright 2018-2026 the Deno authors. MIT license.

//! Pluggable lookup surfaces: `fastly_dictionary`, `fastly_config_store`,
//! `fastly_secret_store`, `fastly_device_detection`, `fastly_geo` and
//! `fastly_image_optimizer`. Internals belong to the embedder; the host
//! only routes names, keys and buffers.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use bytes::Bytes;

use crate::abi::hostcalls;
use crate::body::Body;
use crate::error::FastlyStatus;
use crate::http::ResponseRecord;
use crate::memory::GuestMemory;

fn read_string(
  mem: &GuestMemory<'_>,
  ptr: u32,
  len: u32,
) -> Result<String, FastlyStatus> {
  String::from_utf8(mem.copy_from_guest(ptr, len)?)
    .map_err(|_| FastlyStatus::INVAL)
}

/// Shared by `fastly_dictionary::get` and `fastly_config_store::get`;
/// the two stores have identical lookup semantics.
fn keyed_get(
  caller: &mut wasmtime::Caller<'_, crate::session::Session>,
  handle: u32,
  key_ptr: u32,
  key_len: u32,
  value_buf: u32,
  value_max_len: u32,
  nwritten_out: u32,
) -> Result<(), FastlyStatus> {
  let (mut mem, sess) = crate::abi::ctx(caller)?;
  let key = read_string(&mem, key_ptr, key_len)?;
  let lookup =
    sess.dictionaries.get(handle).ok_or(FastlyStatus::BADF)?;
  let value = lookup(&key).ok_or(FastlyStatus::NONE)?;
  crate::abi::write_buf(
    &mut mem,
    value_buf,
    value_max_len,
    nwritten_out,
    value.as_bytes(),
  )
}

hostcalls! {
  fn dictionary_open(caller, name_ptr: u32, name_len: u32, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let name = read_string(&mem, name_ptr, name_len)?;
    let lookup = sess
      .config
      .dictionaries
      .get(&name)
      .cloned()
      .ok_or(FastlyStatus::INVAL)?;
    let handle = sess.dictionaries.insert(lookup);
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn dictionary_get(
    caller,
    dictionary_handle: u32,
    key_ptr: u32,
    key_len: u32,
    value_buf: u32,
    value_max_len: u32,
    nwritten_out: u32,
  ) {
    keyed_get(
      &mut caller,
      dictionary_handle,
      key_ptr,
      key_len,
      value_buf,
      value_max_len,
      nwritten_out,
    )
  }

  fn config_store_open(caller, name_ptr: u32, name_len: u32, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let name = read_string(&mem, name_ptr, name_len)?;
    let lookup = sess
      .config
      .config_stores
      .get(&name)
      .cloned()
      .ok_or(FastlyStatus::INVAL)?;
    let handle = sess.dictionaries.insert(lookup);
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn config_store_get(
    caller,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    value_buf: u32,
    value_max_len: u32,
    nwritten_out: u32,
  ) {
    keyed_get(
      &mut caller,
      store_handle,
      key_ptr,
      key_len,
      value_buf,
      value_max_len,
      nwritten_out,
    )
  }

  fn secret_store_open(caller, name_ptr: u32, name_len: u32, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let name = read_string(&mem, name_ptr, name_len)?;
    let lookup = sess
      .config
      .secret_stores
      .get(&name)
      .cloned()
      .ok_or(FastlyStatus::INVAL)?;
    let handle = sess.secret_stores.insert(lookup);
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn secret_store_get(
    caller,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    secret_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = read_string(&mem, key_ptr, key_len)?;
    let lookup = sess
      .secret_stores
      .get(store_handle)
      .ok_or(FastlyStatus::BADF)?;
    let secret = lookup(&key).ok_or(FastlyStatus::NONE)?;
    let handle = sess.secrets.insert(secret);
    mem.write_u32(secret_handle_out, handle)?;
    Ok(())
  }

  fn secret_plaintext(
    caller,
    secret_handle: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let plaintext = sess
      .secrets
      .get(secret_handle)
      .ok_or(FastlyStatus::BADF)?
      .clone();
    crate::abi::write_buf(&mut mem, buf, buf_len, nwritten_out, &plaintext)
  }

  fn device_detection_lookup(
    caller,
    user_agent_ptr: u32,
    user_agent_len: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let user_agent = read_string(&mem, user_agent_ptr, user_agent_len)?;
    let lookup =
      sess.config.device_detection.clone().ok_or(FastlyStatus::NONE)?;
    let device = lookup(&user_agent).ok_or(FastlyStatus::NONE)?;
    crate::abi::write_buf(
      &mut mem,
      buf,
      buf_len,
      nwritten_out,
      device.as_bytes(),
    )
  }

  fn geo_ip_lookup(
    caller,
    ip_ptr: u32,
    ip_len: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let octets = mem.copy_from_guest(ip_ptr, ip_len)?;
    let ip: IpAddr = match octets.len() {
      4 => {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&octets);
        Ipv4Addr::from(bytes).into()
      }
      16 => {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&octets);
        Ipv6Addr::from(bytes).into()
      }
      _ => return Err(FastlyStatus::INVAL),
    };
    let lookup = sess.config.geolocation.clone().ok_or(FastlyStatus::NONE)?;
    let geo = lookup(ip).ok_or(FastlyStatus::NONE)?;
    crate::abi::write_buf(&mut mem, buf, buf_len, nwritten_out, geo.as_bytes())
  }

  fn transform_image_optimizer_request(
    caller,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    options_mask: u32,
    options_ptr: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    // The transform is entirely embedder-defined; the backend name and
    // options are accepted for ABI parity.
    let _ = read_string(&mem, backend_ptr, backend_len)?;
    let _ = (options_mask, options_ptr);
    let transform = sess
      .config
      .image_optimizer
      .clone()
      .ok_or(FastlyStatus::UNSUPPORTED)?;
    let record = sess.request(req_handle)?.clone();
    let body = sess.close_body(body_handle)?;
    let content = Bytes::from(body.stream().content()?);
    let response =
      transform(&record, content).map_err(|_| FastlyStatus::ERROR)?;
    let (parts, body) = response.into_parts();
    let response_record = ResponseRecord {
      status: parts.status,
      headers: parts.headers,
      ..ResponseRecord::new()
    };
    let resp_handle = sess.responses.insert(response_record);
    let body_handle = sess.insert_body(Body::received(body.to_vec()));
    mem.write_u32(resp_handle_out, resp_handle)?;
    mem.write_u32(body_handle_out, body_handle)?;
    Ok(())
  }
}
