// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_http_cache`: the HTTP-flavored façade over the core cache.

use crate::abi::hostcalls;
use crate::error::FastlyStatus;

hostcalls! {
  fn is_request_cacheable(caller, req_handle: u32, is_cacheable_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let cacheable =
      xqd_cache::is_request_cacheable(&sess.request(req_handle)?.method);
    mem.write_u32(is_cacheable_out, u32::from(cacheable))?;
    Ok(())
  }

  fn get_suggested_cache_key(
    caller,
    req_handle: u32,
    key_buf: u32,
    key_buf_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let url = sess.request(req_handle)?.url.to_string();
    let key = xqd_cache::suggested_cache_key(&url);
    crate::abi::write_buf(&mut mem, key_buf, key_buf_len, nwritten_out, &key)
  }

  fn get_suggested_backend_request(caller, req_handle: u32, req_handle_out: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.request(req_handle)?;
    let _ = req_handle_out;
    Err(FastlyStatus::UNSUPPORTED)
  }

  // Writes the suggested `CacheWriteOptions` (the `max_age_ns` field at
  // offset 0) and a mask of populated optional fields (none).
  fn get_suggested_cache_options(
    caller,
    resp_handle: u32,
    options_mask_out: u32,
    options_ptr: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let headers = &sess.response(resp_handle)?.headers;
    let options = xqd_cache::suggested_write_options(headers);
    mem.write_u64(options_ptr, options.max_age_ns)?;
    mem.write_u32(options_mask_out, 0)?;
    Ok(())
  }
}
