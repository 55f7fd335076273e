// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_http_downstream`.
//!
//! A local session serves exactly one downstream request, so the
//! next-request promise can only ever complete by abandonment.

use crate::abi::hostcalls;
use crate::async_io::AsyncItem;
use crate::async_io::DownstreamNext;
use crate::error::FastlyStatus;

hostcalls! {
  fn next_request(caller, options_mask: u32, options_ptr: u32, pending_handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if options_mask != 0 {
      return Err(FastlyStatus::INVAL);
    }
    let _ = options_ptr;
    let handle = sess
      .async_items
      .insert(AsyncItem::DownstreamNext(DownstreamNext::new()));
    mem.write_u32(pending_handle_out, handle)?;
    Ok(())
  }

  fn next_request_wait(
    caller,
    pending_handle: u32,
    req_handle_out: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let flag = match sess.async_item(pending_handle)? {
      AsyncItem::DownstreamNext(next) => next.ready_flag(),
      _ => return Err(FastlyStatus::BADF),
    };
    sess.with_cpu_paused(|| flag.wait_blocking());
    // The only completion is abandonment: report cancellation.
    let _ = (req_handle_out, body_handle_out);
    mem.write_u32(req_handle_out, crate::handles::INVALID_HANDLE)?;
    mem.write_u32(body_handle_out, crate::handles::INVALID_HANDLE)?;
    Err(FastlyStatus::ERROR)
  }

  fn next_request_abandon(caller, pending_handle: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    match sess.async_item(pending_handle)? {
      AsyncItem::DownstreamNext(next) => next.abandon(),
      _ => return Err(FastlyStatus::BADF),
    }
    sess.async_items.close(pending_handle);
    Ok(())
  }
}
