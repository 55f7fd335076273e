// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_purge`.

use crate::abi::hostcalls;
use crate::error::FastlyStatus;

const SOFT_PURGE: u32 = 1 << 0;

hostcalls! {
  fn purge_surrogate_key(
    caller,
    surrogate_key_ptr: u32,
    surrogate_key_len: u32,
    options_mask: u32,
    options_ptr: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    if options_mask & !SOFT_PURGE != 0 {
      return Err(FastlyStatus::INVAL);
    }
    // No purge response body is produced, so the options struct carries
    // nothing we read.
    let _ = options_ptr;
    let raw = mem.copy_from_guest(surrogate_key_ptr, surrogate_key_len)?;
    let surrogate_key =
      String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    let cache = sess.config.cache.clone();
    if options_mask & SOFT_PURGE != 0 {
      cache.soft_purge_surrogate_key(&surrogate_key);
    } else {
      cache.purge_surrogate_key(&surrogate_key);
    }
    Ok(())
  }
}
