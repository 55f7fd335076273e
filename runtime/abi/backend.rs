// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_backend`.

use crate::abi::hostcalls;
use crate::error::FastlyStatus;

/// Backend health is unknown for handler-backed origins.
const HEALTH_UNKNOWN: u32 = 0;

hostcalls! {
  fn exists(caller, name_ptr: u32, name_len: u32, exists_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let raw = mem.copy_from_guest(name_ptr, name_len)?;
    let name = String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    let exists = sess.config.backends.contains_key(&name);
    mem.write_u32(exists_out, u32::from(exists))?;
    Ok(())
  }

  fn is_healthy(caller, name_ptr: u32, name_len: u32, healthy_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let raw = mem.copy_from_guest(name_ptr, name_len)?;
    let name = String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    if !sess.config.backends.contains_key(&name) {
      return Err(FastlyStatus::INVAL);
    }
    mem.write_u32(healthy_out, HEALTH_UNKNOWN)?;
    Ok(())
  }

  fn is_dynamic(caller, name_ptr: u32, name_len: u32, dynamic_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let raw = mem.copy_from_guest(name_ptr, name_len)?;
    let name = String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    if !sess.config.backends.contains_key(&name) {
      return Err(FastlyStatus::INVAL);
    }
    // All backends here are statically configured.
    mem.write_u32(dynamic_out, 0)?;
    Ok(())
  }
}
