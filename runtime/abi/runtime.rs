// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_abi`, `fastly_uap`, `fastly_compute_runtime` and
//! `fastly_async_io`.

use crate::abi::hostcalls;
use crate::async_io::block_until_first;
use crate::async_io::SELECT_TIMEOUT;
use crate::error::FastlyStatus;
use crate::uap::parse_fallback;

/// The only ABI version this host speaks.
const ABI_VERSION: u64 = 1;

hostcalls! {
  fn abi_init(caller, abi_version: u64) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    if abi_version != ABI_VERSION {
      log::warn!("guest requested unsupported ABI version {abi_version}");
      return Err(FastlyStatus::UNSUPPORTED);
    }
    sess.abi_initialized = true;
    Ok(())
  }

  fn uap_parse(
    caller,
    user_agent_ptr: u32,
    user_agent_len: u32,
    family_buf: u32,
    family_buf_len: u32,
    family_nwritten_out: u32,
    major_buf: u32,
    major_buf_len: u32,
    major_nwritten_out: u32,
    minor_buf: u32,
    minor_buf_len: u32,
    minor_nwritten_out: u32,
    patch_buf: u32,
    patch_buf_len: u32,
    patch_nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let raw = mem.copy_from_guest(user_agent_ptr, user_agent_len)?;
    let user_agent =
      String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    let parsed = match &sess.config.uap {
      Some(parser) => parser(&user_agent),
      None => parse_fallback(&user_agent),
    };
    crate::abi::write_buf(
      &mut mem,
      family_buf,
      family_buf_len,
      family_nwritten_out,
      parsed.family.as_bytes(),
    )?;
    crate::abi::write_buf(
      &mut mem,
      major_buf,
      major_buf_len,
      major_nwritten_out,
      parsed.major.as_bytes(),
    )?;
    crate::abi::write_buf(
      &mut mem,
      minor_buf,
      minor_buf_len,
      minor_nwritten_out,
      parsed.minor.as_bytes(),
    )?;
    crate::abi::write_buf(
      &mut mem,
      patch_buf,
      patch_buf_len,
      patch_nwritten_out,
      parsed.patch.as_bytes(),
    )?;
    Ok(())
  }

  fn get_vcpu_ms(caller, vcpu_ms_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    mem.write_u64(vcpu_ms_out, sess.cpu.total_ms())?;
    Ok(())
  }

  fn async_select(
    caller,
    handles_ptr: u32,
    handles_len: u32,
    timeout_ms: u32,
    ready_index_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if handles_len == 0 && timeout_ms == 0 {
      // Nothing to wait for and no timeout to bound the sleep.
      return Err(FastlyStatus::INVAL);
    }
    let mut futures = Vec::with_capacity(handles_len as usize);
    for index in 0..handles_len {
      let handle = mem.read_u32(handles_ptr + index * 4)?;
      futures.push(sess.async_item(handle)?.ready_future());
    }
    let handle = sess.handle.clone();
    let winner = sess
      .with_cpu_paused(|| block_until_first(&handle, futures, timeout_ms));
    match winner {
      Some(index) => mem.write_u32(ready_index_out, index)?,
      None => mem.write_u32(ready_index_out, SELECT_TIMEOUT)?,
    }
    Ok(())
  }

  fn async_is_ready(caller, handle: u32, is_ready_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let ready = sess.async_item(handle)?.is_ready();
    mem.write_u32(is_ready_out, u32::from(ready))?;
    Ok(())
  }
}
