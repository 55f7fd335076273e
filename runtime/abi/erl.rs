// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_erl`.

use crate::abi::hostcalls;
use crate::error::FastlyStatus;
use crate::memory::GuestMemory;

fn read_name(
  mem: &GuestMemory<'_>,
  ptr: u32,
  len: u32,
) -> Result<String, FastlyStatus> {
  String::from_utf8(mem.copy_from_guest(ptr, len)?)
    .map_err(|_| FastlyStatus::INVAL)
}

hostcalls! {
  fn check_rate(
    caller,
    rc_name_ptr: u32,
    rc_name_len: u32,
    entry_ptr: u32,
    entry_len: u32,
    delta: u32,
    window: u32,
    limit: u32,
    pb_name_ptr: u32,
    pb_name_len: u32,
    ttl: u32,
    blocked_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let rc_name = read_name(&mem, rc_name_ptr, rc_name_len)?;
    let entry = read_name(&mem, entry_ptr, entry_len)?;
    let pb_name = read_name(&mem, pb_name_ptr, pb_name_len)?;
    let rc = sess.config.erl.rate_counter(&rc_name);
    let pb = sess.config.erl.penalty_box(&pb_name);
    let blocked =
      xqd_erl::check_rate(&rc, &pb, &entry, delta, window, limit, ttl);
    mem.write_u32(blocked_out, u32::from(blocked))?;
    Ok(())
  }

  fn ratecounter_increment(
    caller,
    rc_name_ptr: u32,
    rc_name_len: u32,
    entry_ptr: u32,
    entry_len: u32,
    delta: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let rc_name = read_name(&mem, rc_name_ptr, rc_name_len)?;
    let entry = read_name(&mem, entry_ptr, entry_len)?;
    sess.config.erl.rate_counter(&rc_name).increment(&entry, delta);
    Ok(())
  }

  fn ratecounter_lookup_rate(
    caller,
    rc_name_ptr: u32,
    rc_name_len: u32,
    entry_ptr: u32,
    entry_len: u32,
    window: u32,
    rate_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let rc_name = read_name(&mem, rc_name_ptr, rc_name_len)?;
    let entry = read_name(&mem, entry_ptr, entry_len)?;
    let rate = sess.config.erl.rate_counter(&rc_name).lookup_rate(&entry, window);
    mem.write_u32(rate_out, rate)?;
    Ok(())
  }

  fn ratecounter_lookup_count(
    caller,
    rc_name_ptr: u32,
    rc_name_len: u32,
    entry_ptr: u32,
    entry_len: u32,
    duration: u32,
    count_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let rc_name = read_name(&mem, rc_name_ptr, rc_name_len)?;
    let entry = read_name(&mem, entry_ptr, entry_len)?;
    let count =
      sess.config.erl.rate_counter(&rc_name).lookup_count(&entry, duration);
    mem.write_u32(count_out, count)?;
    Ok(())
  }

  fn penaltybox_add(
    caller,
    pb_name_ptr: u32,
    pb_name_len: u32,
    entry_ptr: u32,
    entry_len: u32,
    ttl: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let pb_name = read_name(&mem, pb_name_ptr, pb_name_len)?;
    let entry = read_name(&mem, entry_ptr, entry_len)?;
    sess.config.erl.penalty_box(&pb_name).add(&entry, ttl);
    Ok(())
  }

  fn penaltybox_has(
    caller,
    pb_name_ptr: u32,
    pb_name_len: u32,
    entry_ptr: u32,
    entry_len: u32,
    has_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let pb_name = read_name(&mem, pb_name_ptr, pb_name_len)?;
    let entry = read_name(&mem, entry_ptr, entry_len)?;
    let has = sess.config.erl.penalty_box(&pb_name).has(&entry);
    mem.write_u32(has_out, u32::from(has))?;
    Ok(())
  }
}
