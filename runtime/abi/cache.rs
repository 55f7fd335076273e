// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_cache`.
//!
//! Option structs cross the ABI as a bitmask plus a packed struct; only
//! fields whose bit is set are read, and reserved or unknown bits are
//! rejected.

use bytes::Bytes;
use http::HeaderMap;
use xqd_cache::WriteOptions;

use crate::abi::hostcalls;
use crate::async_io::AsyncItem;
use crate::async_io::CacheBusy;
use crate::body::Body;
use crate::error::FastlyStatus;
use crate::memory::GuestMemory;
use crate::session::CacheEntryRecord;
use crate::session::Session;

mod lookup_mask {
  pub const RESERVED: u32 = 1 << 0;
  pub const REQUEST_HEADERS: u32 = 1 << 1;
  pub const KNOWN: u32 = RESERVED | REQUEST_HEADERS;
}

mod write_mask {
  pub const RESERVED: u32 = 1 << 0;
  pub const REQUEST_HEADERS: u32 = 1 << 1;
  pub const VARY_RULE: u32 = 1 << 2;
  pub const INITIAL_AGE_NS: u32 = 1 << 3;
  pub const STALE_WHILE_REVALIDATE_NS: u32 = 1 << 4;
  pub const SURROGATE_KEYS: u32 = 1 << 5;
  pub const LENGTH: u32 = 1 << 6;
  pub const USER_METADATA: u32 = 1 << 7;
  pub const SENSITIVE_DATA: u32 = 1 << 8;
  pub const EDGE_MAX_AGE_NS: u32 = 1 << 9;
  pub const KNOWN: u32 = RESERVED
    | REQUEST_HEADERS
    | VARY_RULE
    | INITIAL_AGE_NS
    | STALE_WHILE_REVALIDATE_NS
    | SURROGATE_KEYS
    | LENGTH
    | USER_METADATA
    | SENSITIVE_DATA
    | EDGE_MAX_AGE_NS;
}

mod body_mask {
  pub const RESERVED: u32 = 1 << 0;
  pub const FROM: u32 = 1 << 1;
  pub const TO: u32 = 1 << 2;
  pub const KNOWN: u32 = RESERVED | FROM | TO;
}

fn check_mask(mask: u32, known: u32, reserved: u32) -> Result<(), FastlyStatus> {
  if mask & !known != 0 || mask & reserved != 0 {
    return Err(FastlyStatus::INVAL);
  }
  Ok(())
}

/// `CacheLookupOptions`: `{ request_headers: u32 }`.
fn parse_lookup_options(
  mem: &GuestMemory<'_>,
  sess: &Session,
  mask: u32,
  options_ptr: u32,
) -> Result<HeaderMap, FastlyStatus> {
  check_mask(mask, lookup_mask::KNOWN, lookup_mask::RESERVED)?;
  if mask & lookup_mask::REQUEST_HEADERS != 0 {
    let handle = mem.read_u32(options_ptr)?;
    Ok(sess.request(handle)?.headers.clone())
  } else {
    Ok(HeaderMap::new())
  }
}

/// `CacheWriteOptions`, 72 bytes:
/// `{ max_age_ns: u64 @0, request_headers: u32 @8, vary_rule: (ptr,len)
/// @12, initial_age_ns: u64 @24, stale_while_revalidate_ns: u64 @32,
/// surrogate_keys: (ptr,len) @40 (space-separated), length: u64 @48,
/// user_metadata: (ptr,len) @56, edge_max_age_ns: u64 @64 }`.
/// `max_age_ns` is always read; the rest by mask bit.
fn parse_write_options(
  mem: &GuestMemory<'_>,
  sess: &Session,
  mask: u32,
  options_ptr: u32,
) -> Result<(WriteOptions, HeaderMap), FastlyStatus> {
  check_mask(mask, write_mask::KNOWN, write_mask::RESERVED)?;
  let mut options = WriteOptions {
    max_age_ns: mem.read_u64(options_ptr)?,
    ..WriteOptions::default()
  };
  let mut headers = HeaderMap::new();
  if mask & write_mask::REQUEST_HEADERS != 0 {
    let handle = mem.read_u32(options_ptr + 8)?;
    headers = sess.request(handle)?.headers.clone();
  }
  if mask & write_mask::VARY_RULE != 0 {
    let ptr = mem.read_u32(options_ptr + 12)?;
    let len = mem.read_u32(options_ptr + 16)?;
    let raw = mem.copy_from_guest(ptr, len)?;
    let rule =
      String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    options.vary_rule = Some(rule);
  }
  if mask & write_mask::INITIAL_AGE_NS != 0 {
    options.initial_age_ns = mem.read_u64(options_ptr + 24)?;
  }
  if mask & write_mask::STALE_WHILE_REVALIDATE_NS != 0 {
    options.stale_while_revalidate_ns = mem.read_u64(options_ptr + 32)?;
  }
  if mask & write_mask::SURROGATE_KEYS != 0 {
    let ptr = mem.read_u32(options_ptr + 40)?;
    let len = mem.read_u32(options_ptr + 44)?;
    let raw = mem.copy_from_guest(ptr, len)?;
    let keys =
      String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    options.surrogate_keys = keys
      .split_ascii_whitespace()
      .map(str::to_string)
      .collect();
  }
  if mask & write_mask::LENGTH != 0 {
    options.length = Some(mem.read_u64(options_ptr + 48)?);
  }
  if mask & write_mask::USER_METADATA != 0 {
    let ptr = mem.read_u32(options_ptr + 56)?;
    let len = mem.read_u32(options_ptr + 60)?;
    options.user_metadata = Bytes::from(mem.copy_from_guest(ptr, len)?);
  }
  options.sensitive_data = mask & write_mask::SENSITIVE_DATA != 0;
  if mask & write_mask::EDGE_MAX_AGE_NS != 0 {
    options.edge_max_age_ns = mem.read_u64(options_ptr + 64)?;
  }
  Ok((options, headers))
}

fn insert_entry_for_transaction(
  sess: &mut Session,
  transaction: xqd_cache::Transaction,
) -> u32 {
  let record = CacheEntryRecord {
    key: transaction.key().to_vec(),
    state: transaction.state(),
    object: transaction.object().cloned(),
    transaction: Some(transaction),
  };
  sess.cache_entries.insert(record)
}

hostcalls! {
  fn lookup(
    caller,
    key_ptr: u32,
    key_len: u32,
    options_mask: u32,
    options_ptr: u32,
    handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = mem.copy_from_guest(key_ptr, key_len)?;
    let headers = parse_lookup_options(&mem, sess, options_mask, options_ptr)?;
    let entry = sess.config.cache.clone().lookup(&key, &headers);
    let handle = sess.cache_entries.insert(CacheEntryRecord {
      key,
      state: entry.state,
      object: entry.object,
      transaction: None,
    });
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn insert(
    caller,
    key_ptr: u32,
    key_len: u32,
    options_mask: u32,
    options_ptr: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = mem.copy_from_guest(key_ptr, key_len)?;
    let (options, headers) =
      parse_write_options(&mem, sess, options_mask, options_ptr)?;
    let stream = sess.config.cache.clone().insert(&key, &headers, options);
    let handle = sess.insert_body(Body::writer(stream));
    mem.write_u32(body_handle_out, handle)?;
    Ok(())
  }

  fn transaction_lookup(
    caller,
    key_ptr: u32,
    key_len: u32,
    options_mask: u32,
    options_ptr: u32,
    handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = mem.copy_from_guest(key_ptr, key_len)?;
    let headers = parse_lookup_options(&mem, sess, options_mask, options_ptr)?;
    let cache = sess.config.cache.clone();
    // May park behind another transaction on the same key.
    let transaction = sess
      .with_cpu_paused(|| cache.transaction_lookup(&key, &headers));
    let handle = insert_entry_for_transaction(sess, transaction);
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn transaction_lookup_async(
    caller,
    key_ptr: u32,
    key_len: u32,
    options_mask: u32,
    options_ptr: u32,
    busy_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = mem.copy_from_guest(key_ptr, key_len)?;
    let headers = parse_lookup_options(&mem, sess, options_mask, options_ptr)?;
    let busy = CacheBusy::new();
    let resolver = busy.resolver();
    let cache = sess.config.cache.clone();
    sess.handle.spawn_blocking(move || {
      let transaction = cache.transaction_lookup(&key, &headers);
      resolver.resolve(&cache, transaction);
    });
    let handle = sess.async_items.insert(AsyncItem::CacheBusy(busy));
    mem.write_u32(busy_handle_out, handle)?;
    Ok(())
  }

  fn cache_busy_handle_wait(caller, busy_handle: u32, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let flag = match sess.async_item(busy_handle)? {
      AsyncItem::CacheBusy(busy) => busy.ready_flag(),
      _ => return Err(FastlyStatus::BADF),
    };
    sess.with_cpu_paused(|| flag.wait_blocking());
    let busy = match sess.async_items.close(busy_handle) {
      Some(AsyncItem::CacheBusy(busy)) => busy,
      _ => return Err(FastlyStatus::BADF),
    };
    let transaction = busy.take().ok_or(FastlyStatus::ERROR)?;
    let handle = insert_entry_for_transaction(sess, transaction);
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn transaction_insert(
    caller,
    handle: u32,
    options_mask: u32,
    options_ptr: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let (options, _) =
      parse_write_options(&mem, sess, options_mask, options_ptr)?;
    let cache = sess.config.cache.clone();
    let record = sess.cache_entry_mut(handle)?;
    let transaction =
      record.transaction.as_mut().ok_or(FastlyStatus::ERROR)?;
    let (stream, object) = cache.transaction_insert(transaction, options)?;
    record.state = transaction.state();
    record.object = Some(object);
    let body_handle = sess.insert_body(Body::writer(stream));
    mem.write_u32(body_handle_out, body_handle)?;
    Ok(())
  }

  fn transaction_insert_and_stream_back(
    caller,
    handle: u32,
    options_mask: u32,
    options_ptr: u32,
    body_handle_out: u32,
    cache_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let (options, _) =
      parse_write_options(&mem, sess, options_mask, options_ptr)?;
    let cache = sess.config.cache.clone();
    let record = sess.cache_entry_mut(handle)?;
    let transaction =
      record.transaction.as_mut().ok_or(FastlyStatus::ERROR)?;
    let (stream, object) = cache.transaction_insert(transaction, options)?;
    record.state = transaction.state();
    record.object = Some(object.clone());
    let key = record.key.clone();
    let state = record.state;
    let body_handle = sess.insert_body(Body::writer(stream));
    let stream_back = sess.cache_entries.insert(CacheEntryRecord {
      key,
      state,
      object: Some(object),
      transaction: None,
    });
    mem.write_u32(body_handle_out, body_handle)?;
    mem.write_u32(cache_handle_out, stream_back)?;
    Ok(())
  }

  fn transaction_update(caller, handle: u32, options_mask: u32, options_ptr: u32) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let (options, _) =
      parse_write_options(&mem, sess, options_mask, options_ptr)?;
    let cache = sess.config.cache.clone();
    let record = sess.cache_entry_mut(handle)?;
    let transaction =
      record.transaction.as_mut().ok_or(FastlyStatus::ERROR)?;
    cache.transaction_update(transaction, options)?;
    record.state = transaction.state();
    Ok(())
  }

  fn transaction_cancel(caller, handle: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    let cache = sess.config.cache.clone();
    let record = sess.cache_entry_mut(handle)?;
    let transaction =
      record.transaction.as_mut().ok_or(FastlyStatus::ERROR)?;
    cache.transaction_cancel(transaction);
    Ok(())
  }

  fn close_busy(caller, busy_handle: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    match sess.async_item(busy_handle)? {
      AsyncItem::CacheBusy(busy) => busy.cancel(),
      _ => return Err(FastlyStatus::BADF),
    }
    sess.async_items.close(busy_handle);
    Ok(())
  }

  fn close(caller, handle: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    let cache = sess.config.cache.clone();
    let mut record =
      sess.cache_entries.close(handle).ok_or(FastlyStatus::BADF)?;
    if let Some(transaction) = record.transaction.as_mut() {
      cache.complete(transaction);
    }
    Ok(())
  }

  fn get_state(caller, handle: u32, state_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let state = sess.cache_entry(handle)?.state;
    mem.write_u32(state_out, state.bits())?;
    Ok(())
  }

  fn get_user_metadata(
    caller,
    handle: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    let metadata = object.user_metadata();
    crate::abi::write_buf(&mut mem, buf, buf_len, nwritten_out, &metadata)
  }

  fn get_body(
    caller,
    handle: u32,
    options_mask: u32,
    options_ptr: u32,
    body_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    check_mask(options_mask, body_mask::KNOWN, body_mask::RESERVED)?;
    if options_mask & (body_mask::FROM | body_mask::TO) != 0 {
      // Range reads would need offsets read from `options_ptr`.
      let _ = options_ptr;
      return Err(FastlyStatus::UNSUPPORTED);
    }
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    let body = Body::streaming(object.body());
    let body_handle = sess.insert_body(body);
    mem.write_u32(body_handle_out, body_handle)?;
    Ok(())
  }

  fn get_length(caller, handle: u32, length_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    let length = object.known_length().ok_or(FastlyStatus::NONE)?;
    mem.write_u64(length_out, length)?;
    Ok(())
  }

  fn get_max_age_ns(caller, handle: u32, out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    mem.write_u64(out, object.max_age_ns())?;
    Ok(())
  }

  fn get_stale_while_revalidate_ns(caller, handle: u32, out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    mem.write_u64(out, object.stale_while_revalidate_ns())?;
    Ok(())
  }

  fn get_age_ns(caller, handle: u32, out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    mem.write_u64(out, object.age_ns())?;
    Ok(())
  }

  fn get_hits(caller, handle: u32, out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let object = sess
      .cache_entry(handle)?
      .object
      .as_ref()
      .ok_or(FastlyStatus::NONE)?;
    mem.write_u64(out, object.hits())?;
    Ok(())
  }
}
