// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_kv_store`.
//!
//! Operations resolve through pending handles so they compose with
//! `fastly_async_io`; the in-memory store completes them immediately.
//!
//! KV detail codes written to `kv_error_out`: 1 = ok, 3 = not found.

use bytes::Bytes;

use crate::abi::hostcalls;
use crate::async_io::AsyncItem;
use crate::async_io::PendingKv;
use crate::body::Body;
use crate::error::FastlyStatus;
use crate::handles::INVALID_HANDLE;
use crate::memory::GuestMemory;

const KV_OK: u32 = 1;
const KV_NOT_FOUND: u32 = 3;

mod insert_mask {
  pub const RESERVED: u32 = 1 << 0;
  pub const METADATA: u32 = 1 << 1;
  pub const TTL: u32 = 1 << 2;
  pub const KNOWN: u32 = RESERVED | METADATA | TTL;
}

mod list_mask {
  pub const RESERVED: u32 = 1 << 0;
  pub const CURSOR: u32 = 1 << 1;
  pub const LIMIT: u32 = 1 << 2;
  pub const PREFIX: u32 = 1 << 3;
  pub const KNOWN: u32 = RESERVED | CURSOR | LIMIT | PREFIX;
}

fn read_string(
  mem: &GuestMemory<'_>,
  ptr: u32,
  len: u32,
) -> Result<String, FastlyStatus> {
  String::from_utf8(mem.copy_from_guest(ptr, len)?)
    .map_err(|_| FastlyStatus::INVAL)
}

hostcalls! {
  fn open(caller, name_ptr: u32, name_len: u32, store_handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let name = read_string(&mem, name_ptr, name_len)?;
    let store = sess
      .config
      .kv_stores
      .get(&name)
      .cloned()
      .ok_or(FastlyStatus::INVAL)?;
    let handle = sess.kv_stores.insert(store);
    mem.write_u32(store_handle_out, handle)?;
    Ok(())
  }

  fn lookup(
    caller,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = read_string(&mem, key_ptr, key_len)?;
    let store =
      sess.kv_stores.get(store_handle).ok_or(FastlyStatus::BADF)?;
    let result = store.lookup(&key);
    let handle = sess
      .async_items
      .insert(AsyncItem::KvLookup(PendingKv::resolved(result)));
    mem.write_u32(pending_handle_out, handle)?;
    Ok(())
  }

  fn lookup_wait(
    caller,
    pending_handle: u32,
    body_handle_out: u32,
    metadata_buf: u32,
    metadata_buf_len: u32,
    nwritten_out: u32,
    generation_out: u32,
    kv_error_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if !matches!(sess.async_item(pending_handle)?, AsyncItem::KvLookup(_)) {
      return Err(FastlyStatus::BADF);
    }
    let result = match sess.async_items.close(pending_handle) {
      Some(AsyncItem::KvLookup(op)) => op.take().ok_or(FastlyStatus::ERROR)?,
      _ => return Err(FastlyStatus::BADF),
    };
    match result {
      Some(value) => {
        let metadata = value.metadata.clone().unwrap_or_default();
        crate::abi::write_buf(
          &mut mem,
          metadata_buf,
          metadata_buf_len,
          nwritten_out,
          &metadata,
        )?;
        let body =
          sess.insert_body(Body::received(value.data.to_vec()));
        mem.write_u32(body_handle_out, body)?;
        mem.write_u64(generation_out, value.generation)?;
        mem.write_u32(kv_error_out, KV_OK)?;
      }
      None => {
        mem.write_u32(body_handle_out, INVALID_HANDLE)?;
        mem.write_u32(nwritten_out, 0)?;
        mem.write_u64(generation_out, 0)?;
        mem.write_u32(kv_error_out, KV_NOT_FOUND)?;
      }
    }
    Ok(())
  }

  fn insert(
    caller,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    body_handle: u32,
    insert_mask: u32,
    insert_config_ptr: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if insert_mask & !insert_mask::KNOWN != 0
      || insert_mask & insert_mask::RESERVED != 0
    {
      return Err(FastlyStatus::INVAL);
    }
    let key = read_string(&mem, key_ptr, key_len)?;
    // `KvInsertConfig`: `{ metadata: (ptr @0, len @4), ttl_sec: u32 @8 }`.
    let metadata = if insert_mask & insert_mask::METADATA != 0 {
      let ptr = mem.read_u32(insert_config_ptr)?;
      let len = mem.read_u32(insert_config_ptr + 4)?;
      Some(Bytes::from(mem.copy_from_guest(ptr, len)?))
    } else {
      None
    };
    if insert_mask & insert_mask::TTL != 0 {
      log::debug!("kv insert TTL accepted and ignored");
    }
    let body = sess.close_body(body_handle)?;
    let data = Bytes::from(body.stream().content()?);
    let store =
      sess.kv_stores.get(store_handle).ok_or(FastlyStatus::BADF)?;
    store.insert(&key, data, metadata);
    let handle = sess
      .async_items
      .insert(AsyncItem::KvInsert(PendingKv::resolved(())));
    mem.write_u32(pending_handle_out, handle)?;
    Ok(())
  }

  fn insert_wait(caller, pending_handle: u32, kv_error_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if !matches!(sess.async_item(pending_handle)?, AsyncItem::KvInsert(_)) {
      return Err(FastlyStatus::BADF);
    }
    match sess.async_items.close(pending_handle) {
      Some(AsyncItem::KvInsert(op)) => {
        op.take().ok_or(FastlyStatus::ERROR)?;
        mem.write_u32(kv_error_out, KV_OK)?;
        Ok(())
      }
      _ => Err(FastlyStatus::BADF),
    }
  }

  fn delete(
    caller,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let key = read_string(&mem, key_ptr, key_len)?;
    let store =
      sess.kv_stores.get(store_handle).ok_or(FastlyStatus::BADF)?;
    let found = store.delete(&key);
    let handle = sess
      .async_items
      .insert(AsyncItem::KvDelete(PendingKv::resolved(found)));
    mem.write_u32(pending_handle_out, handle)?;
    Ok(())
  }

  fn delete_wait(caller, pending_handle: u32, kv_error_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if !matches!(sess.async_item(pending_handle)?, AsyncItem::KvDelete(_)) {
      return Err(FastlyStatus::BADF);
    }
    match sess.async_items.close(pending_handle) {
      Some(AsyncItem::KvDelete(op)) => {
        let found = op.take().ok_or(FastlyStatus::ERROR)?;
        mem.write_u32(kv_error_out, if found { KV_OK } else { KV_NOT_FOUND })?;
        Ok(())
      }
      _ => Err(FastlyStatus::BADF),
    }
  }

  fn list(
    caller,
    store_handle: u32,
    list_mask: u32,
    list_config_ptr: u32,
    pending_handle_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if list_mask & !list_mask::KNOWN != 0
      || list_mask & list_mask::RESERVED != 0
    {
      return Err(FastlyStatus::INVAL);
    }
    // `KvListConfig`: `{ cursor: (ptr @0, len @4), limit: u32 @8,
    // prefix: (ptr @12, len @16) }`.
    let cursor = if list_mask & list_mask::CURSOR != 0 {
      let ptr = mem.read_u32(list_config_ptr)?;
      let len = mem.read_u32(list_config_ptr + 4)?;
      Some(read_string(&mem, ptr, len)?)
    } else {
      None
    };
    let limit = if list_mask & list_mask::LIMIT != 0 {
      Some(mem.read_u32(list_config_ptr + 8)?)
    } else {
      None
    };
    let prefix = if list_mask & list_mask::PREFIX != 0 {
      let ptr = mem.read_u32(list_config_ptr + 12)?;
      let len = mem.read_u32(list_config_ptr + 16)?;
      Some(read_string(&mem, ptr, len)?)
    } else {
      None
    };
    let store =
      sess.kv_stores.get(store_handle).ok_or(FastlyStatus::BADF)?;
    let page = store.list(prefix.as_deref(), limit, cursor.as_deref());
    let handle = sess
      .async_items
      .insert(AsyncItem::KvList(PendingKv::resolved(page.to_json())));
    mem.write_u32(pending_handle_out, handle)?;
    Ok(())
  }

  fn list_wait(caller, pending_handle: u32, body_handle_out: u32, kv_error_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    if !matches!(sess.async_item(pending_handle)?, AsyncItem::KvList(_)) {
      return Err(FastlyStatus::BADF);
    }
    match sess.async_items.close(pending_handle) {
      Some(AsyncItem::KvList(op)) => {
        let json = op.take().ok_or(FastlyStatus::ERROR)?;
        let body = sess.insert_body(Body::received(json));
        mem.write_u32(body_handle_out, body)?;
        mem.write_u32(kv_error_out, KV_OK)?;
        Ok(())
      }
      _ => Err(FastlyStatus::BADF),
    }
  }
}
