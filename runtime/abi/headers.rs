// Copyright 2018-2026 the Deno authors. MIT license.

//! Header accessors shared by the request and response hostcall groups.

use http::header::HeaderMap;
use http::header::HeaderName;
use http::header::HeaderValue;

use crate::error::FastlyStatus;
use crate::http::header_values;
use crate::http::set_header_values;
use crate::http::sorted_header_names;
use crate::memory::GuestMemory;

fn parse_name(
  mem: &GuestMemory<'_>,
  name_ptr: u32,
  name_len: u32,
) -> Result<HeaderName, FastlyStatus> {
  let raw = mem.slice(name_ptr, name_len)?;
  Ok(HeaderName::from_bytes(raw)?)
}

pub(crate) fn names_get(
  mem: &mut GuestMemory<'_>,
  headers: &HeaderMap,
  buf: u32,
  buf_len: u32,
  cursor: u32,
  ending_cursor_out: u32,
  nwritten_out: u32,
) -> Result<(), FastlyStatus> {
  let names = sorted_header_names(headers);
  super::write_cursor_page(
    mem,
    &names,
    cursor,
    buf,
    buf_len,
    ending_cursor_out,
    nwritten_out,
  )
}

pub(crate) fn value_get(
  mem: &mut GuestMemory<'_>,
  headers: &HeaderMap,
  name_ptr: u32,
  name_len: u32,
  value_buf: u32,
  value_max_len: u32,
  nwritten_out: u32,
) -> Result<(), FastlyStatus> {
  let name = parse_name(mem, name_ptr, name_len)?;
  let value = headers.get(&name).ok_or(FastlyStatus::NONE)?.clone();
  super::write_buf(mem, value_buf, value_max_len, nwritten_out, value.as_bytes())
}

pub(crate) fn values_get(
  mem: &mut GuestMemory<'_>,
  headers: &HeaderMap,
  name_ptr: u32,
  name_len: u32,
  buf: u32,
  buf_len: u32,
  cursor: u32,
  ending_cursor_out: u32,
  nwritten_out: u32,
) -> Result<(), FastlyStatus> {
  let name = parse_name(mem, name_ptr, name_len)?;
  let values = header_values(headers, name.as_str());
  super::write_cursor_page(
    mem,
    &values,
    cursor,
    buf,
    buf_len,
    ending_cursor_out,
    nwritten_out,
  )
}

pub(crate) fn values_set(
  mem: &GuestMemory<'_>,
  headers: &mut HeaderMap,
  name_ptr: u32,
  name_len: u32,
  values_ptr: u32,
  values_len: u32,
) -> Result<(), FastlyStatus> {
  let name = parse_name(mem, name_ptr, name_len)?;
  let packed = mem.copy_from_guest(values_ptr, values_len)?;
  set_header_values(headers, name.as_str(), &packed)
}

pub(crate) fn insert(
  mem: &GuestMemory<'_>,
  headers: &mut HeaderMap,
  name_ptr: u32,
  name_len: u32,
  value_ptr: u32,
  value_len: u32,
) -> Result<(), FastlyStatus> {
  let name = parse_name(mem, name_ptr, name_len)?;
  let value = HeaderValue::from_bytes(mem.slice(value_ptr, value_len)?)?;
  headers.insert(name, value);
  Ok(())
}

pub(crate) fn append(
  mem: &GuestMemory<'_>,
  headers: &mut HeaderMap,
  name_ptr: u32,
  name_len: u32,
  value_ptr: u32,
  value_len: u32,
) -> Result<(), FastlyStatus> {
  let name = parse_name(mem, name_ptr, name_len)?;
  let value = HeaderValue::from_bytes(mem.slice(value_ptr, value_len)?)?;
  headers.append(name, value);
  Ok(())
}

pub(crate) fn remove(
  mem: &GuestMemory<'_>,
  headers: &mut HeaderMap,
  name_ptr: u32,
  name_len: u32,
) -> Result<(), FastlyStatus> {
  let name = parse_name(mem, name_ptr, name_len)?;
  if headers.remove(&name).is_none() {
    return Err(FastlyStatus::INVAL);
  }
  Ok(())
}
