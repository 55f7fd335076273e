// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_http_body`.

use http::header::HeaderName;
use http::header::HeaderValue;

use crate::abi::hostcalls;
use crate::body::Body;
use crate::body::BodyKind;
use crate::error::FastlyStatus;
use crate::http::sorted_header_names;

hostcalls! {
  fn new(caller, handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let handle = sess.insert_body(Body::buffered());
    mem.write_u32(handle_out, handle)?;
    Ok(())
  }

  fn append(caller, dst: u32, src: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.body(dst)?;
    let source = sess.close_body(src)?;
    let stream = source.stream();
    let data = match source.kind() {
      BodyKind::Buffer => stream.content()?,
      // A streaming source is produced elsewhere; wait for it so the
      // splice preserves its full ordered content.
      BodyKind::Streaming => {
        sess.with_cpu_paused(|| stream.read_to_end_blocking(0))?
      }
    };
    sess.body_mut(dst)?.write(&data, false)?;
    Ok(())
  }

  fn read(caller, handle: u32, buf: u32, buf_len: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let body = sess.body(handle)?;
    let (kind, stream, offset) =
      (body.kind(), body.stream(), body.read_offset());
    let chunk = match kind {
      BodyKind::Buffer => stream.read_at(offset, buf_len as usize, false)?,
      BodyKind::Streaming => sess.with_cpu_paused(|| {
        stream.read_at(offset, buf_len as usize, true)
      })?,
    };
    sess.body_mut(handle)?.advance(chunk.len());
    mem.write(buf, &chunk)?;
    mem.write_u32(nwritten_out, chunk.len() as u32)?;
    Ok(())
  }

  fn write(
    caller,
    handle: u32,
    buf: u32,
    buf_len: u32,
    end: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let data = mem.copy_from_guest(buf, buf_len)?;
    let written = sess.body_mut(handle)?.write(&data, end != 0)?;
    mem.write_u32(nwritten_out, written as u32)?;
    Ok(())
  }

  fn abandon(caller, handle: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.body(handle)?.abandon();
    sess.async_items.close(handle);
    Ok(())
  }

  fn close(caller, handle: u32) {
    let (_, sess) = crate::abi::ctx(&mut caller)?;
    sess.close_body(handle)?;
    Ok(())
  }

  fn known_length(caller, handle: u32, length_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let length = sess.body(handle)?.known_length().ok_or(FastlyStatus::NONE)?;
    mem.write_u64(length_out, length)?;
    Ok(())
  }

  fn trailer_append(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
  ) {
    let (mem, sess) = crate::abi::ctx(&mut caller)?;
    let name = HeaderName::from_bytes(mem.slice(name_ptr, name_len)?)?;
    let value = HeaderValue::from_bytes(mem.slice(value_ptr, value_len)?)?;
    sess.body_mut(handle)?.append_trailer(name, value)?;
    Ok(())
  }

  fn trailer_names_get(
    caller,
    handle: u32,
    buf: u32,
    buf_len: u32,
    cursor: u32,
    ending_cursor_out: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let names = sorted_header_names(sess.body(handle)?.trailers());
    crate::abi::write_cursor_page(
      &mut mem,
      &names,
      cursor,
      buf,
      buf_len,
      ending_cursor_out,
      nwritten_out,
    )
  }

  fn trailer_value_get(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_buf: u32,
    value_max_len: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let trailers = sess.body(handle)?.trailers();
    crate::abi::headers::value_get(
      &mut mem,
      trailers,
      name_ptr,
      name_len,
      value_buf,
      value_max_len,
      nwritten_out,
    )
  }

  fn trailer_values_get(
    caller,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    buf: u32,
    buf_len: u32,
    cursor: u32,
    ending_cursor_out: u32,
    nwritten_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let trailers = sess.body(handle)?.trailers();
    crate::abi::headers::values_get(
      &mut mem,
      trailers,
      name_ptr,
      name_len,
      buf,
      buf_len,
      cursor,
      ending_cursor_out,
      nwritten_out,
    )
  }
}
