// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_log`.

use std::sync::Arc;

use crate::abi::hostcalls;
use crate::error::FastlyStatus;
use crate::session::Logger;

hostcalls! {
  fn endpoint_get(caller, name_ptr: u32, name_len: u32, endpoint_handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let raw = mem.copy_from_guest(name_ptr, name_len)?;
    let name = String::from_utf8(raw).map_err(|_| FastlyStatus::INVAL)?;
    let sink = match sess.config.log_sinks.get(&name) {
      Some(sink) => sink.clone(),
      // Unconfigured endpoints land in the host log.
      None => Arc::new(|endpoint: &str, line: &[u8]| {
        log::info!(
          "[guest log {endpoint}] {}",
          String::from_utf8_lossy(line)
        );
      }),
    };
    let handle = sess.loggers.insert(Logger { name, sink });
    mem.write_u32(endpoint_handle_out, handle)?;
    Ok(())
  }

  fn write(caller, endpoint_handle: u32, msg_ptr: u32, msg_len: u32, nwritten_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let message = mem.copy_from_guest(msg_ptr, msg_len)?;
    let logger =
      sess.loggers.get(endpoint_handle).ok_or(FastlyStatus::BADF)?;
    (logger.sink)(&logger.name, &message);
    mem.write_u32(nwritten_out, message.len() as u32)?;
    Ok(())
  }
}
