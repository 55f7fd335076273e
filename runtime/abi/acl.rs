// Copyright 2018-2026 the Deno authors. MIT license.

//! `fastly_acl`.
//!
//! ACL detail codes written to `acl_error_out`: 1 = ok (match found),
//! 2 = no content (no entry matched).

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use crate::abi::hostcalls;
use crate::body::Body;
use crate::error::FastlyStatus;
use crate::handles::INVALID_HANDLE;

const ACL_OK: u32 = 1;
const ACL_NO_CONTENT: u32 = 2;

hostcalls! {
  fn open(caller, name_ptr: u32, name_len: u32, acl_handle_out: u32) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let name = mem.copy_from_guest(name_ptr, name_len)?;
    let name =
      String::from_utf8(name).map_err(|_| FastlyStatus::INVAL)?;
    let acl = sess
      .config
      .acls
      .get(&name)
      .cloned()
      .ok_or(FastlyStatus::INVAL)?;
    let handle = sess.acls.insert(acl);
    mem.write_u32(acl_handle_out, handle)?;
    Ok(())
  }

  fn lookup(
    caller,
    acl_handle: u32,
    ip_ptr: u32,
    ip_len: u32,
    body_handle_out: u32,
    acl_error_out: u32,
  ) {
    let (mut mem, sess) = crate::abi::ctx(&mut caller)?;
    let acl = sess.acls.get(acl_handle).ok_or(FastlyStatus::BADF)?.clone();
    let octets = mem.copy_from_guest(ip_ptr, ip_len)?;
    let ip: IpAddr = match octets.len() {
      4 => {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&octets);
        Ipv4Addr::from(bytes).into()
      }
      16 => {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&octets);
        Ipv6Addr::from(bytes).into()
      }
      _ => return Err(FastlyStatus::INVAL),
    };
    match acl.lookup(ip) {
      Some(entry) => {
        let json = serde_json::to_vec(entry)
          .map_err(|_| FastlyStatus::ERROR)?;
        let body = sess.insert_body(Body::received(json));
        mem.write_u32(body_handle_out, body)?;
        mem.write_u32(acl_error_out, ACL_OK)?;
      }
      None => {
        mem.write_u32(body_handle_out, INVALID_HANDLE)?;
        mem.write_u32(acl_error_out, ACL_NO_CONTENT)?;
      }
    }
    Ok(())
  }
}
