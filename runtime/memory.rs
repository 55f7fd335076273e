// Copyright 2018-2026 the Deno authors. MIT license.

//! Bounds-checked little-endian views over guest linear memory.
//!
//! A view borrows the memory for at most one hostcall: the guest may
//! grow its memory between calls, so the underlying slice is re-obtained
//! from the caller on every entry and never cached.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guest memory access out of bounds")]
pub struct OutOfBounds;

pub struct GuestMemory<'a> {
  data: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
  pub fn new(data: &'a mut [u8]) -> Self {
    Self { data }
  }

  fn range(&self, ptr: u32, len: u32) -> Result<std::ops::Range<usize>, OutOfBounds> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or(OutOfBounds)?;
    if end > self.data.len() {
      return Err(OutOfBounds);
    }
    Ok(start..end)
  }

  pub fn slice(&self, ptr: u32, len: u32) -> Result<&[u8], OutOfBounds> {
    let range = self.range(ptr, len)?;
    Ok(&self.data[range])
  }

  pub fn copy_from_guest(&self, ptr: u32, len: u32) -> Result<Vec<u8>, OutOfBounds> {
    Ok(self.slice(ptr, len)?.to_vec())
  }

  pub fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), OutOfBounds> {
    let range = self.range(ptr, bytes.len() as u32)?;
    self.data[range].copy_from_slice(bytes);
    Ok(())
  }

  pub fn read_u8(&self, ptr: u32) -> Result<u8, OutOfBounds> {
    Ok(self.slice(ptr, 1)?[0])
  }

  pub fn write_u8(&mut self, ptr: u32, value: u8) -> Result<(), OutOfBounds> {
    self.write(ptr, &[value])
  }

  pub fn read_u16(&self, ptr: u32) -> Result<u16, OutOfBounds> {
    let bytes = self.slice(ptr, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
  }

  pub fn write_u16(&mut self, ptr: u32, value: u16) -> Result<(), OutOfBounds> {
    self.write(ptr, &value.to_le_bytes())
  }

  pub fn read_u32(&self, ptr: u32) -> Result<u32, OutOfBounds> {
    let bytes = self.slice(ptr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
  }

  pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), OutOfBounds> {
    self.write(ptr, &value.to_le_bytes())
  }

  pub fn read_u64(&self, ptr: u32) -> Result<u64, OutOfBounds> {
    let bytes = self.slice(ptr, 8)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(out))
  }

  pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), OutOfBounds> {
    self.write(ptr, &value.to_le_bytes())
  }

  pub fn read_i32(&self, ptr: u32) -> Result<i32, OutOfBounds> {
    Ok(self.read_u32(ptr)? as i32)
  }

  pub fn write_i32(&mut self, ptr: u32, value: i32) -> Result<(), OutOfBounds> {
    self.write_u32(ptr, value as u32)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn little_endian_round_trips() {
    let mut backing = vec![0u8; 16];
    let mut mem = GuestMemory::new(&mut backing);
    mem.write_u32(0, 0xAABBCCDD).unwrap();
    assert_eq!(mem.read_u8(0).unwrap(), 0xDD);
    assert_eq!(mem.read_u32(0).unwrap(), 0xAABBCCDD);
    mem.write_u64(8, u64::MAX - 1).unwrap();
    assert_eq!(mem.read_u64(8).unwrap(), u64::MAX - 1);
  }

  #[test]
  fn out_of_bounds_is_rejected() {
    let mut backing = vec![0u8; 8];
    let mut mem = GuestMemory::new(&mut backing);
    assert_eq!(mem.read_u32(5), Err(OutOfBounds));
    assert_eq!(mem.read_u32(u32::MAX), Err(OutOfBounds));
    assert_eq!(mem.write(7, &[1, 2]), Err(OutOfBounds));
    assert_eq!(mem.slice(u32::MAX, 2), Err(OutOfBounds));
    // the very end of memory is still addressable
    mem.write(6, &[1, 2]).unwrap();
    assert_eq!(mem.slice(6, 2).unwrap(), &[1, 2]);
  }
}
