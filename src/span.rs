//! Bounds-checked access to the raw payload bytes.
//!
//! Every field of the ELF header and program header table is read through
//! [`ByteSpan`], which rejects any access that would fall outside the
//! payload range. Offsets are computed with checked arithmetic so a
//! corrupted header cannot wrap a read back into range.

use crate::error::{BootError, Result};

/// A read-only view over a contiguous byte range.
#[derive(Clone, Copy)]
pub struct ByteSpan<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteSpan<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Build a span over firmware-provided memory.
    ///
    /// # Safety
    ///
    /// `addr..addr+size` must be mapped, readable and unmodified for the
    /// lifetime of the span.
    pub unsafe fn from_raw(addr: u64, size: u64) -> Self {
        Self {
            bytes: core::slice::from_raw_parts(addr as *const u8, size as usize),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow `len` bytes starting at `offset`, or fail if the range is not
    /// fully inside the span.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&'a [u8]> {
        let end = offset.checked_add(len).ok_or(BootError::OutOfBounds)?;
        if end > self.len() {
            return Err(BootError::OutOfBounds);
        }
        Ok(&self.bytes[offset as usize..end as usize])
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let b = self.slice(offset, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_within_bounds() {
        let data = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let span = ByteSpan::new(&data);
        assert_eq!(span.read_u8(0).unwrap(), 0x01);
        assert_eq!(span.read_u16(0).unwrap(), 0x0201);
        assert_eq!(span.read_u32(2).unwrap(), 0x06050403);
        assert_eq!(span.read_u64(0).unwrap(), 0x0807060504030201);
    }

    #[test]
    fn test_exact_end_is_accepted() {
        let data = [0u8; 8];
        let span = ByteSpan::new(&data);
        assert!(span.read_u64(0).is_ok());
        assert!(span.slice(8, 0).is_ok());
    }

    #[test]
    fn test_one_past_end_is_rejected() {
        let data = [0u8; 8];
        let span = ByteSpan::new(&data);
        assert_eq!(span.read_u8(8), Err(BootError::OutOfBounds));
        assert_eq!(span.read_u64(1), Err(BootError::OutOfBounds));
        assert_eq!(span.slice(9, 0), Err(BootError::OutOfBounds));
    }

    #[test]
    fn test_offset_overflow_is_rejected() {
        let data = [0u8; 8];
        let span = ByteSpan::new(&data);
        assert_eq!(span.slice(u64::MAX, 2), Err(BootError::OutOfBounds));
        assert_eq!(span.read_u32(u64::MAX - 1), Err(BootError::OutOfBounds));
    }
}
