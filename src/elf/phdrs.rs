//! Program header table resolution.
//!
//! Locates the table described by the file header, handling the PN_XNUM
//! overflow encoding where the real entry count is stored in the first
//! section header. The bounds check against the payload length is the
//! primary defense against truncated or corrupted images.

use super::{ElfHeader, ProgramHeader, PHDR_SIZE, PN_XNUM, SHDR_SIZE};
use crate::error::{BootError, Result};
use crate::span::ByteSpan;

/// A validated program header table. Entries are decoded on demand.
#[derive(Clone, Copy)]
pub struct PhdrTable<'a> {
    payload: ByteSpan<'a>,
    offset: u64,
    count: u32,
}

impl<'a> PhdrTable<'a> {
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Decode entry `index`. The table bounds were checked at resolution
    /// time, so any failure here indicates a logic error upstream.
    pub fn entry(&self, index: u32) -> Result<ProgramHeader> {
        if index >= self.count {
            return Err(BootError::OutOfBounds);
        }
        ProgramHeader::parse(&self.payload, self.offset + u64::from(index) * PHDR_SIZE)
    }

    /// Iterate all entries, stopping at the first decode failure.
    pub fn iter(&self) -> impl Iterator<Item = Result<ProgramHeader>> + 'a {
        let table = *self;
        (0..self.count).map(move |i| table.entry(i))
    }
}

/// Resolve the effective program header count, following the PN_XNUM
/// fallback into the first section header when necessary.
fn resolve_count(payload: &ByteSpan<'_>, header: &ElfHeader) -> Result<u32> {
    if header.phnum != PN_XNUM {
        return Ok(u32::from(header.phnum));
    }

    // Real count lives in shdr[0].sh_info.
    if header.shoff == 0 {
        log::error!("PN_XNUM set but image has no section header table");
        return Err(BootError::BadImage("no section header table"));
    }
    let shoff_end = header.shoff.checked_add(SHDR_SIZE).ok_or(BootError::OutOfBounds)?;
    if shoff_end > payload.len() {
        log::error!(
            "section header out of range: shoff={:#x}, payload size {:#x}",
            header.shoff,
            payload.len()
        );
        return Err(BootError::BadImage("section header out of range"));
    }

    let count = payload.read_u32(header.shoff + 44)?; // sh_info
    if count == 0 {
        log::error!("shdr[0].sh_info indicates no program header");
        return Err(BootError::BadImage("zero extended program header count"));
    }
    Ok(count)
}

/// Locate and validate the program header table.
pub fn resolve<'a>(payload: &ByteSpan<'a>, header: &ElfHeader) -> Result<PhdrTable<'a>> {
    if header.phnum == 0 {
        log::error!("image has no program header");
        return Err(BootError::BadImage("no program header"));
    }
    if u64::from(header.phentsize) != PHDR_SIZE {
        log::error!(
            "invalid program header entry size: {}, expected {}",
            header.phentsize,
            PHDR_SIZE
        );
        return Err(BootError::BadImage("bad program header entry size"));
    }

    let count = resolve_count(payload, header)?;

    let table_size = u64::from(count)
        .checked_mul(PHDR_SIZE)
        .ok_or(BootError::OutOfBounds)?;
    let table_end = header
        .phoff
        .checked_add(table_size)
        .ok_or(BootError::OutOfBounds)?;
    if table_end > payload.len() {
        log::error!(
            "program header table out of range: phoff={:#x} count={} payload size {:#x}",
            header.phoff,
            count,
            payload.len()
        );
        return Err(BootError::BadImage("program header table out of range"));
    }

    Ok(PhdrTable {
        payload: *payload,
        offset: header.phoff,
        count,
    })
}
