//! Payload image validation.
//!
//! Mirrors the checks a kernel must pass before we commit any memory to
//! it: magic bytes, identification version, 64-bit class and the machine
//! type this stub was built for. Validation never reads past the length
//! it was given and never mutates anything.

use super::{
    ElfHeader, EI_CLASS, EI_NIDENT, EI_VERSION, ELFCLASS64, ELFMAG, EV_CURRENT, PAYLOAD_MACHINE,
};
use crate::error::{BootError, Result};
use crate::span::ByteSpan;

/// Verify the ELF identification block.
fn verify_ident(payload: &ByteSpan<'_>) -> bool {
    if payload.len() < EI_NIDENT {
        return false;
    }

    for (i, &expected) in ELFMAG.iter().enumerate() {
        match payload.read_u8(i as u64) {
            Ok(byte) if byte == expected => {}
            _ => {
                log::error!("ELF magic number mismatch");
                return false;
            }
        }
    }

    match payload.read_u8(EI_VERSION) {
        Ok(EV_CURRENT) => {}
        Ok(version) => {
            log::error!(
                "ELF version mismatch, expected EV_CURRENT({}), got {}",
                EV_CURRENT,
                version
            );
            return false;
        }
        Err(_) => return false,
    }

    match payload.read_u8(EI_CLASS) {
        Ok(ELFCLASS64) => {}
        Ok(class) => {
            log::error!(
                "ELF class mismatch, expected ELFCLASS64({}), got {}",
                ELFCLASS64,
                class
            );
            return false;
        }
        Err(_) => return false,
    }

    true
}

/// Whether the blob is a well-formed ELF64 image for this architecture.
pub fn check(payload: &ByteSpan<'_>) -> bool {
    if !verify_ident(payload) {
        return false;
    }

    match payload.read_u16(18) {
        Ok(machine) if machine == PAYLOAD_MACHINE => true,
        Ok(machine) => {
            log::error!(
                "ELF machine mismatch, expected {}, got {}",
                PAYLOAD_MACHINE,
                machine
            );
            false
        }
        Err(_) => false,
    }
}

/// Validate the identification block and decode the file header.
pub fn header(payload: &ByteSpan<'_>) -> Result<ElfHeader> {
    if !verify_ident(payload) {
        return Err(BootError::BadImage("invalid ELF identification"));
    }
    ElfHeader::parse(payload)
}
