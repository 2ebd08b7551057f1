//! ELF64 payload parsing and loading.
//!
//! Only the subset needed to boot a statically linked kernel is
//! implemented: identification, program header table traversal and
//! PT_LOAD segment placement. No relocation, no dynamic linking, no
//! symbol resolution.

pub mod image;
pub mod layout;
pub mod loader;
pub mod phdrs;

use bitflags::bitflags;

use crate::error::Result;
use crate::span::ByteSpan;

/// Size of the ELF identification block
pub const EI_NIDENT: u64 = 16;
/// ELF magic bytes
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// Index of the class byte in e_ident
pub const EI_CLASS: u64 = 4;
/// Index of the version byte in e_ident
pub const EI_VERSION: u64 = 6;
/// 64-bit object class
pub const ELFCLASS64: u8 = 2;
/// The single supported identification version
pub const EV_CURRENT: u8 = 1;

/// RISC-V machine type
pub const EM_RISCV: u16 = 243;
/// x86-64 machine type
pub const EM_X86_64: u16 = 62;

/// Loadable segment type
pub const PT_LOAD: u32 = 1;
/// Sentinel meaning the real program header count lives in shdr[0].sh_info
pub const PN_XNUM: u16 = 0xffff;

/// Size of an Elf64_Ehdr
pub const EHDR_SIZE: u64 = 64;
/// Size of an Elf64_Phdr; e_phentsize must match exactly
pub const PHDR_SIZE: u64 = 56;
/// Size of an Elf64_Shdr
pub const SHDR_SIZE: u64 = 64;

/// The one machine type this build of the stub will boot.
#[cfg(target_arch = "riscv64")]
pub const PAYLOAD_MACHINE: u16 = EM_RISCV;
#[cfg(target_arch = "x86_64")]
pub const PAYLOAD_MACHINE: u16 = EM_X86_64;
#[cfg(not(any(target_arch = "riscv64", target_arch = "x86_64")))]
compile_error!("no payload machine type is defined for this target architecture");

bitflags! {
    /// Program header p_flags bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC  = 1;
        const WRITE = 2;
        const READ  = 4;
    }
}

/// Decoded ELF file header. Fields we never consult are not carried.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Decode the fixed-size header fields. The identification block must
    /// already have been verified.
    pub fn parse(payload: &ByteSpan<'_>) -> Result<Self> {
        Ok(Self {
            machine: payload.read_u16(18)?,
            entry: payload.read_u64(24)?,
            phoff: payload.read_u64(32)?,
            shoff: payload.read_u64(40)?,
            phentsize: payload.read_u16(54)?,
            phnum: payload.read_u16(56)?,
        })
    }
}

/// One decoded program header entry.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    /// Decode the entry starting at `offset` within the payload.
    pub fn parse(payload: &ByteSpan<'_>, offset: u64) -> Result<Self> {
        Ok(Self {
            p_type: payload.read_u32(offset)?,
            flags: SegmentFlags::from_bits_retain(payload.read_u32(offset + 4)?),
            offset: payload.read_u64(offset + 8)?,
            vaddr: payload.read_u64(offset + 16)?,
            paddr: payload.read_u64(offset + 24)?,
            filesz: payload.read_u64(offset + 32)?,
            memsz: payload.read_u64(offset + 40)?,
            align: payload.read_u64(offset + 48)?,
        })
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}
