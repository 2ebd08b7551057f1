//! Embedded payload discovery and lifecycle.
//!
//! The kernel image is linked into the stub as a binary blob delimited
//! by the `_binary_payload_start` / `_binary_payload_end` symbols that
//! objcopy emits. Discovery records where the blob sits; the loader
//! records where the image ended up; handoff only reads.

use core::ffi::c_void;

use uefi::{guid, Guid};

use crate::elf::image;
use crate::error::{BootError, Result};
use crate::span::ByteSpan;

/// One boot candidate through its lifecycle. Exactly one instance exists
/// per boot attempt: discovery fills the payload fields, the loader the
/// loaded fields, and nothing mutates it after handoff begins.
#[derive(Debug, Clone, Copy)]
pub struct PayloadInfo {
    /// Where the raw embedded image starts
    pub payload_addr: u64,
    /// Raw embedded image size in bytes
    pub payload_size: u64,
    /// Physical base of the load allocation
    pub loaded_paddr: u64,
    /// Size of the load allocation
    pub loaded_size: u64,
    /// Absolute physical entry address
    pub kernel_entry: u64,
}

impl PayloadInfo {
    fn new(payload_addr: u64, payload_size: u64) -> Self {
        Self {
            payload_addr,
            payload_size,
            loaded_paddr: 0,
            loaded_size: 0,
            kernel_entry: 0,
        }
    }
}

/// Configuration table record advertising the loaded image to the
/// kernel, installed under [`PAYLOAD_TABLE_GUID`].
#[repr(C)]
pub struct PayloadTable {
    pub loaded_addr: u64,
    pub size: u64,
}

/// GUID of the stub's payload configuration table.
pub const PAYLOAD_TABLE_GUID: Guid = guid!("c1b9d5a2-1f46-4d34-a923-48a3c1f1e9b0");

#[cfg(target_arch = "riscv64")]
extern "C" {
    static _binary_payload_start: u8;
    static _binary_payload_end: u8;
}

fn payload_bounds() -> (u64, u64) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        (
            &_binary_payload_start as *const u8 as u64,
            &_binary_payload_end as *const u8 as u64,
        )
    }
    #[cfg(not(target_arch = "riscv64"))]
    (0, 0)
}

/// Validate the raw symbol range before any byte of it is read.
fn candidate(start: u64, end: u64) -> Result<(u64, u64)> {
    let size = end.wrapping_sub(start);
    if start == 0 || end <= start + 4 || size == 0 {
        return Err(BootError::PayloadNotFound);
    }
    Ok((start, size))
}

/// Locate and verify the embedded kernel payload.
pub fn find_payload() -> Result<PayloadInfo> {
    let (start, end) = payload_bounds();
    log::info!("payload_addr: {:#x}", start);
    log::info!("payload_end: {:#x}", end);

    let (addr, size) = candidate(start, end).map_err(|err| {
        log::error!(
            "payload not found: was an ELF payload linked into the stub image?"
        );
        err
    })?;

    log::info!("checking payload's ELF header...");
    let span = unsafe { ByteSpan::from_raw(addr, size) };
    if !image::check(&span) {
        return Err(BootError::PayloadNotFound);
    }

    log::info!("found payload ELF header, size {:#x}", size);
    Ok(PayloadInfo::new(addr, size))
}

/// Advertise the loaded image through the configuration table so the
/// kernel can find its own load address and size.
pub fn install_payload_table(info: &PayloadInfo) -> Result<()> {
    let table = uefi::boot::allocate_pool(
        uefi::boot::MemoryType::LOADER_DATA,
        core::mem::size_of::<PayloadTable>(),
    )
    .map_err(|_| BootError::OutOfResources)?
    .cast::<PayloadTable>();

    unsafe {
        table.as_ptr().write(PayloadTable {
            loaded_addr: info.loaded_paddr,
            size: info.loaded_size,
        });
        uefi::boot::install_configuration_table(
            &PAYLOAD_TABLE_GUID,
            table.as_ptr() as *const c_void,
        )?;
    }
    Ok(())
}
