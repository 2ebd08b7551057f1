//! Final handoff: boot hart resolution, device tree lookup and the jump
//! into the loaded kernel.
//!
//! The hart id and device tree address are resolved while boot services
//! are still up; once they are gone the only thing left to do is set up
//! registers and jump.

use uefi::proto::unsafe_protocol;
use uefi::{boot, guid, system, Guid, Status};

use crate::error::{BootError, Result};

/// Configuration table GUID under which firmware publishes the flattened
/// device tree.
pub const DEVICE_TREE_TABLE_GUID: Guid = guid!("b1b621d5-f19c-41a5-830b-d9152c69aae0");

/// RISCV_EFI_BOOT_PROTOCOL from the RISC-V UEFI protocol spec. Only
/// `get_boot_hart_id` is ever called.
#[repr(C)]
#[unsafe_protocol("ccd15fec-6f73-4eec-8395-3e69e4b940bf")]
pub struct RiscvBootProtocol {
    revision: u64,
    get_boot_hart_id:
        unsafe extern "efiapi" fn(this: *mut RiscvBootProtocol, boot_hart_id: *mut usize) -> Status,
}

/// Address of the firmware-provided device tree blob, from the system
/// configuration table.
pub fn device_tree_addr() -> Result<u64> {
    system::with_config_table(|entries| {
        entries
            .iter()
            .find(|entry| entry.guid == DEVICE_TREE_TABLE_GUID)
            .map(|entry| entry.address as u64)
    })
    .ok_or(BootError::ProtocolUnavailable("device tree table"))
}

fn hart_id_from_protocol() -> Result<usize> {
    let handle = boot::get_handle_for_protocol::<RiscvBootProtocol>()
        .map_err(|_| BootError::ProtocolUnavailable("riscv boot protocol"))?;
    let protocol = boot::open_protocol_exclusive::<RiscvBootProtocol>(handle)
        .map_err(|_| BootError::ProtocolUnavailable("riscv boot protocol"))?;

    let mut id: usize = 0;
    let this = &*protocol as *const RiscvBootProtocol as *mut RiscvBootProtocol;
    let status = unsafe { (protocol.get_boot_hart_id)(this, &mut id) };
    if status.is_success() {
        Ok(id)
    } else {
        Err(BootError::ProtocolUnavailable("riscv boot protocol"))
    }
}

/// Decode a `boot-hartid` property value. Firmwares emit either a single
/// cell or a u64, both big endian.
fn decode_hart_id(value: &[u8]) -> Result<usize> {
    match value.len() {
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(value);
            Ok(u32::from_be_bytes(raw) as usize)
        }
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(value);
            Ok(u64::from_be_bytes(raw) as usize)
        }
        _ => Err(BootError::HartIdUnavailable),
    }
}

fn hart_id_from_fdt(fdt_addr: u64) -> Result<usize> {
    let fdt = unsafe { fdt::Fdt::from_ptr(fdt_addr as *const u8) }
        .map_err(|_| BootError::HartIdUnavailable)?;
    let chosen = fdt
        .find_node("/chosen")
        .ok_or(BootError::HartIdUnavailable)?;
    let property = chosen
        .property("boot-hartid")
        .ok_or(BootError::HartIdUnavailable)?;
    decode_hart_id(property.value)
}

/// Resolve the id of the hart the firmware booted on.
///
/// The RISC-V boot protocol is authoritative; the `/chosen` node's
/// `boot-hartid` property covers firmware predating the protocol. With
/// neither source the boot fails rather than guessing hart 0.
pub fn boot_hart_id(fdt_addr: u64) -> Result<usize> {
    match hart_id_from_protocol() {
        Ok(id) => {
            log::info!("boot hart id from firmware protocol: {}", id);
            return Ok(id);
        }
        Err(_) => log::debug!("riscv boot protocol absent, falling back to device tree"),
    }

    let id = hart_id_from_fdt(fdt_addr).map_err(|err| {
        log::error!("no boot hart id in firmware protocol or /chosen node");
        err
    })?;
    log::info!("boot hart id from device tree: {}", id);
    Ok(id)
}

/// Jump to the kernel entry point.
///
/// # Safety
///
/// Boot services must have been exited and `entry` must point at the
/// loaded kernel's entry instruction. Never returns; the kernel owns the
/// machine from here.
#[cfg(target_arch = "riscv64")]
pub unsafe fn enter_kernel(entry: u64, hart_id: usize, fdt_addr: u64) -> ! {
    // Linux boot protocol: bare physical addressing, interrupts masked,
    // a0 = hartid, a1 = device tree.
    core::arch::asm!(
        "csrci sstatus, 2",
        "csrw satp, zero",
        "jr {entry}",
        entry = in(reg) entry,
        in("a0") hart_id,
        in("a1") fdt_addr,
        options(noreturn),
    )
}
