//! Memory attribute remapping through EFI_MEMORY_ATTRIBUTE_PROTOCOL.
//!
//! The kernel image is loaded as flat bytes with no section-level
//! granularity, so the whole region is made readable, writable and
//! executable rather than splitting code from data. Firmware without the
//! protocol simply leaves its default attributes in place; nothing here
//! is allowed to abort the boot.

use uefi::boot::{self, MemoryAttribute};
use uefi::proto::security::MemoryProtection;

/// Protection attributes that must be cleared for a region to be RWX.
const PROHIBITIVE: MemoryAttribute = MemoryAttribute::EXECUTE_PROTECT
    .union(MemoryAttribute::WRITE_PROTECT)
    .union(MemoryAttribute::READ_PROTECT);

/// The subset of `attrs` that blocks full access and needs clearing.
///
/// Clearing is idempotent: once the prohibitive bits are gone this
/// returns empty and a second pass changes nothing.
pub fn attributes_to_clear(attrs: MemoryAttribute) -> MemoryAttribute {
    attrs.intersection(PROHIBITIVE)
}

/// Make `base..base+size` fully accessible if the firmware manages
/// memory attributes. Best effort: absence of the protocol or a failed
/// call is logged and ignored.
pub fn remap_region_rwx(base: u64, size: u64) {
    let handle = match boot::get_handle_for_protocol::<MemoryProtection>() {
        Ok(handle) => handle,
        Err(_) => {
            log::debug!("memory attribute protocol not present, skipping remap");
            return;
        }
    };
    let protocol = match boot::open_protocol_exclusive::<MemoryProtection>(handle) {
        Ok(protocol) => protocol,
        Err(err) => {
            log::warn!("failed to open memory attribute protocol: {}", err);
            return;
        }
    };

    let region = base..base + size;
    let attrs = match protocol.get_memory_attributes(region.clone()) {
        Ok(attrs) => attrs,
        Err(err) => {
            log::warn!(
                "failed to retrieve memory attributes for {:#x}+{:#x}: {}",
                base,
                size,
                err
            );
            return;
        }
    };
    log::debug!("current attributes for {:#x}+{:#x}: {:?}", base, size, attrs);

    let to_clear = attributes_to_clear(attrs);
    if to_clear.is_empty() {
        return;
    }
    if let Err(err) = protocol.clear_memory_attributes(region, to_clear) {
        log::warn!("failed to remap region {:#x}+{:#x} rwx: {}", base, size, err);
    }
}
