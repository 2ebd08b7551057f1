//! Segment loading into the planned allocation.
//!
//! The whole allocation is zeroed before any segment bytes are copied;
//! the gap between a segment's file size and memory size (bss) is
//! covered by that zero-fill and is never written again. The bounds and
//! alignment checks repeat what the planner already verified: this is
//! the last chance to reject a bad image before memory is committed.

use super::layout::{self, ImageLayout};
use super::phdrs::PhdrTable;
use super::{image, phdrs};
use crate::error::{BootError, Result};
use crate::firmware;
use crate::payload::PayloadInfo;
use crate::span::ByteSpan;

/// Where the kernel ended up in physical memory.
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
    pub base: u64,
    pub size: u64,
    pub min_paddr: u64,
    pub min_vaddr: u64,
}

/// Copy every loadable segment's file bytes into `dest`.
///
/// `dest` must already be zeroed and cover the planned extent starting at
/// `min_paddr`.
fn copy_segments(
    dest: &mut [u8],
    payload: &ByteSpan<'_>,
    table: &PhdrTable<'_>,
    min_paddr: u64,
) -> Result<()> {
    for entry in table.iter() {
        let phdr = entry?;
        if !phdr.is_load() {
            continue;
        }

        if !layout::page_compatible(phdr.align) {
            log::error!("segment alignment {:#x} rejected during load", phdr.align);
            return Err(BootError::UnalignedSegment);
        }
        if phdr.memsz < phdr.filesz {
            log::error!(
                "segment memory size {:#x} smaller than file size {:#x}",
                phdr.memsz,
                phdr.filesz
            );
            return Err(BootError::BadImage("segment memory size below file size"));
        }
        if phdr.memsz == 0 {
            continue;
        }

        let src = payload.slice(phdr.offset, phdr.filesz).map_err(|_| {
            log::error!(
                "segment file range {:#x}+{:#x} exceeds payload size {:#x}",
                phdr.offset,
                phdr.filesz,
                payload.len()
            );
            BootError::BadImage("segment file range out of bounds")
        })?;

        let start = (phdr.paddr - min_paddr) as usize;
        dest[start..start + src.len()].copy_from_slice(src);
    }
    Ok(())
}

/// Allocate the planned region, zero it and populate it from the payload.
///
/// The allocation is released on every error path; ownership is
/// surrendered only once the copy pass has fully succeeded.
pub fn load(
    payload: &ByteSpan<'_>,
    table: &PhdrTable<'_>,
    plan: &ImageLayout,
) -> Result<LoadedKernel> {
    let size = plan.alloc_size();
    let mut region =
        firmware::allocate_pages_aligned(size, layout::KERNEL_MEM_ALIGN, u64::MAX)?;
    log::info!(
        "allocated kernel memory: paddr={:#x}, size={:#x} bytes",
        region.base(),
        region.size()
    );

    // Zero first, copy second. Bss correctness depends on this order.
    let dest = unsafe { region.as_mut_slice() };
    dest.fill(0);
    copy_segments(dest, payload, table, plan.min_paddr)?;

    let size = region.size();
    let base = region.leak();
    Ok(LoadedKernel {
        base,
        size,
        min_paddr: plan.min_paddr,
        min_vaddr: plan.min_vaddr,
    })
}

/// Translate the file's entry point into the loaded image.
///
/// The entry is relative to the virtual base of the loadable segments;
/// an entry below that base cannot point into the image.
fn translate_entry(entry: u64, min_vaddr: u64, base: u64) -> Result<u64> {
    let delta = entry
        .checked_sub(min_vaddr)
        .ok_or(BootError::BadImage("entry below loadable segments"))?;
    Ok(base + delta)
}

/// Run the full load pipeline over a discovered payload.
///
/// Fills in the load address, load size and translated entry point, and
/// remaps the loaded region so it is executable where the firmware
/// enforces W^X defaults.
pub fn load_payload(info: &mut PayloadInfo) -> Result<()> {
    let payload = unsafe { ByteSpan::from_raw(info.payload_addr, info.payload_size) };

    let header = image::header(&payload)?;
    let table = phdrs::resolve(&payload, &header)?;
    log::debug!("program headers: {}", table.count());

    let plan = layout::plan(&table)?;
    let kernel = load(&payload, &table, &plan)?;

    info.loaded_paddr = kernel.base;
    info.loaded_size = kernel.size;
    info.kernel_entry = translate_entry(header.entry, kernel.min_vaddr, kernel.base)?;

    log::info!("loaded_paddr: {:#x}", info.loaded_paddr);
    log::info!("loaded_size: {:#x}", info.loaded_size);
    log::info!("kernel_entry: {:#x}", info.kernel_entry);

    firmware::memattr::remap_region_rwx(kernel.base, kernel.size);

    Ok(())
}
