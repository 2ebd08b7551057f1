//! Thin layer over the firmware boot services the stub depends on.
//!
//! Everything here is a narrow contract: aligned physical page
//! allocation, the raw memory map / ExitBootServices pair, and the
//! optional memory attribute protocol. The rest of the crate never
//! touches `uefi::boot` directly.

pub mod exit;
pub mod memattr;

use core::ptr::NonNull;

use uefi::boot::{self, AllocateType, MemoryType};

use crate::error::{BootError, Result};

/// EFI page size in bytes
pub const EFI_PAGE_SIZE: u64 = 4096;

/// A physical page range owned by the stub.
///
/// The range is released back to the firmware on drop unless ownership is
/// surrendered with [`PageRegion::leak`]. This replaces the classic
/// allocate-then-goto-cleanup shape: every early return in the loader
/// frees the allocation without any explicit cleanup code.
pub struct PageRegion {
    base: u64,
    pages: usize,
}

impl PageRegion {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.pages as u64 * EFI_PAGE_SIZE
    }

    /// View the region as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must be the only writer; the region is exclusively owned
    /// by the stub, so this holds until handoff.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base as *mut u8, self.size() as usize)
    }

    /// Surrender ownership; the pages are never freed afterwards.
    pub fn leak(self) -> u64 {
        let base = self.base;
        core::mem::forget(self);
        base
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        if let Some(ptr) = NonNull::new(self.base as *mut u8) {
            // Failure here leaves pages allocated until the kernel owns the
            // machine anyway; nothing useful to do beyond logging.
            if let Err(err) = unsafe { boot::free_pages(ptr, self.pages) } {
                log::warn!("failed to free {} pages at {:#x}: {}", self.pages, self.base, err);
            }
        }
    }
}

fn free_page_run(base: u64, pages: usize) {
    if pages == 0 {
        return;
    }
    if let Some(ptr) = NonNull::new(base as *mut u8) {
        if let Err(err) = unsafe { boot::free_pages(ptr, pages) } {
            log::warn!("failed to trim {} pages at {:#x}: {}", pages, base, err);
        }
    }
}

/// Allocate `size` bytes of physical memory aligned to `align`, entirely
/// below `max_addr`.
///
/// UEFI only guarantees 4 KiB alignment, so the request is padded by one
/// alignment granule and the misaligned head and tail runs are handed
/// back to the firmware.
pub fn allocate_pages_aligned(size: u64, align: u64, max_addr: u64) -> Result<PageRegion> {
    debug_assert!(align.is_power_of_two() && align >= EFI_PAGE_SIZE);

    let size = crate::elf::layout::align_up(size, EFI_PAGE_SIZE);
    let slack_pages = (align / EFI_PAGE_SIZE - 1) as usize;
    let pages = (size / EFI_PAGE_SIZE) as usize;

    let total = pages
        .checked_add(slack_pages)
        .ok_or(BootError::OutOfResources)?;
    let raw = boot::allocate_pages(
        AllocateType::MaxAddress(max_addr),
        MemoryType::LOADER_DATA,
        total,
    )
    .map_err(|err| {
        log::error!(
            "failed to allocate {:#x} bytes ({} pages, align {:#x}): {}",
            size,
            total,
            align,
            err
        );
        BootError::OutOfResources
    })?;

    let raw_base = raw.as_ptr() as u64;
    let aligned_base = crate::elf::layout::align_up(raw_base, align);

    let head_pages = ((aligned_base - raw_base) / EFI_PAGE_SIZE) as usize;
    let tail_pages = total - head_pages - pages;
    free_page_run(raw_base, head_pages);
    free_page_run(aligned_base + size, tail_pages);

    Ok(PageRegion {
        base: aligned_base,
        pages,
    })
}
