//! Physical memory layout planning for the loadable segments.
//!
//! One allocation covers every PT_LOAD segment. The allocation is made
//! at 2 MiB granularity, coarser than the 4 KiB EFI page, so the image
//! can be mapped with large pages and fragmentation of the firmware
//! allocator stays low.

use super::phdrs::PhdrTable;
use super::ProgramHeader;
use crate::error::{BootError, Result};

/// EFI page size; every segment alignment must be compatible with it.
pub const PAGE_SIZE: u64 = 4096;

/// Allocation granularity for the kernel image (2 MiB).
pub const KERNEL_MEM_ALIGN: u64 = 1 << 21;

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Footprint of the loadable segments in physical and virtual space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub min_paddr: u64,
    pub max_paddr: u64,
    pub min_vaddr: u64,
}

impl ImageLayout {
    /// Bytes to allocate: the physical extent rounded up to the
    /// allocation granularity.
    pub fn alloc_size(&self) -> u64 {
        align_up(self.max_paddr - self.min_paddr, KERNEL_MEM_ALIGN)
    }
}

/// Whether a segment's stated alignment can be honored on 4 KiB pages.
pub(super) fn page_compatible(align: u64) -> bool {
    align == 0 || align.is_power_of_two()
}

/// Scan the program headers and compute the image footprint.
///
/// Segments with zero memory size contribute nothing; an image without
/// any loadable bytes is rejected here rather than allocating nothing.
pub fn plan(table: &PhdrTable<'_>) -> Result<ImageLayout> {
    let mut min_paddr = u64::MAX;
    let mut max_paddr = 0u64;
    let mut min_vaddr = u64::MAX;

    for entry in table.iter() {
        let phdr: ProgramHeader = entry?;
        if !phdr.is_load() || phdr.memsz == 0 {
            continue;
        }

        if !page_compatible(phdr.align) {
            log::error!(
                "segment alignment {:#x} is not compatible with the {:#x} page size",
                phdr.align,
                PAGE_SIZE
            );
            return Err(BootError::UnalignedSegment);
        }

        let end = phdr
            .paddr
            .checked_add(phdr.memsz)
            .ok_or(BootError::BadImage("segment wraps physical address space"))?;

        min_paddr = min_paddr.min(phdr.paddr);
        min_vaddr = min_vaddr.min(phdr.vaddr);
        max_paddr = max_paddr.max(end);
    }

    if min_paddr == u64::MAX {
        log::error!("image has no loadable segment");
        return Err(BootError::BadImage("no loadable segment"));
    }

    if min_paddr & (KERNEL_MEM_ALIGN - 1) != 0 {
        log::error!(
            "min_paddr {:#x} is not aligned to the {:#x} allocation granularity",
            min_paddr,
            KERNEL_MEM_ALIGN
        );
        return Err(BootError::UnalignedSegment);
    }

    Ok(ImageLayout {
        min_paddr,
        max_paddr,
        min_vaddr,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{build_image, Segment};
    use super::super::{image, phdrs};
    use super::*;
    use crate::span::ByteSpan;
    use alloc::vec::Vec;

    fn plan_image(image_bytes: &[u8]) -> Result<ImageLayout> {
        let span = ByteSpan::new(image_bytes);
        let header = image::header(&span)?;
        let table = phdrs::resolve(&span, &header)?;
        plan(&table)
    }

    fn seg(paddr: u64, memsz: u64, align: u64) -> Segment {
        Segment {
            offset: 0x1000,
            vaddr: paddr,
            paddr,
            filesz: 0,
            memsz,
            align,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_footprint_and_granularity() {
        let image = build_image(
            0,
            &[
                seg(0x20_0000, 0x3000, 0x1000),
                seg(0x20_4000, 0x1000, 0x1000),
            ],
        );
        let layout = plan_image(&image).unwrap();
        assert_eq!(layout.min_paddr, 0x20_0000);
        assert_eq!(layout.max_paddr, 0x20_5000);
        // Size is the extent rounded up to 2 MiB and is always a multiple of it.
        assert_eq!(layout.alloc_size(), KERNEL_MEM_ALIGN);
        assert_eq!(layout.alloc_size() % KERNEL_MEM_ALIGN, 0);
    }

    #[test]
    fn test_multi_granule_extent() {
        let image = build_image(0, &[seg(0x20_0000, KERNEL_MEM_ALIGN + 1, 0x1000)]);
        let layout = plan_image(&image).unwrap();
        assert_eq!(layout.alloc_size(), 2 * KERNEL_MEM_ALIGN);
    }

    #[test]
    fn test_zero_memsz_segments_are_skipped() {
        let image = build_image(
            0,
            &[seg(0x40_0000, 0x1000, 0x1000), seg(0x999, 0, 0x1000)],
        );
        // The second segment has an unaligned paddr but zero memory size,
        // so it must not influence the layout.
        let layout = plan_image(&image).unwrap();
        assert_eq!(layout.min_paddr, 0x40_0000);
    }

    #[test]
    fn test_all_zero_memsz_is_rejected() {
        let image = build_image(0, &[seg(0x20_0000, 0, 0x1000)]);
        assert!(plan_image(&image).is_err());
    }

    #[test]
    fn test_non_power_of_two_alignment_is_rejected() {
        let image = build_image(0, &[seg(0x20_0000, 0x1000, 0x1800)]);
        assert_eq!(plan_image(&image), Err(BootError::UnalignedSegment));
    }

    #[test]
    fn test_unaligned_min_paddr_is_rejected() {
        let image = build_image(0, &[seg(0x20_1000, 0x1000, 0x1000)]);
        assert_eq!(plan_image(&image), Err(BootError::UnalignedSegment));
    }

    #[test]
    fn test_paddr_overflow_is_rejected() {
        let image = build_image(0, &[seg(0, 1, 0x1000), seg(0x20_0000, u64::MAX, 0x1000)]);
        assert!(plan_image(&image).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, KERNEL_MEM_ALIGN), 0);
        assert_eq!(align_up(1, KERNEL_MEM_ALIGN), KERNEL_MEM_ALIGN);
        assert_eq!(align_up(KERNEL_MEM_ALIGN, KERNEL_MEM_ALIGN), KERNEL_MEM_ALIGN);
    }
}
