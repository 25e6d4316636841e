//! The direct physical map: a single contiguous window mapping all of physical memory (padded
//! generously past the firmware-reported range) at a fixed virtual base, backed by 2 MiB pages.

use core::cmp;

use bootinfo::item::MemoryRange;
use log::debug;

use crate::arch::mm::{PHYS_MAP_BASE, PHYS_MAP_MAX_PAGES, PHYS_MAP_MIN_GIB, PHYS_MAP_ROUND_GIB};
use crate::arch::mmu::{kernel_pt_root, PAGE_SIZE};
use crate::mm::types::CacheMode;
use crate::sync::irq::IrqDisabled;

use super::pt::{MappingPointer, PageTable, PageTableAlloc, TranslatePhys};
use super::types::{PageTablePerms, PhysAddr, PhysFrameNum, VirtAddr, VirtPageNum};
use super::utils::{align_up, display_byte_size, is_usable};

const GIB: usize = 1 << 30;

/// Initializes the mapping of physical memory at `PHYS_MAP_BASE`.
///
/// The mapped window always covers at least [`PHYS_MAP_MIN_GIB`] GiB, rounded up to a multiple of
/// [`PHYS_MAP_ROUND_GIB`] GiB, even if `mem_map` reports less usable memory: this leaves room for
/// MMIO apertures and memory hotplugged above the highest frame the firmware enumerated.
///
/// # Safety
///
/// * This function must be called only once on the bootstrap processor
/// * `pt_alloc` must return physical frames usable as fresh page tables
/// * `pt_mapping` must return correct virtual page numbers for queried frames
pub unsafe fn init(
    mem_map: &[MemoryRange],
    pt_alloc: &mut impl PageTableAlloc,
    pt_mapping: impl TranslatePhys,
    _irq_disabled: &IrqDisabled,
) {
    // Safety: the function contract guarantees that `pt_mapping` can be used here
    let mut pt = unsafe { PageTable::new(kernel_pt_root(), pt_mapping, false) };

    let size_pages = physmap_size_pages(highest_usable_end(mem_map));
    assert!(
        size_pages <= PHYS_MAP_MAX_PAGES,
        "physical memory too large for the physmap window"
    );

    debug!(
        "mapping physmap: {} pages ({})",
        size_pages,
        display_byte_size(size_pages * PAGE_SIZE)
    );

    let mut pointer = MappingPointer::new(PHYS_MAP_BASE, size_pages);

    // Safety: our allocator is valid as per function contract, we know that interrupts are
    // disabled, and the function contract guarantees that no other cores are up yet.
    unsafe {
        pt.map(
            pt_alloc,
            &mut pointer,
            PhysFrameNum::new(0),
            PageTablePerms::WRITE,
            CacheMode::Cached,
        )
        .expect("failed to map physmap region");
    }
}

fn highest_usable_end(mem_map: &[MemoryRange]) -> PhysFrameNum {
    mem_map
        .iter()
        .filter(|range| is_usable(range.kind))
        .map(|range| PhysFrameNum::new(range.start_page + range.page_count))
        .max()
        .unwrap_or(PhysFrameNum::new(0))
}

fn physmap_size_pages(highest: PhysFrameNum) -> usize {
    let gib_pages = GIB / PAGE_SIZE;
    let min_pages = PHYS_MAP_MIN_GIB * gib_pages;
    let round_pages = PHYS_MAP_ROUND_GIB * gib_pages;

    align_up(cmp::max(highest.as_usize(), min_pages), round_pages)
}

pub fn paddr_to_physmap(paddr: PhysAddr) -> VirtAddr {
    paddr.to_virt(pfn_to_physmap)
}

pub fn pfn_to_physmap(pfn: PhysFrameNum) -> VirtPageNum {
    PHYS_MAP_BASE + pfn.as_usize()
}

pub fn physmap_to_pfn(vpn: VirtPageNum) -> PhysFrameNum {
    assert!((PHYS_MAP_BASE..PHYS_MAP_BASE + PHYS_MAP_MAX_PAGES).contains(&vpn));
    PhysFrameNum::new(vpn - PHYS_MAP_BASE)
}

pub struct PhysmapPfnTranslator;

impl TranslatePhys for PhysmapPfnTranslator {
    fn translate(&self, phys: PhysFrameNum) -> VirtPageNum {
        pfn_to_physmap(phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_padded_and_rounded() {
        assert_eq!(physmap_size_pages(PhysFrameNum::new(0)), PHYS_MAP_MIN_GIB * (GIB / PAGE_SIZE));

        let one_and_a_half_gib = PhysFrameNum::new(3 * GIB / PAGE_SIZE / 2);
        let size = physmap_size_pages(one_and_a_half_gib);
        assert_eq!(size % (PHYS_MAP_ROUND_GIB * GIB / PAGE_SIZE), 0);
        assert!(size * PAGE_SIZE >= one_and_a_half_gib.as_usize() * PAGE_SIZE);
    }
}
