//! Steady-state physical frame allocator.
//!
//! Before this module is initialized, page-table and other early allocations are served directly
//! out of a [`super::early::BootHeap`] (an infallible bump allocator over an uninitialized physical
//! range). Once [`init`] runs, this bitmap-backed allocator takes over and becomes fallible: it can
//! report [`Error::OUT_OF_MEMORY`] instead of panicking.

use core::ops::Range;
use core::slice;

use arrayvec::ArrayVec;
use bitmap::BorrowedBitmapMut;
use bootinfo::item::MemoryRange;
use log::debug;

use crate::arch::mmu::PAGE_SIZE;
use crate::err::{Error, Result};
use crate::sync::spinlock::SpinLock;

use super::early::BootHeap;
use super::physmap::pfn_to_physmap;
use super::types::PhysFrameNum;
use super::utils::{display_byte_size, iter_usable_ranges};

/// An allocator of physical page frames. Implemented by the steady-state allocator in this module;
/// consumers that need page tables before this module is initialized instead use
/// [`BootHeap`](super::early::BootHeap) through the [`super::pt::PageTableAlloc`] trait.
pub trait FrameAllocator {
    /// Allocates a single zeroed 4 KiB frame.
    fn alloc_zeroed_4k(&mut self) -> Result<PhysFrameNum>;

    /// Returns `frame` to the allocator. The frame must have been returned by a prior successful
    /// call to `alloc_zeroed_4k` on the same allocator and must not still be in use.
    fn free_4k(&mut self, frame: PhysFrameNum);
}

struct State {
    bitmap: BorrowedBitmapMut<'static>,
    frame_count: usize,
    free_count: usize,
    next_hint: usize,
}

static PMM: SpinLock<Option<State>> = SpinLock::new(None);

/// Initializes the frame allocator, taking over physical memory management from `bootheap`.
///
/// # Safety
///
/// * Must be called only once, after the physmap has been initialized
/// * `reserved_ranges` must cover every physical range still in use (kernel image, bootinfo,
///   everything allocated out of `bootheap` so far), sorted by start
pub unsafe fn init(
    mem_map: &[MemoryRange],
    reserved_ranges: &[Range<PhysFrameNum>],
    mut bootheap: BootHeap,
) {
    let frame_count = mem_map
        .iter()
        .map(|range| range.start_page + range.page_count)
        .max()
        .unwrap_or(0);

    let bitmap_bytes = bitmap::bytes_required(frame_count);
    let bitmap_phys = bootheap.alloc_phys(core::alloc::Layout::array::<u8>(bitmap_bytes).unwrap());

    // Safety: the bootheap just handed us exclusive ownership of this range, and the physmap
    // (initialized by the caller's contract) covers it.
    let bitmap_bytes_slice = unsafe {
        slice::from_raw_parts_mut(
            pfn_to_physmap(bitmap_phys.containing_frame())
                .addr()
                .as_mut_ptr::<u8>(),
            bitmap_bytes,
        )
    };
    bitmap_bytes_slice.fill(0xff);
    let mut bitmap = BorrowedBitmapMut::new(bitmap_bytes_slice);

    let bootheap_used = bootheap.used_range();
    let mut reserved: ArrayVec<Range<PhysFrameNum>, 8> = ArrayVec::new();
    reserved.extend(reserved_ranges.iter().cloned());
    reserved.push(bootheap_used.start.containing_frame()..bootheap_used.end.containing_tail_frame());
    reserved.sort_unstable_by_key(|range| range.start);

    let mut free_count = 0;
    iter_usable_ranges(mem_map, &reserved, |start, end| {
        for pfn in start.as_usize()..end.as_usize() {
            bitmap.unset(pfn);
        }
        free_count += end - start;
    });

    debug!(
        "pmm: {} frames free of {} ({})",
        free_count,
        frame_count,
        display_byte_size(free_count * PAGE_SIZE)
    );

    *PMM.lock() = Some(State {
        bitmap,
        frame_count,
        free_count,
        next_hint: 0,
    });
}

/// The global steady-state frame allocator handle.
pub struct Pmm;

impl FrameAllocator for Pmm {
    fn alloc_zeroed_4k(&mut self) -> Result<PhysFrameNum> {
        alloc_zeroed_4k()
    }

    fn free_4k(&mut self, frame: PhysFrameNum) {
        free_4k(frame)
    }
}

/// Allocates a single zeroed 4 KiB frame from the global allocator.
pub fn alloc_zeroed_4k() -> Result<PhysFrameNum> {
    let mut guard = PMM.lock();
    let state = guard.as_mut().expect("pmm used before init");

    let index = state
        .bitmap
        .first_zero(state.frame_count)
        .ok_or(Error::OUT_OF_MEMORY)?;

    state.bitmap.set(index);
    state.free_count -= 1;
    state.next_hint = index + 1;

    let frame = PhysFrameNum::new(index);

    // Safety: the bitmap claims this frame was free and thus not otherwise aliased; the physmap
    // maps every frame below `frame_count`.
    unsafe {
        pfn_to_physmap(frame)
            .addr()
            .as_mut_ptr::<u8>()
            .write_bytes(0, PAGE_SIZE);
    }

    Ok(frame)
}

/// Returns `frame` to the global allocator.
///
/// # Panics
///
/// Panics if `frame` is already free, indicating a double-free.
pub fn free_4k(frame: PhysFrameNum) {
    let mut guard = PMM.lock();
    let state = guard.as_mut().expect("pmm used before init");

    assert!(state.bitmap.get(frame.as_usize()), "double free of frame {frame}");
    state.bitmap.unset(frame.as_usize());
    state.free_count += 1;
}

/// Allocates `1 << order` contiguous, zeroed frames, aligned to their own size.
///
/// Used for allocations too large for the slab allocator (see [`super::heap`]), where splitting
/// across non-contiguous frames isn't an option.
pub fn alloc_contig_zeroed(order: usize) -> Result<PhysFrameNum> {
    let count = 1usize << order;

    let mut guard = PMM.lock();
    let state = guard.as_mut().expect("pmm used before init");

    let mut start = 0;
    let found = loop {
        if start + count > state.frame_count {
            return Err(Error::OUT_OF_MEMORY);
        }

        if (start..start + count).all(|pfn| !state.bitmap.get(pfn)) {
            break start;
        }

        start += count;
    };

    for pfn in found..found + count {
        state.bitmap.set(pfn);
    }
    state.free_count -= count;

    let frame = PhysFrameNum::new(found);

    // Safety: the bitmap claims this whole run was free and thus not otherwise aliased; the
    // physmap maps every frame below `frame_count`.
    unsafe {
        pfn_to_physmap(frame)
            .addr()
            .as_mut_ptr::<u8>()
            .write_bytes(0, PAGE_SIZE * count);
    }

    Ok(frame)
}

/// Returns a run of `1 << order` frames previously handed out by [`alloc_contig_zeroed`].
///
/// # Panics
///
/// Panics if any frame in the run is already free, indicating a double-free.
pub fn free_contig(frame: PhysFrameNum, order: usize) {
    let count = 1usize << order;

    let mut guard = PMM.lock();
    let state = guard.as_mut().expect("pmm used before init");

    for pfn in frame.as_usize()..frame.as_usize() + count {
        assert!(state.bitmap.get(pfn), "double free of frame {pfn}");
        state.bitmap.unset(pfn);
    }
    state.free_count += count;
}

pub fn dump_usage() {
    let guard = PMM.lock();
    if let Some(state) = guard.as_ref() {
        debug!(
            "pmm: {} frames free of {}",
            state.free_count, state.frame_count
        );
    }
}
