//! Machine-independent page table manipulation and traversal.
//!
//! This module implements the walker described by the MMU context subsystem: map, unmap, remap
//! and query all share the same level-by-level traversal, built on top of the atomic primitives
//! in [`crate::arch::mmu`] so that concurrent hardware updates to Accessed/Dirty are never lost.

use core::{cmp, result};

use crate::arch::mmu::{
    self, cache_mode_from_pte, get_pte_frame, make_empty_pte, make_intermediate_pte,
    make_terminal_pte, perms_from_pte, pte_is_accessed, pte_is_dirty, pte_is_present,
    pte_is_terminal, update_pte_perms, PageTableEntry, PageTableSpace, PT_ENTRY_COUNT,
    PT_LEVEL_COUNT, PT_LEVEL_SHIFT,
};
use crate::err::{Error, Result};

use super::types::{CacheMode, PageTablePerms, PhysFrameNum, UnmappedFrame, VirtPageNum};

/// An object that can translate physical frame numbers to virtual page numbers that can be used to
/// access them.
pub trait TranslatePhys {
    /// Translates `phys` to a virtual page number that can be used to access it.
    fn translate(&self, phys: PhysFrameNum) -> VirtPageNum;
}

/// An allocator responsible for allocating physical frames for use as page tables.
pub trait PageTableAlloc {
    /// Allocates a new page table, returning its PFN.
    fn allocate(&mut self) -> Result<PhysFrameNum>;
}

/// Trait used to notify implementors that mappings have been updated and the TLB should be flushed.
pub trait GatherInvalidations {
    /// Notifies the implementor of the trait that the mapping for `vpn` has been modified and
    /// should be flushed from the TLB.
    fn add_tlb_flush(&mut self, vpn: VirtPageNum);
}

/// [`GatherInvalidations`] implementation that does nothing.
///
/// This is useful when fine-grained invalidation tracking is not necessary, as the entire TLB will
/// be flushed anyway.
pub struct NoopGather;

impl GatherInvalidations for NoopGather {
    fn add_tlb_flush(&mut self, _vpn: VirtPageNum) {}
}

/// The result of a successful [`PageTable::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub frame: PhysFrameNum,
    pub perms: PageTablePerms,
    pub cache_mode: CacheMode,
}

/// A virtual page range along with a progress pointer within it.
///
/// This is the structure used to track virtual page ranges in all map/unmap operations. It enables
/// those operations to report partial progress back to the caller even if they encounter an error
/// in the middle of the operation.
pub struct MappingPointer {
    base: VirtPageNum,
    size: usize,
    offset: usize,
}

impl MappingPointer {
    /// Creates a new mapping pointer spanning the page range `base..base + size`, with the pointer
    /// set to the start of the range.
    pub fn new(base: VirtPageNum, size: usize) -> Self {
        Self {
            base,
            size,
            offset: 0,
        }
    }

    /// Returns the current offset of this mapping pointer, measured in pages from the base.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the current virtual page number pointed to by this mapping pointer.
    pub fn virt(&self) -> VirtPageNum {
        self.base + self.offset
    }

    /// Returns the number of pages remaining in the range, past the current offset.
    pub fn remaining_pages(&self) -> usize {
        self.size - self.offset
    }

    /// Advances the pointer forward by `pages`.
    pub fn advance(&mut self, pages: usize) {
        self.offset += pages;
        debug_assert!(self.offset <= self.size);
    }

    /// Advances the pointer forward by at most `pages`, or less if there are less than `pages`
    /// pages remaining.
    pub fn advance_clamped(&mut self, pages: usize) {
        self.offset = cmp::min(self.offset + pages, self.size);
    }
}

/// Structure for accessing and manipulating page tables.
///
/// A `PageTable` is either a kernel table or a user table. User tables reject `USER`-less
/// intermediate sharing: every intermediate entry `map` creates is marked user-accessible, since
/// hardware ANDs the User bit down the walk and a non-user-accessible interior entry would make
/// every leaf beneath it unreachable from user mode regardless of the leaf's own permissions.
pub struct PageTable<T> {
    root: PhysFrameNum,
    inner: PageTableInner<T>,
}

impl<T: TranslatePhys> PageTable<T> {
    /// Creates a new page table accessor for a page table rooted at `root_pt`, using `translator`
    /// to translate physical frames to virtual page numbers when necessary during traversal and
    /// manipulation. `user` selects whether newly created intermediate tables are user-accessible.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the provided table is correctly structured and that
    /// `translator` provides correct virtual page numbers for any queried physical frames.
    pub unsafe fn new(root_pt: PhysFrameNum, translator: T, user: bool) -> Self {
        Self {
            root: root_pt,
            inner: PageTableInner::new(translator, user),
        }
    }

    /// Maps the virtual page range spanned by `pointer` to a contiguous physical range starting at
    /// `phys_base`, with permissions `perms` and cache mode `cache_mode`.
    ///
    /// This function does not support overwriting existing mappings, and will fail if it encounters
    /// a page that is already mapped.
    ///
    /// # Errors
    ///
    /// * `OUT_OF_MEMORY` - A page table allocation failed.
    /// * `RESOURCE_OVERLAP` - A page in the range was already mapped.
    ///
    /// # Safety
    ///
    /// * The page table must not be accessed concurrently by other cores/interrupts during the
    ///   mapping
    /// * The provided allocator must return physical frames usable as page tables
    /// * `cache_mode` must be a cache mode that can safely be applied to the provided pages
    pub unsafe fn map(
        &mut self,
        alloc: &mut impl PageTableAlloc,
        pointer: &mut MappingPointer,
        phys_base: PhysFrameNum,
        perms: PageTablePerms,
        cache_mode: CacheMode,
    ) -> Result<()> {
        self.inner.map(
            alloc,
            pointer,
            self.root,
            PT_LEVEL_COUNT - 1,
            phys_base,
            perms,
            cache_mode,
        )
    }

    /// Unmaps any pages in the range covered by `pointer`, reporting any virtual pages that need
    /// TLB invalidation to `gather` and the frame (plus its hardware Dirty state) backing each
    /// unmapped page to `on_unmapped`.
    ///
    /// This function will skip any unmapped "holes" encountered in the range, and cannot split
    /// large pages: it returns an error if the range partially intersects one.
    ///
    /// # Errors
    ///
    /// * `RESOURCE_OVERLAP` - The unmapping range partially intersected a large page.
    ///
    /// # Safety
    ///
    /// * The page table must not be accessed concurrently by other cores/interrupts during the
    ///   unmapping
    /// * Any cores on which the page table is active must not access the virtual addresses unmapped
    ///   by the call
    /// * Any pages reported to `gather` must be flushed from the TLB before later attempts to
    ///   re-map them.
    pub unsafe fn unmap(
        &mut self,
        gather: &mut impl GatherInvalidations,
        pointer: &mut MappingPointer,
        on_unmapped: &mut impl FnMut(VirtPageNum, UnmappedFrame),
    ) -> Result<()> {
        self.inner
            .walk_unmap(gather, pointer, on_unmapped, self.root, PT_LEVEL_COUNT - 1)
    }

    /// Updates the protection permissions of all pages in the range covered by `pointer`,
    /// preserving the mapped frame and cache mode, and reports any virtual pages that need TLB
    /// invalidation to `gather`.
    ///
    /// The update is applied with a compare-and-swap loop at each leaf so that a concurrent
    /// hardware Accessed/Dirty update is folded into the result rather than silently discarded.
    ///
    /// This function will skip any "holes" encountered in the range, and cannot split large pages:
    /// it returns an error if the range partially intersects one.
    ///
    /// # Errors
    ///
    /// * `RESOURCE_OVERLAP` - The range partially intersected a large page.
    ///
    /// # Safety
    ///
    /// * The page table must not be accessed concurrently by other cores/interrupts during the
    ///   operation
    /// * The caller must guarantee that any page faults caused by accesses after the protection has
    ///   been updated will be handled correctly.
    /// * Any pages reported to `gather` must be flushed from the TLB before the new permissions
    ///   can be relied on.
    pub unsafe fn remap(
        &mut self,
        gather: &mut impl GatherInvalidations,
        pointer: &mut MappingPointer,
        perms: PageTablePerms,
    ) -> Result<()> {
        self.inner.walk_update(
            gather,
            pointer,
            &mut |pte, _level| update_pte_perms(pte, perms),
            self.root,
            PT_LEVEL_COUNT - 1,
        )
    }

    /// Looks up the current translation of `vpn`, or `None` if it is not mapped.
    ///
    /// # Safety
    ///
    /// The page table must not be concurrently torn down while this call is in progress.
    pub unsafe fn query(&self, vpn: VirtPageNum) -> Option<Translation> {
        self.inner.query(self.root, PT_LEVEL_COUNT - 1, vpn)
    }
}

enum NextTableError {
    NotPresent,
    TerminalEntry(PageTableEntry),
}

struct PageTableInner<T> {
    translator: T,
    user: bool,
}

impl<T: TranslatePhys> PageTableInner<T> {
    fn new(translator: T, user: bool) -> Self {
        Self { translator, user }
    }

    #[allow(clippy::too_many_arguments)]
    fn map(
        &mut self,
        alloc: &mut impl PageTableAlloc,
        pointer: &mut MappingPointer,
        table: PhysFrameNum,
        level: usize,
        phys_base: PhysFrameNum,
        perms: PageTablePerms,
        cache_mode: CacheMode,
    ) -> Result<()> {
        walk_level(level, pointer, |pointer| {
            if mmu::supports_page_size(level) && can_use_level_page(level, pointer, phys_base) {
                self.map_terminal(pointer, table, level, phys_base, perms, cache_mode)?;
            } else {
                let next =
                    self.next_table_or_create(alloc, table, pointer.virt().pt_index(level), level)?;
                self.map(
                    alloc,
                    pointer,
                    next,
                    level - 1,
                    phys_base,
                    perms,
                    cache_mode,
                )?;
            }

            Ok(())
        })
    }

    fn walk_update(
        &mut self,
        gather: &mut impl GatherInvalidations,
        pointer: &mut MappingPointer,
        update: &mut impl FnMut(PageTableEntry, usize) -> PageTableEntry,
        table: PhysFrameNum,
        level: usize,
    ) -> Result<()> {
        walk_level(level, pointer, |pointer| {
            if level == 0 {
                self.update_terminal(gather, pointer, update, table, level);
            } else {
                let index = pointer.virt().pt_index(level);
                let next = match self.next_table(table, index, level) {
                    Ok(next_ptr) => next_ptr,

                    Err(NextTableError::TerminalEntry(_entry)) => {
                        if covers_level_entry(pointer, level) {
                            self.update_terminal(gather, pointer, update, table, level);
                            return Ok(());
                        } else {
                            return Err(Error::RESOURCE_OVERLAP);
                        }
                    }

                    Err(NextTableError::NotPresent) => {
                        pointer.advance_clamped(level_page_count(level));
                        return Ok(());
                    }
                };

                self.walk_update(gather, pointer, update, next, level - 1)?;
            }

            Ok(())
        })
    }

    fn walk_unmap(
        &mut self,
        gather: &mut impl GatherInvalidations,
        pointer: &mut MappingPointer,
        on_unmapped: &mut impl FnMut(VirtPageNum, UnmappedFrame),
        table: PhysFrameNum,
        level: usize,
    ) -> Result<()> {
        walk_level(level, pointer, |pointer| {
            if level == 0 {
                self.unmap_terminal(gather, pointer, on_unmapped, table, level);
            } else {
                let index = pointer.virt().pt_index(level);
                let next = match self.next_table(table, index, level) {
                    Ok(next_ptr) => next_ptr,

                    Err(NextTableError::TerminalEntry(_entry)) => {
                        if covers_level_entry(pointer, level) {
                            self.unmap_terminal(gather, pointer, on_unmapped, table, level);
                            return Ok(());
                        } else {
                            return Err(Error::RESOURCE_OVERLAP);
                        }
                    }

                    Err(NextTableError::NotPresent) => {
                        pointer.advance_clamped(level_page_count(level));
                        return Ok(());
                    }
                };

                self.walk_unmap(gather, pointer, on_unmapped, next, level - 1)?;
            }

            Ok(())
        })
    }

    fn query(&self, table: PhysFrameNum, level: usize, vpn: VirtPageNum) -> Option<Translation> {
        let index = vpn.pt_index(level);
        let pte = self.get(table, index);

        if !pte_is_present(pte, level) {
            return None;
        }

        if pte_is_terminal(pte, level) {
            let page_offset = vpn.as_usize() & level_page_mask(level);
            return Some(Translation {
                frame: get_pte_frame(pte) + page_offset,
                perms: perms_from_pte(pte),
                cache_mode: cache_mode_from_pte(pte, level),
            });
        }

        self.query(get_pte_frame(pte), level - 1, vpn)
    }

    fn next_table_or_create(
        &mut self,
        alloc: &mut impl PageTableAlloc,
        table: PhysFrameNum,
        index: usize,
        level: usize,
    ) -> Result<PhysFrameNum> {
        match self.next_table(table, index, level) {
            Ok(next) => return Ok(next),
            Err(NextTableError::TerminalEntry(_)) => return Err(Error::RESOURCE_OVERLAP),
            Err(NextTableError::NotPresent) => {}
        };

        let new_table = alloc.allocate()?;
        self.clear_table(new_table);
        self.set(table, index, make_intermediate_pte(new_table, self.user));

        Ok(new_table)
    }

    fn next_table(
        &self,
        table: PhysFrameNum,
        index: usize,
        level: usize,
    ) -> result::Result<PhysFrameNum, NextTableError> {
        let pte = self.get(table, index);

        if !pte_is_present(pte, level) {
            return Err(NextTableError::NotPresent);
        }

        if pte_is_terminal(pte, level) {
            return Err(NextTableError::TerminalEntry(pte));
        }

        Ok(get_pte_frame(pte))
    }

    fn map_terminal(
        &mut self,
        pointer: &mut MappingPointer,
        table: PhysFrameNum,
        level: usize,
        phys_base: PhysFrameNum,
        perms: PageTablePerms,
        cache_mode: CacheMode,
    ) -> Result<()> {
        let index = pointer.virt().pt_index(level);

        if pte_is_present(self.get(table, index), level) {
            return Err(Error::RESOURCE_OVERLAP);
        }

        self.set(
            table,
            index,
            make_terminal_pte(
                level,
                phys_base + pointer.offset(),
                perms,
                cache_mode,
                self.user,
            ),
        );

        pointer.advance(level_page_count(level));

        Ok(())
    }

    fn update_terminal(
        &mut self,
        gather: &mut impl GatherInvalidations,
        pointer: &mut MappingPointer,
        update: &mut impl FnMut(PageTableEntry, usize) -> PageTableEntry,
        table: PhysFrameNum,
        level: usize,
    ) {
        let index = pointer.virt().pt_index(level);
        let prior = self.cas(table, index, |pte| update(pte, level));

        // Hardware never caches a translation without first setting Accessed, so if the entry we
        // just replaced wasn't Accessed, no CPU can hold a stale TLB entry for it.
        if pte_is_accessed(prior) {
            gather.add_tlb_flush(pointer.virt());
        }

        pointer.advance(level_page_count(level));
    }

    fn unmap_terminal(
        &mut self,
        gather: &mut impl GatherInvalidations,
        pointer: &mut MappingPointer,
        on_unmapped: &mut impl FnMut(VirtPageNum, UnmappedFrame),
        table: PhysFrameNum,
        level: usize,
    ) {
        let index = pointer.virt().pt_index(level);
        let prior = self.clear_and_read(table, index);

        on_unmapped(
            pointer.virt(),
            UnmappedFrame {
                frame: get_pte_frame(prior),
                dirty: pte_is_dirty(prior),
            },
        );

        if pte_is_accessed(prior) {
            gather.add_tlb_flush(pointer.virt());
        }

        pointer.advance(level_page_count(level));
    }

    fn space(&self, table: PhysFrameNum) -> &PageTableSpace {
        // Safety: the translator is required by `PageTable::new`'s contract to return a valid
        // mapping of `table`'s backing page-table storage.
        unsafe {
            &*self
                .translator
                .translate(table)
                .addr()
                .as_ptr::<PageTableSpace>()
        }
    }

    fn get(&self, table: PhysFrameNum, index: usize) -> PageTableEntry {
        assert!(index < PT_ENTRY_COUNT, "page table access out of bounds");
        self.space(table).load(index)
    }

    fn set(&mut self, table: PhysFrameNum, index: usize, entry: PageTableEntry) {
        assert!(index < PT_ENTRY_COUNT, "page table access out of bounds");
        self.space(table).store(index, entry);
    }

    fn cas(
        &mut self,
        table: PhysFrameNum,
        index: usize,
        f: impl FnMut(PageTableEntry) -> PageTableEntry,
    ) -> PageTableEntry {
        assert!(index < PT_ENTRY_COUNT, "page table access out of bounds");
        self.space(table).cas(index, f)
    }

    fn clear_and_read(&mut self, table: PhysFrameNum, index: usize) -> PageTableEntry {
        assert!(index < PT_ENTRY_COUNT, "page table access out of bounds");
        self.space(table).clear_and_read(index)
    }

    fn clear_table(&mut self, table: PhysFrameNum) {
        let space = self.space(table);
        for i in 0..PT_ENTRY_COUNT {
            space.store(i, make_empty_pte());
        }
    }
}

fn walk_level<E>(
    level: usize,
    pointer: &mut MappingPointer,
    mut f: impl FnMut(&mut MappingPointer) -> result::Result<(), E>,
) -> result::Result<(), E> {
    let virt = pointer.virt();
    let range_end = virt + pointer.remaining_pages();
    let next_table_boundary = (virt + 1).align_up(PT_ENTRY_COUNT * level_page_count(level));

    let max_virt = cmp::min(range_end, next_table_boundary);

    while pointer.virt() < max_virt {
        f(pointer)?;
    }

    Ok(())
}

fn can_use_level_page(level: usize, pointer: &MappingPointer, phys_base: PhysFrameNum) -> bool {
    covers_level_entry(pointer, level)
        && aligned_for_level(phys_base.as_usize() + pointer.offset(), level)
}

fn covers_level_entry(pointer: &MappingPointer, level: usize) -> bool {
    aligned_for_level(pointer.virt().as_usize(), level)
        && pointer.remaining_pages() >= level_page_count(level)
}

fn aligned_for_level(page_num: usize, level: usize) -> bool {
    page_num & level_page_mask(level) == 0
}

fn level_page_count(level: usize) -> usize {
    1 << (level * PT_LEVEL_SHIFT)
}

fn level_page_mask(level: usize) -> usize {
    level_page_count(level) - 1
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::*;

    /// A host-side simulation of physical memory: each "frame" is a page table worth of atomic
    /// slots, indexed directly by frame number. Stands in for the real physmap window during
    /// tests, per the walker's `TranslatePhys` boundary.
    struct FakeMemory {
        frames: Vec<PageTableSpace>,
    }

    impl FakeMemory {
        fn new(capacity: usize) -> Self {
            let mut frames = Vec::with_capacity(capacity);
            frames.resize_with(capacity, PageTableSpace::new);
            Self { frames }
        }
    }

    struct FakeTranslator<'a>(&'a FakeMemory);

    impl TranslatePhys for FakeTranslator<'_> {
        fn translate(&self, phys: PhysFrameNum) -> VirtPageNum {
            let ptr = &self.0.frames[phys.as_usize()] as *const PageTableSpace as usize;
            VirtPageNum::new(ptr >> mmu::PAGE_SHIFT)
        }
    }

    struct BumpAlloc {
        next: RefCell<usize>,
        limit: usize,
    }

    impl PageTableAlloc for &BumpAlloc {
        fn allocate(&mut self) -> Result<PhysFrameNum> {
            let mut next = self.next.borrow_mut();
            if *next >= self.limit {
                return Err(Error::OUT_OF_MEMORY);
            }
            let frame = PhysFrameNum::new(*next);
            *next += 1;
            Ok(frame)
        }
    }

    fn new_table(mem: &FakeMemory, alloc: &BumpAlloc) -> (PhysFrameNum, FakeTranslator<'_>) {
        let root = PageTableAlloc::allocate(&mut &*alloc).unwrap();
        (root, FakeTranslator(mem))
    }

    #[test]
    fn map_then_query_round_trips() {
        let mem = FakeMemory::new(16);
        let alloc = BumpAlloc {
            next: RefCell::new(0),
            limit: 16,
        };
        let (root, translator) = new_table(&mem, &alloc);

        let mut pt = unsafe { PageTable::new(root, translator, false) };
        let mut pointer = MappingPointer::new(VirtPageNum::new(0x1000), 4);

        unsafe {
            pt.map(
                &mut &alloc,
                &mut pointer,
                PhysFrameNum::new(0x500),
                PageTablePerms::WRITE,
                CacheMode::Cached,
            )
            .unwrap();
        }

        assert_eq!(pointer.offset(), 4);

        let translation = unsafe { pt.query(VirtPageNum::new(0x1002)).unwrap() };
        assert_eq!(translation.frame, PhysFrameNum::new(0x502));
        // This table is non-user (`PageTable::new(.., false)`), so every leaf is Global regardless
        // of the perms passed to `map` - User/Global are decided by context kind, not by `perms`.
        assert_eq!(
            translation.perms,
            PageTablePerms::WRITE | PageTablePerms::GLOBAL
        );
    }

    #[test]
    fn map_rejects_overlap() {
        let mem = FakeMemory::new(16);
        let alloc = BumpAlloc {
            next: RefCell::new(0),
            limit: 16,
        };
        let (root, translator) = new_table(&mem, &alloc);
        let mut pt = unsafe { PageTable::new(root, translator, false) };

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        unsafe {
            pt.map(
                &mut &alloc,
                &mut pointer,
                PhysFrameNum::new(1),
                PageTablePerms::WRITE,
                CacheMode::Cached,
            )
            .unwrap();
        }

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        let err = unsafe {
            pt.map(
                &mut &alloc,
                &mut pointer,
                PhysFrameNum::new(2),
                PageTablePerms::WRITE,
                CacheMode::Cached,
            )
            .unwrap_err()
        };
        assert_eq!(err, Error::RESOURCE_OVERLAP);
    }

    #[test]
    fn unmap_returns_prior_frame_and_dirty_state() {
        let mem = FakeMemory::new(16);
        let alloc = BumpAlloc {
            next: RefCell::new(0),
            limit: 16,
        };
        let (root, translator) = new_table(&mem, &alloc);
        let mut pt = unsafe { PageTable::new(root, translator, false) };

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        unsafe {
            pt.map(
                &mut &alloc,
                &mut pointer,
                PhysFrameNum::new(9),
                PageTablePerms::WRITE,
                CacheMode::Cached,
            )
            .unwrap();
        }

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        let mut seen = None;
        unsafe {
            pt.unmap(&mut NoopGather, &mut pointer, &mut |vpn, frame| {
                seen = Some((vpn, frame));
            })
            .unwrap();
        }

        let (vpn, frame) = seen.unwrap();
        assert_eq!(vpn, VirtPageNum::new(0));
        assert_eq!(frame.frame, PhysFrameNum::new(9));

        assert!(unsafe { pt.query(VirtPageNum::new(0)) }.is_none());
    }

    #[test]
    fn remap_preserves_frame_and_updates_perms() {
        let mem = FakeMemory::new(16);
        let alloc = BumpAlloc {
            next: RefCell::new(0),
            limit: 16,
        };
        let (root, translator) = new_table(&mem, &alloc);
        let mut pt = unsafe { PageTable::new(root, translator, false) };

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        unsafe {
            pt.map(
                &mut &alloc,
                &mut pointer,
                PhysFrameNum::new(3),
                PageTablePerms::WRITE,
                CacheMode::Cached,
            )
            .unwrap();
        }

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        unsafe {
            pt.remap(&mut NoopGather, &mut pointer, PageTablePerms::EXECUTE)
                .unwrap();
        }

        let translation = unsafe { pt.query(VirtPageNum::new(0)).unwrap() };
        assert_eq!(translation.frame, PhysFrameNum::new(3));
        // Global is preserved from the original mapping (this table is non-user), even though
        // `remap`'s `perms` argument never mentions it.
        assert_eq!(
            translation.perms,
            PageTablePerms::EXECUTE | PageTablePerms::GLOBAL
        );
    }

    #[test]
    fn remap_preserves_user_and_global_even_if_perms_requests_otherwise() {
        let mem = FakeMemory::new(16);
        let alloc = BumpAlloc {
            next: RefCell::new(0),
            limit: 16,
        };
        let (root, translator) = new_table(&mem, &alloc);
        let mut pt = unsafe { PageTable::new(root, translator, true) };

        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        unsafe {
            pt.map(
                &mut &alloc,
                &mut pointer,
                PhysFrameNum::new(3),
                PageTablePerms::WRITE,
                CacheMode::Cached,
            )
            .unwrap();
        }

        // A remap requesting GLOBAL must not actually set it: User/Global are derived from the
        // table's own context kind (`user = true` here), never from the caller's `perms`.
        let mut pointer = MappingPointer::new(VirtPageNum::new(0), 1);
        unsafe {
            pt.remap(
                &mut NoopGather,
                &mut pointer,
                PageTablePerms::EXECUTE | PageTablePerms::GLOBAL,
            )
            .unwrap();
        }

        let translation = unsafe { pt.query(VirtPageNum::new(0)).unwrap() };
        assert_eq!(
            translation.perms,
            PageTablePerms::EXECUTE | PageTablePerms::USER
        );
    }

    #[test]
    fn query_of_unmapped_hole_is_none() {
        let mem = FakeMemory::new(16);
        let alloc = BumpAlloc {
            next: RefCell::new(0),
            limit: 16,
        };
        let (root, translator) = new_table(&mem, &alloc);
        let pt = unsafe { PageTable::new(root, translator, false) };

        assert!(unsafe { pt.query(VirtPageNum::new(0x4000)) }.is_none());
    }
}
