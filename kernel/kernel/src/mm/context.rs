//! MMU context lifecycle: a top-level page table paired with the pending-invalidation queue that
//! accumulates while its lock is held, tied together with the machine-independent walker
//! ([`super::pt`]) and the cross-CPU shootdown coordinator ([`shootdown`]).

pub mod shootdown;

use crate::arch::mmu::{
    get_pte_frame, kernel_pt_root, make_empty_pte, prepare_low_pt_root, pte_is_present,
    pte_is_terminal, set_low_root_pt, PageTableSpace, PT_ENTRY_COUNT, PT_LEVEL_COUNT,
};
use crate::arch::percpu::{self, CpuId};
use crate::err::Result;
use crate::sync::context_lock::ContextLock;

use self::shootdown::{flush_on_unlock, ContextGather, CpuDirectory, InvalQueue, IpiTransport};

use super::physmap::{pfn_to_physmap, PhysmapPfnTranslator};
use super::pmm;
use super::pt::{MappingPointer, PageTable, PageTableAlloc, Translation};
use super::types::{CacheMode, PageTablePerms, PhysFrameNum, UnmappedFrame, VirtPageNum};

/// A page-table allocator backed by the steady-state frame allocator, for use once the boot
/// bump allocator ([`super::early::BootHeap`]) has been retired.
pub struct PmmPageTableAlloc;

impl PageTableAlloc for PmmPageTableAlloc {
    fn allocate(&mut self) -> Result<PhysFrameNum> {
        pmm::alloc_zeroed_4k()
    }
}

/// One MMU address space: a top-level page table plus the bookkeeping needed to coordinate TLB
/// invalidation across CPUs that may have it loaded.
///
/// Every context shares the kernel's upper-half mappings (see
/// [`prepare_low_pt_root`](crate::arch::mmu::prepare_low_pt_root)); the kernel context itself is
/// the one whose lower half is never populated; see [`MmuContext::is_kernel`].
pub struct MmuContext {
    root: PhysFrameNum,
    is_kernel: bool,
    queue: ContextLock<InvalQueue>,
}

impl MmuContext {
    /// Wraps the kernel's own static root page table (see
    /// [`crate::arch::mmu::kernel_pt_root`]) as an [`MmuContext`]. There is exactly one of these
    /// for the lifetime of the kernel; it is never destroyed.
    pub fn kernel() -> Self {
        Self {
            root: kernel_pt_root(),
            is_kernel: true,
            queue: ContextLock::new(InvalQueue::new()),
        }
    }

    /// Creates a new user context rooted at a freshly allocated top-level table, with the
    /// kernel's upper-half mappings copied in immediately so that a concurrent change to the
    /// kernel's own page table (always upper-half, always append-only once
    /// [`crate::arch::mmu::finish_init_kernel_pt`] has run) can never leave this context with a
    /// hole where the kernel expects to be mapped.
    ///
    /// # Safety
    ///
    /// The physmap must already be initialized, since this walks the new table through it.
    pub unsafe fn new_user(alloc: &mut impl PageTableAlloc) -> Result<Self> {
        let root = alloc.allocate()?;

        // Safety: `alloc` just handed us a fresh frame; nothing else can be observing it yet.
        let space = unsafe { &*pfn_to_physmap(root).addr().as_ptr::<PageTableSpace>() };
        for index in 0..PT_ENTRY_COUNT {
            space.store(index, make_empty_pte());
        }

        // Safety: the kernel's page table is never modified concurrently with context creation
        // (new contexts are only created while holding whatever lock protects the
        // process/context table, which is outside this crate's scope).
        unsafe {
            prepare_low_pt_root(space);
        }

        Ok(Self {
            root,
            is_kernel: false,
            queue: ContextLock::new(InvalQueue::new()),
        })
    }

    /// Tears down a non-kernel context, freeing every page-table frame it owns.
    ///
    /// This frees only the page-table frames themselves (leaf tables, directories, PDPTs and the
    /// top-level table); any data frames still mapped through them are not this module's concern
    /// and must already have been unmapped by the caller.
    ///
    /// # Safety
    ///
    /// The context must not be loaded on any CPU and must not be locked.
    pub unsafe fn destroy(self) {
        assert!(!self.is_kernel, "the kernel context is never destroyed");

        let space = self.space();
        for index in 0..PT_ENTRY_COUNT / 2 {
            let pte = space.load(index);
            if !pte_is_present(pte, PT_LEVEL_COUNT - 1) {
                continue;
            }
            assert!(
                !pte_is_terminal(pte, PT_LEVEL_COUNT - 1),
                "large page found directly in a context's PML4"
            );

            // Safety: recursing per the function's own safety contract.
            unsafe { free_subtree(get_pte_frame(pte), PT_LEVEL_COUNT - 2) };
        }

        pmm::free_4k(self.root);
    }

    pub fn root(&self) -> PhysFrameNum {
        self.root
    }

    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Installs this context as the active low-half address space on the calling CPU.
    ///
    /// # Safety
    ///
    /// The caller must be prepared for every low-half access on this CPU to subsequently use this
    /// context's mappings.
    pub unsafe fn load(&self) {
        let root = if self.is_kernel { None } else { Some(self.root) };

        // Safety: function contract.
        unsafe {
            set_low_root_pt(root);
        }

        // Safety: the per-CPU table requires `init_current` to have run, which is guaranteed by
        // the time any context can be loaded.
        let cpu = unsafe { percpu::current() };
        percpu::set_current_context(cpu, Some(self.root));
    }

    /// Hook run when a context is no longer the active one on a CPU (e.g. on context switch away
    /// from it). Currently a no-op: this core has no per-context hardware state (such as a PCID)
    /// that needs to be retired here.
    pub fn unload(&self) {}

    /// Acquires this context's lock on behalf of the calling CPU, blocking while map/unmap/remap
    /// mutations may be performed.
    ///
    /// Reentrant: nested `lock`/`unlock` pairs from the same CPU never deadlock.
    pub fn lock(&self) {
        // Safety: see `load`.
        let cpu = unsafe { percpu::current() };
        self.queue.lock(cpu);
    }

    /// Releases one level of hold acquired by [`MmuContext::lock`]. If this is the outermost
    /// unlock, dispatches whatever TLB shootdown the mutations made under the lock require before
    /// any other CPU can observe the lock as free.
    pub fn unlock(&self, directory: &impl CpuDirectory, ipi: &impl IpiTransport) {
        // Safety: see `load`.
        let cpu = unsafe { percpu::current() };
        let is_kernel = self.is_kernel;
        let root = self.root;

        self.queue.unlock(cpu, |queue| {
            flush_on_unlock(queue, is_kernel, root, directory, ipi);
        });
    }

    /// Maps the virtual range spanned by `pointer` to physical frames starting at `phys_base`.
    ///
    /// # Safety
    ///
    /// The caller must hold this context's lock and must not have this table accessed
    /// concurrently from an interrupt handler.
    pub unsafe fn map(
        &self,
        alloc: &mut impl PageTableAlloc,
        pointer: &mut MappingPointer,
        phys_base: PhysFrameNum,
        perms: PageTablePerms,
        cache_mode: CacheMode,
    ) -> Result<()> {
        // Safety: caller holds the lock, so the root is stable and exclusively ours.
        let mut pt = unsafe { self.page_table() };
        unsafe { pt.map(alloc, pointer, phys_base, perms, cache_mode) }
    }

    /// Unmaps the virtual range spanned by `pointer`, reporting each unmapped frame to
    /// `on_unmapped`.
    ///
    /// # Safety
    ///
    /// The caller must hold this context's lock. Any pages this call queues for invalidation must
    /// not be re-mapped until the shootdown triggered by the matching [`MmuContext::unlock`] has
    /// completed.
    pub unsafe fn unmap(
        &self,
        pointer: &mut MappingPointer,
        on_unmapped: &mut impl FnMut(VirtPageNum, UnmappedFrame),
    ) -> Result<()> {
        // Safety: caller holds the lock.
        let mut pt = unsafe { self.page_table() };
        let locally_loaded = self.locally_loaded();

        // Safety: caller holds the lock, so only this CPU is mutating the queue right now.
        let queue = unsafe { self.queue.get_mut() };
        let mut gather = ContextGather::new(queue, locally_loaded);

        unsafe { pt.unmap(&mut gather, pointer, on_unmapped) }
    }

    /// Updates the permissions of every page in the range spanned by `pointer`.
    ///
    /// # Safety
    ///
    /// The caller must hold this context's lock.
    pub unsafe fn remap(&self, pointer: &mut MappingPointer, perms: PageTablePerms) -> Result<()> {
        // Safety: caller holds the lock.
        let mut pt = unsafe { self.page_table() };
        let locally_loaded = self.locally_loaded();

        // Safety: caller holds the lock.
        let queue = unsafe { self.queue.get_mut() };
        let mut gather = ContextGather::new(queue, locally_loaded);

        unsafe { pt.remap(&mut gather, pointer, perms) }
    }

    /// Looks up the current translation of `vpn`, or `None` if it is unmapped.
    ///
    /// # Safety
    ///
    /// The caller must hold this context's lock.
    pub unsafe fn query(&self, vpn: VirtPageNum) -> Option<Translation> {
        // Safety: caller holds the lock.
        let pt = unsafe { self.page_table() };
        unsafe { pt.query(vpn) }
    }

    fn locally_loaded(&self) -> bool {
        // Safety: see `load`.
        let cpu = unsafe { percpu::current() };
        percpu::current_context(cpu) == Some(self.root)
    }

    /// # Safety
    ///
    /// The caller must hold this context's lock.
    unsafe fn page_table(&self) -> PageTable<PhysmapPfnTranslator> {
        // Safety: the physmap is initialized well before any context exists, and `root` is a
        // valid, correctly structured page table for the lifetime of `self`.
        unsafe { PageTable::new(self.root, PhysmapPfnTranslator, !self.is_kernel) }
    }

    fn space(&self) -> &PageTableSpace {
        // Safety: `root` always refers to a live page table for the lifetime of `self`.
        unsafe { &*pfn_to_physmap(self.root).addr().as_ptr::<PageTableSpace>() }
    }
}

/// Frees every page-table frame reachable from `table` (an intermediate table at `level`),
/// including `table` itself. Does not touch anything reachable through a terminal entry: those
/// point at data frames, which this module does not own.
///
/// # Safety
///
/// `table` must be a page-table frame belonging to a context that is no longer loaded or locked
/// anywhere, and no large pages may appear anywhere below the context's PML4.
unsafe fn free_subtree(table: PhysFrameNum, level: usize) {
    if level == 0 {
        // `table` is a leaf-level page table: its entries are terminal and point at data frames
        // we don't own, so there is nothing left to recurse into.
        pmm::free_4k(table);
        return;
    }

    // Safety: function contract.
    let space = unsafe { &*pfn_to_physmap(table).addr().as_ptr::<PageTableSpace>() };
    for index in 0..PT_ENTRY_COUNT {
        let pte = space.load(index);
        if !pte_is_present(pte, level) {
            continue;
        }
        assert!(
            !pte_is_terminal(pte, level),
            "large page found in user half during context destroy"
        );

        // Safety: recursing per the function's own contract.
        unsafe { free_subtree(get_pte_frame(pte), level - 1) };
    }

    pmm::free_4k(table);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmm_page_table_alloc_is_a_page_table_alloc() {
        fn assert_impl<T: PageTableAlloc>() {}
        assert_impl::<PmmPageTableAlloc>();
    }
}
