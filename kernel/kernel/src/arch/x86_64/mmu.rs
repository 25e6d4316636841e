use core::arch::asm;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::trace;

use crate::arch::x86_64::x64_cpu::write_pat;
use crate::kimage;
use crate::mm::physmap::pfn_to_physmap;
use crate::mm::pmm;
use crate::mm::types::{CacheMode, PageTablePerms, PhysFrameNum, VirtAddr, VirtPageNum};
use crate::sync::irq::IrqDisabled;

use super::x64_cpu::{
    cpuid_nx_supported, read_cr0, read_cr3, read_cr4, read_ia32_efer, read_mtrr_def_type, wbinvd,
    write_cr0, write_cr3, write_cr4, write_ia32_efer, write_mtrr_def_type, Cr0, Cr4, Ia32Efer,
};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const PT_LEVEL_COUNT: usize = 4;

pub const PT_LEVEL_SHIFT: usize = 9;
pub const PT_ENTRY_COUNT: usize = 1 << PT_LEVEL_SHIFT;
pub const PT_LEVEL_MASK: usize = PT_ENTRY_COUNT - 1;

const MTRR_DEF_TYPE_E: u64 = 1 << 11;
const MTRR_DEF_TYPE_TYPE_MASK: u64 = 0xff;

const MEM_TYPE_UC: u64 = 0;
const MEM_TYPE_WC: u64 = 1;
const MEM_TYPE_WT: u64 = 4;
const MEM_TYPE_WB: u64 = 6;
const MEM_TYPE_UC_WEAK: u64 = 6;

// We use the hardware (boot-up) defaults for most of the PAT entries, but change one to support
// WC. `Device` shares the UC-weak entry with `Uncached`: AMD64 has no PAT slot stronger than UC.
const PA0_VAL: u64 = MEM_TYPE_WB; // Default
const PA1_VAL: u64 = MEM_TYPE_WT; // Default
const PA2_VAL: u64 = MEM_TYPE_UC_WEAK; // Default
const PA3_VAL: u64 = MEM_TYPE_UC; // Default
const PA4_VAL: u64 = MEM_TYPE_WB; // Default
const PA5_VAL: u64 = MEM_TYPE_WT; // Default
const PA6_VAL: u64 = MEM_TYPE_UC_WEAK; // Default
const PA7_VAL: u64 = MEM_TYPE_WC; // Weakened from default UC

// Keep these in sync with the `PA` values above!

// This should always be 0 so we have a safe default if someone mapping a page ignores the PAT
// bits.
const PAT_SELECTOR_WB: u64 = 0;
const PAT_SELECTOR_UC: u64 = 3;
const PAT_SELECTOR_WC: u64 = 7;

const PT_RANGE: usize = 1 << (PT_LEVEL_SHIFT + PAGE_SHIFT);
const MB: usize = 0x100000;
const PADDR_MASK: u64 = (1u64 << 52) - 1;

// Note: keep in sync with linker script and early mapping in `boot.s`
const KERNEL_MAX: usize = 8 * MB;
const KERNEL_PT_COUNT: usize = KERNEL_MAX / PT_RANGE;

pub(super) static KERNEL_PML4: PageTableSpace = PageTableSpace::NEW;
pub(super) static KERNEL_PDPT: PageTableSpace = PageTableSpace::NEW;
pub(super) static KERNEL_PD: PageTableSpace = PageTableSpace::NEW;
pub(super) static KERNEL_PTS: [PageTableSpace; KERNEL_PT_COUNT] =
    [PageTableSpace::NEW; KERNEL_PT_COUNT];

/// A snapshot of a page table entry, taken by one of [`PageTableSpace`]'s atomic accessors.
///
/// This is a plain value type: flag inspection and construction helpers below operate on a copy,
/// never reaching behind the caller's back into the table itself.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

/// A page table's backing storage: `PT_ENTRY_COUNT` entries, each independently atomic.
///
/// All mutation goes through [`PageTableSpace::store`], [`PageTableSpace::clear_and_read`] or
/// [`PageTableSpace::cas`] so that concurrent hardware updates to the Accessed/Dirty bits are
/// never silently lost to a non-atomic read-modify-write from software.
#[repr(C, align(0x1000))]
pub struct PageTableSpace {
    entries: [AtomicU64; PT_ENTRY_COUNT],
}

impl PageTableSpace {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const NEW: Self = Self::new();

    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            entries: [ZERO; PT_ENTRY_COUNT],
        }
    }

    /// Reads the entry at `index` without disturbing it.
    pub fn load(&self, index: usize) -> PageTableEntry {
        PageTableEntry(self.entries[index].load(Ordering::Acquire))
    }

    /// Untorn write of a fresh entry. Only valid when no other agent (software or hardware) can
    /// be concurrently observing or updating the slot at `index`, e.g. because it was previously
    /// non-present.
    pub fn store(&self, index: usize, entry: PageTableEntry) {
        self.entries[index].store(entry.0, Ordering::Release);
    }

    /// Atomically swaps the entry at `index` to the empty (non-present) entry, returning whatever
    /// was there. Used by unmap: the hardware may have set Accessed/Dirty concurrently with the
    /// unmap racing ahead of a TLB invalidation, and a plain write would clobber that update
    /// before the caller gets a chance to observe it.
    pub fn clear_and_read(&self, index: usize) -> PageTableEntry {
        PageTableEntry(self.entries[index].swap(0, Ordering::AcqRel))
    }

    /// Applies `f` to the entry at `index` in a compare-and-swap loop, retrying if the hardware
    /// updates Accessed/Dirty between the read and the write. Used by remap/protect so that a
    /// concurrent hardware update is folded into the new entry rather than overwritten.
    ///
    /// Returns the entry as it stood immediately before the winning update, so callers can inspect
    /// Accessed/Dirty as they were at that point.
    pub fn cas(&self, index: usize, mut f: impl FnMut(PageTableEntry) -> PageTableEntry) -> PageTableEntry {
        let mut cur = self.entries[index].load(Ordering::Relaxed);
        loop {
            let next = f(PageTableEntry(cur)).0;
            match self.entries[index].compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return PageTableEntry(cur),
                Err(actual) => cur = actual,
            }
        }
    }
}

// Safety: this structure exists only to reserve BSS space for page tables, all accesses require
// unsafe code anyway and go through the atomic accessors above.
unsafe impl Sync for PageTableSpace {}

bitflags! {
    struct X86PageTableFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_MODE = 1 << 2;
        const GLOBAL = 1 << 8;

        const PROTECT_MASK = Self::WRITABLE.bits() | Self::NO_EXEC.bits();

        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;

        const NO_EXEC = 1 << 63;
    }
}

/// Performs early architecture-specific MMU initialization.
///
/// On x64, this currently:
/// * Enables global pages.
/// * Initializes the PAT so that caching modes can be safely used with the page table API later.
///
/// # Safety
///
/// This function should only be called once on the BSP.
pub unsafe fn init_early(_irq_disabled: &IrqDisabled) {
    init_mmu_regs();
    init_pat();
}

/// Performs per-CPU finalization of MMU-related state: probes for NX support and enables it if
/// present, then loads the PAT programmed by [`init_early`].
///
/// # Safety
///
/// Must be called once on every application processor, after [`init_early`] has run on the BSP.
pub unsafe fn init_percpu() {
    unsafe {
        if cpuid_nx_supported() {
            write_ia32_efer(read_ia32_efer() | Ia32Efer::NXE);
        }

        // The PAT MSR is per-core architectural state, unlike the page tables themselves, so every
        // application processor must run the programming sequence again.
        init_pat();

        let mut cr0 = read_cr0();
        cr0 &= !(Cr0::CD | Cr0::NW);
        cr0 |= Cr0::WP;
        write_cr0(cr0);

        write_cr4(read_cr4() | Cr4::PGE);
    }
}

/// Returns the physical frame of the kernel root page table.
pub fn kernel_pt_root() -> PhysFrameNum {
    kimage::pfn_from_kernel_vpn(VirtAddr::from_ptr(&KERNEL_PML4).containing_page())
}

/// Performs final architecture-specific initialization of the kernel address space.
///
/// # Safety
///
/// * This function should only be called once on the BSP, when the kernel page table is not being
///   used anywhere else.
/// * This function assumes that the frame allocator and physmap are initialized.
pub unsafe fn finish_init_kernel_pt() {
    // Make sure that at least all the kernel PDPT pointers are initialized. This ensures that low
    // address spaces will always have a consistent view of the kernel address space later.
    for index in PT_ENTRY_COUNT / 2..PT_ENTRY_COUNT {
        if !pte_is_present(KERNEL_PML4.load(index), 3) {
            let next_table = pmm::alloc_zeroed_4k().expect("failed to allocate kernel-space PDPT");
            KERNEL_PML4.store(index, make_intermediate_pte(next_table, true));
        }
    }
}

/// Copies the kernel's upper-half mappings into a freshly allocated low root page table, masking
/// off the hardware Accessed bit so that a newly created context never inherits a stale "this slot
/// was walked" signal from whatever CPU last touched the kernel's copy.
///
/// # Safety
///
/// The caller must guarantee that the top-level kernel page table is not being modified
/// concurrently and will not be modified in the future while `pt` is shadowing it.
pub unsafe fn prepare_low_pt_root(pt: &PageTableSpace) {
    for index in PT_ENTRY_COUNT / 2..PT_ENTRY_COUNT {
        let entry = KERNEL_PML4.load(index);
        let masked = PageTableEntry(entry.0 & !X86PageTableFlags::ACCESSED.bits());
        pt.store(index, masked);
    }
}

/// Sets the root page table for the low half of the address space to `pt`.
///
/// If `pt` is `None`, the lower half of memory will be unmapped entirely, leaving only the high
/// kernel memory mapped.
///
/// # Safety
///
/// This function is wildly unsafe, as it replaces the entire lower-half address space with a
/// different one. The caller must ensure that all accesses to low memory are made in accordance
/// with the new address space after the switch.
pub unsafe fn set_low_root_pt(pt: Option<PhysFrameNum>) {
    let pt = pt.unwrap_or_else(kernel_pt_root);
    unsafe {
        write_cr3(pt.addr().as_u64());
    }
}

/// Flushes the specified page from the TLB on the current CPU.
pub fn flush_tlb_page(vpn: VirtPageNum) {
    trace!("flushing TLB page {vpn}");
    unsafe {
        asm!("invlpg [{}]", in(reg) vpn.addr().as_usize());
    }
}

/// Flushes the entire TLB on the current CPU, including global entries.
pub fn flush_tlb_full() {
    trace!("flushing full TLB");

    unsafe {
        let cr4 = read_cr4();
        assert!(
            cr4.contains(Cr4::PGE),
            "global pages should be enabled for full TLB flushes to work"
        );

        // See ISDM 3A, section 4.10.4.1
        write_cr4(cr4 & !Cr4::PGE);
        write_cr4(cr4);
    }
}

/// Reloads CR3, flushing every non-global translation cached for the current address space.
pub fn flush_tlb_current_context() {
    trace!("flushing current-context TLB");
    // We currently don't use PCIDs at all.
    unsafe {
        write_cr3(read_cr3());
    }
}

/// Queries whether the processor supports large pages at level `level` of the page table
/// hierarchy.
pub fn supports_page_size(level: usize) -> bool {
    matches!(level, 0 | 1)
}

/// Creates an empty (non-present) PTE.
pub const fn make_empty_pte() -> PageTableEntry {
    PageTableEntry(0)
}

/// Creates a leaf PTE mapping `frame` with permissions `perms` for use with the specified page
/// table level.
///
/// `user` decides User and Global, not `perms`: a mapping's accessibility is a property of which
/// context it lives in, not something a caller can request per-mapping. User is set to `user`
/// directly, and Global to its complement, so a kernel (non-`user`) mapping is always Global and a
/// user mapping never is.
pub fn make_terminal_pte(
    level: usize,
    frame: PhysFrameNum,
    perms: PageTablePerms,
    cache_mode: CacheMode,
    user: bool,
) -> PageTableEntry {
    let mut x86_flags = X86PageTableFlags::PRESENT | flags_from_perms(perms);

    x86_flags.set(X86PageTableFlags::LARGE, level > 0);
    x86_flags.set(X86PageTableFlags::USER_MODE, user);
    x86_flags.set(X86PageTableFlags::GLOBAL, !user);

    PageTableEntry(
        frame.addr().as_u64()
            | x86_flags.bits()
            | pat_selector_to_pte_bits(pat_selector_for_cache_mode(cache_mode), level),
    )
}

/// Recovers the access mask encoded in a present PTE. The inverse of [`flags_from_perms`].
pub fn perms_from_pte(pte: PageTableEntry) -> PageTablePerms {
    let flags = X86PageTableFlags::from_bits_truncate(pte.0);
    let mut perms = PageTablePerms::empty();
    perms.set(PageTablePerms::WRITE, flags.contains(X86PageTableFlags::WRITABLE));
    perms.set(PageTablePerms::USER, flags.contains(X86PageTableFlags::USER_MODE));
    perms.set(PageTablePerms::GLOBAL, flags.contains(X86PageTableFlags::GLOBAL));
    perms.set(PageTablePerms::EXECUTE, !flags.contains(X86PageTableFlags::NO_EXEC));
    perms
}

/// Recovers the cache mode encoded in a present terminal PTE at the given level. Lossy in one
/// direction: `Device` and `Uncached` share a PAT selector on AMD64, so a `Device` mapping reads
/// back as `Uncached`.
pub fn cache_mode_from_pte(pte: PageTableEntry, level: usize) -> CacheMode {
    let pwt = (pte.0 >> 3) & 1;
    let pcd = (pte.0 >> 4) & 1;
    let pat = (pte.0 >> pat_bit_position(level)) & 1;
    let selector = pwt | (pcd << 1) | (pat << 2);

    if selector == PAT_SELECTOR_WB {
        CacheMode::Cached
    } else if selector == PAT_SELECTOR_WC {
        CacheMode::WriteCombining
    } else {
        CacheMode::Uncached
    }
}

/// Creates a PTE referring to a lower-level page table `next_table`. `user` controls whether the
/// intermediate entry is accessible from user mode; it must agree with every terminal mapping
/// reachable through it, since the User bit is ANDed down the walk by hardware.
pub fn make_intermediate_pte(next_table: PhysFrameNum, user: bool) -> PageTableEntry {
    let mut x86_flags = X86PageTableFlags::PRESENT | X86PageTableFlags::WRITABLE;
    x86_flags.set(X86PageTableFlags::USER_MODE, user);
    PageTableEntry(next_table.addr().as_u64() | x86_flags.bits())
}

/// Applies `perms` to `pte`, preserving the frame, present, large-page, User and Global bits --
/// only Writable and NX are rewritten, since User/Global are decided once at map time by context
/// kind and must never change out from under a remap. Used by `remap`/`protect` inside a
/// [`PageTableSpace::cas`] loop.
pub fn update_pte_perms(pte: PageTableEntry, perms: PageTablePerms) -> PageTableEntry {
    PageTableEntry((pte.0 & !X86PageTableFlags::PROTECT_MASK.bits()) | flags_from_perms(perms).bits())
}

pub fn get_pte_frame(pte: PageTableEntry) -> PhysFrameNum {
    PhysFrameNum::new(((pte.0 & PADDR_MASK) >> PAGE_SHIFT) as usize)
}

pub fn pte_is_present(pte: PageTableEntry, _level: usize) -> bool {
    X86PageTableFlags::from_bits_truncate(pte.0).contains(X86PageTableFlags::PRESENT)
}

pub fn pte_is_terminal(pte: PageTableEntry, level: usize) -> bool {
    if level == 0 {
        true
    } else {
        X86PageTableFlags::from_bits_truncate(pte.0).contains(X86PageTableFlags::LARGE)
    }
}

pub fn pte_is_accessed(pte: PageTableEntry) -> bool {
    X86PageTableFlags::from_bits_truncate(pte.0).contains(X86PageTableFlags::ACCESSED)
}

pub fn pte_is_dirty(pte: PageTableEntry) -> bool {
    X86PageTableFlags::from_bits_truncate(pte.0).contains(X86PageTableFlags::DIRTY)
}

fn init_mmu_regs() {
    unsafe {
        let mut cr0 = read_cr0();
        cr0 &= !(Cr0::CD | Cr0::NW);
        cr0 |= Cr0::WP;
        write_cr0(cr0);

        // Global pages will be enabled once the PAT is set up.
        let cr4 = read_cr4();
        write_cr4(cr4 & !Cr4::PGE);

        if cpuid_nx_supported() {
            write_ia32_efer(read_ia32_efer() | Ia32Efer::NXE);
        }
    }
}

fn init_pat() {
    // See ISDM 3A, section 11.12.4 and 11.11.8 on recommended procedure here. We probably don't
    // need a lot of the MTRR-related stuff, but keep it in just in case.
    unsafe {
        // 4. Enter the no-fill cache mode
        let cr0 = read_cr0();
        write_cr0(cr0 | Cr0::CD);

        // 5. Flush all caches with `wbinvd`
        wbinvd();

        // 6-7. Flush TLB
        // We intentionally use this sequence since global pages are not enabled yet (we do that
        // later, precisely so we can avoid repeated toggling of `PGE`).
        write_cr3(read_cr3());

        // 8. Disable all MTRRs by clearing the `E` flag in `MTRR_DEF_TYPE`
        let mut mtrr_def_type = read_mtrr_def_type();
        write_mtrr_def_type(mtrr_def_type & !MTRR_DEF_TYPE_E);

        // 9. Update the MTRRs and PAT

        write_pat(
            PA0_VAL
                | (PA1_VAL << 8)
                | (PA2_VAL << 16)
                | (PA3_VAL << 24)
                | (PA4_VAL << 32)
                | (PA5_VAL << 40)
                | (PA6_VAL << 48)
                | (PA7_VAL << 56),
        );

        // Override the default memory type to UC for consistency, all of our page tables should be
        // mapping WB (PAT index 0) by default anyway.
        mtrr_def_type = (mtrr_def_type & !MTRR_DEF_TYPE_TYPE_MASK) | MEM_TYPE_UC;

        // 10. Re-enable MTRRs
        write_mtrr_def_type(mtrr_def_type);

        // 11. Flush caches and TLB once more
        wbinvd();
        write_cr3(read_cr3());

        // 12. Restore normal cache operation
        write_cr0(cr0);

        // Now that the PAT is set up, enable global pages so we can start using them.
        write_cr4(read_cr4() | Cr4::PGE);
    }
}

/// Translates the protection bits of `perms` (Writable, NX) to their hardware flags. Deliberately
/// does not touch User or Global: those are decided by context kind, not by a caller-supplied
/// access mask, so [`make_terminal_pte`] and [`update_pte_perms`] set them separately.
fn flags_from_perms(perms: PageTablePerms) -> X86PageTableFlags {
    let mut x86_flags = X86PageTableFlags::empty();

    x86_flags.set(
        X86PageTableFlags::WRITABLE,
        perms.contains(PageTablePerms::WRITE),
    );
    x86_flags.set(
        X86PageTableFlags::NO_EXEC,
        !perms.contains(PageTablePerms::EXECUTE),
    );

    x86_flags
}

fn pat_selector_for_cache_mode(cache_mode: CacheMode) -> u64 {
    match cache_mode {
        CacheMode::Cached => PAT_SELECTOR_WB,
        CacheMode::WriteCombining => PAT_SELECTOR_WC,
        // AMD64 has no PAT entry stronger than uncacheable, so `Device` collapses to the same
        // selector as `Uncached`; see the type's doc comment.
        CacheMode::Device | CacheMode::Uncached => PAT_SELECTOR_UC,
    }
}

fn pat_selector_to_pte_bits(pat_selector: u64, level: usize) -> u64 {
    // Split the 3 bits of the pat selector across the `PWT`, `PCD` and `PAT` bits. The PAT bit
    // lives at a different offset for large pages than for 4 KiB leaves (ISDM 3A, section 4.5.4).
    ((pat_selector & 0b001) << 3)
        | ((pat_selector & 0b010) << 4)
        | (((pat_selector & 0b100) >> 2) << pat_bit_position(level))
}

fn pat_bit_position(level: usize) -> u64 {
    if level > 0 {
        12
    } else {
        7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_pte_roundtrips_frame_and_perms() {
        let frame = PhysFrameNum::new(0x1234);
        let pte = make_terminal_pte(0, frame, PageTablePerms::WRITE, CacheMode::Cached, true);

        assert!(pte_is_present(pte, 0));
        assert!(pte_is_terminal(pte, 0));
        assert_eq!(get_pte_frame(pte), frame);
    }

    #[test]
    fn terminal_pte_derives_user_and_global_from_context_not_perms() {
        let frame = PhysFrameNum::new(0x1234);

        let user_pte = make_terminal_pte(0, frame, PageTablePerms::GLOBAL, CacheMode::Cached, true);
        let user_flags = X86PageTableFlags::from_bits_truncate(user_pte.0);
        assert!(user_flags.contains(X86PageTableFlags::USER_MODE));
        assert!(!user_flags.contains(X86PageTableFlags::GLOBAL));

        let kernel_pte = make_terminal_pte(0, frame, PageTablePerms::USER, CacheMode::Cached, false);
        let kernel_flags = X86PageTableFlags::from_bits_truncate(kernel_pte.0);
        assert!(!kernel_flags.contains(X86PageTableFlags::USER_MODE));
        assert!(kernel_flags.contains(X86PageTableFlags::GLOBAL));
    }

    #[test]
    fn update_perms_preserves_frame() {
        let frame = PhysFrameNum::new(0x5);
        let pte = make_terminal_pte(0, frame, PageTablePerms::WRITE, CacheMode::Cached, false);
        let updated = update_pte_perms(pte, PageTablePerms::EXECUTE);

        assert_eq!(get_pte_frame(updated), frame);
        assert!(!X86PageTableFlags::from_bits_truncate(updated.0).contains(X86PageTableFlags::WRITABLE));
    }

    #[test]
    fn update_perms_preserves_user_and_global() {
        let frame = PhysFrameNum::new(0x5);
        let pte = make_terminal_pte(0, frame, PageTablePerms::WRITE, CacheMode::Cached, true);
        let updated = update_pte_perms(pte, PageTablePerms::EXECUTE);

        let flags = X86PageTableFlags::from_bits_truncate(updated.0);
        assert!(flags.contains(X86PageTableFlags::USER_MODE));
        assert!(!flags.contains(X86PageTableFlags::GLOBAL));
    }

    #[test]
    fn space_cas_retries_on_concurrent_update() {
        let space = PageTableSpace::new();
        space.store(
            0,
            make_terminal_pte(0, PhysFrameNum::new(1), PageTablePerms::WRITE, CacheMode::Cached, false),
        );

        // Simulate a hardware Accessed-bit update landing between the CAS loop's read and write.
        let mut first = true;
        let prior = space.cas(0, |pte| {
            if first {
                first = false;
                space.entries[0].fetch_or(X86PageTableFlags::ACCESSED.bits(), Ordering::Relaxed);
            }
            update_pte_perms(pte, PageTablePerms::EXECUTE)
        });

        // The retry picked up the concurrently-set Accessed bit as its baseline, so the caller
        // (which decides whether to enqueue an invalidation) observes it rather than losing it.
        assert!(pte_is_accessed(prior));

        let installed = space.load(0);
        assert!(pte_is_accessed(installed));
        assert!(!X86PageTableFlags::from_bits_truncate(installed.0).contains(X86PageTableFlags::WRITABLE));
    }

    #[test]
    fn clear_and_read_returns_prior_entry_and_zeroes_slot() {
        let space = PageTableSpace::new();
        let frame = PhysFrameNum::new(7);
        space.store(
            0,
            make_terminal_pte(0, frame, PageTablePerms::WRITE, CacheMode::Cached, false),
        );

        let prior = space.clear_and_read(0);
        assert_eq!(get_pte_frame(prior), frame);
        assert!(!pte_is_present(space.load(0), 0));
    }
}
