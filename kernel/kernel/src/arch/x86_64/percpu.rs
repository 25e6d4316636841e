//! Minimal per-CPU bookkeeping: identifying the running CPU and tracking which MMU context each
//! CPU currently has loaded, so that the shootdown coordinator knows which CPUs to target.
//!
//! Descriptor tables, interrupt stacks and the rest of the teacher's `X64PerCpu` structure are out
//! of scope here; this module only carries what [`crate::mm::context::shootdown`] needs.

use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;

use super::x64_cpu::{rdgsbase, wrgsbase};
use crate::mm::context::shootdown::{CpuDirectory, IpiTransport};
use crate::mm::types::PhysFrameNum;

/// Upper bound on the number of logical CPUs this kernel can track context residency for.
pub const MAX_CPUS: usize = 64;

const NO_CONTEXT: usize = usize::MAX;

/// Identifies one of the logical CPUs registered via [`init_current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(usize);

impl CpuId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

struct Slot {
    /// The frame of the top-level table currently loaded on this CPU, or `NO_CONTEXT`.
    current_root: AtomicUsize,
}

static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(0);

static SLOTS: [Slot; MAX_CPUS] = {
    const INIT: Slot = Slot {
        current_root: AtomicUsize::new(NO_CONTEXT),
    };
    [INIT; MAX_CPUS]
};

/// Registers the calling CPU, assigning it the next sequential [`CpuId`].
///
/// # Safety
///
/// Must be called exactly once per logical CPU, early in that CPU's bring-up, before any code on
/// it calls [`current`].
pub unsafe fn init_current() -> CpuId {
    let id = ONLINE_CPUS.fetch_add(1, Ordering::Relaxed);
    assert!(id < MAX_CPUS, "too many CPUs for the per-CPU table");

    // Safety: FSGSBASE is required at boot by the rest of the per-CPU infrastructure; stashing a
    // small integer rather than a pointer means there's nothing here for an interrupt handler to
    // dereference incorrectly before this CPU finishes bring-up.
    unsafe {
        wrgsbase(id as u64);
    }

    CpuId::new(id)
}

/// Returns the identity of the calling CPU, as assigned by [`init_current`].
///
/// # Safety
///
/// Must only be called after [`init_current`] has run on this CPU.
pub unsafe fn current() -> CpuId {
    CpuId::new(unsafe { rdgsbase() } as usize)
}

/// The number of CPUs that have called [`init_current`] so far.
pub fn online_count() -> usize {
    ONLINE_CPUS.load(Ordering::Relaxed)
}

/// Records that `cpu` now has `root` loaded as its current address space (`None` if it has none,
/// e.g. during early bring-up).
pub fn set_current_context(cpu: CpuId, root: Option<PhysFrameNum>) {
    SLOTS[cpu.as_usize()]
        .current_root
        .store(root.map_or(NO_CONTEXT, |r| r.as_usize()), Ordering::Release);
}

/// Returns the top-level frame `cpu` currently has loaded, if any.
pub fn current_context(cpu: CpuId) -> Option<PhysFrameNum> {
    let raw = SLOTS[cpu.as_usize()].current_root.load(Ordering::Acquire);
    (raw != NO_CONTEXT).then(|| PhysFrameNum::new(raw))
}

/// Iterates over every CPU that has completed [`init_current`] so far.
pub fn online_cpus() -> impl Iterator<Item = CpuId> {
    (0..online_count()).map(CpuId::new)
}

/// A [`CpuDirectory`]/[`IpiTransport`] pair valid only while the BSP is the sole online CPU.
///
/// Used for the one-time kernel-image segment remap performed during bring-up, before application
/// processors exist to shoot down; a real multi-CPU directory/transport is the consuming kernel's
/// responsibility once its scheduler/MP layer comes online.
pub struct BspOnly;

impl CpuDirectory for BspOnly {
    fn current_cpu(&self) -> CpuId {
        // Safety: the BSP has already registered itself by the time bring-up reaches this point.
        unsafe { current() }
    }

    fn cpus_using(&self, _root: PhysFrameNum) -> ArrayVec<CpuId, MAX_CPUS> {
        online_cpus().collect()
    }
}

impl IpiTransport for BspOnly {
    fn call_single(&self, _cpu: CpuId, _f: &mut dyn FnMut()) {
        unreachable!("BspOnly is only valid while no other CPU is online");
    }

    fn broadcast(&self, _f: &mut dyn FnMut()) {
        // No other CPU is online yet; the BSP's own TLB was already kept current by ContextGather.
    }
}
