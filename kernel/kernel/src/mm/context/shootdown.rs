//! Per-context pending-invalidation queue and the cross-CPU TLB-shootdown dispatch triggered when
//! a context's outermost lock is released.
//!
//! The teacher has no multi-core shootdown implementation at all (its `SpinLock`-guarded state is
//! single-core only); this module is new, grounded in the shape of the teacher's per-CPU
//! infrastructure ([`crate::arch::percpu`]) generalized behind two small traits so a consuming
//! kernel can supply whatever IPI mechanism it has (out of scope here, per the crate's boundary).

use arrayvec::ArrayVec;

use crate::arch::mmu::{flush_tlb_current_context, flush_tlb_full, flush_tlb_page};
use crate::arch::percpu::{CpuId, MAX_CPUS};

use super::super::pt::GatherInvalidations;
use super::super::types::{PhysFrameNum, VirtPageNum};

/// Capacity of a context's pending-invalidation queue. Chosen the way the teacher sizes small
/// fixed-capacity buffers (see `PerCpu`'s run queue): large enough that the common case (a handful
/// of pages touched under one lock) never spills into a full flush.
pub const Q: usize = 128;

/// The state machine a context's queue moves through between one outermost lock and the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No mutation requiring invalidation has happened since the last flush.
    Empty,
    /// `count` addresses are recorded and precisely describe what must be invalidated.
    NonEmpty,
    /// More than `Q` addresses were recorded; a full flush must be used instead of per-address
    /// invalidation, since the queue no longer remembers which addresses they were.
    Saturated,
}

/// A context's record of virtual pages that need TLB invalidation on other CPUs, accumulated while
/// its lock is held.
pub struct InvalQueue {
    addrs: [VirtPageNum; Q],
    count: usize,
}

impl InvalQueue {
    pub const fn new() -> Self {
        Self {
            addrs: [VirtPageNum::new(0); Q],
            count: 0,
        }
    }

    pub fn state(&self) -> QueueState {
        match self.count {
            0 => QueueState::Empty,
            1..=Q => QueueState::NonEmpty,
            _ => QueueState::Saturated,
        }
    }

    /// Records `vpn` as needing invalidation. Once the queue has recorded `Q` entries, further
    /// pushes only bump the count (saturating it past `Q`) without remembering the address, moving
    /// the queue into [`QueueState::Saturated`].
    pub fn push(&mut self, vpn: VirtPageNum) {
        if self.count < Q {
            self.addrs[self.count] = vpn;
        }
        self.count += 1;
    }

    /// The recorded addresses, valid only while [`InvalQueue::state`] is [`QueueState::NonEmpty`].
    pub fn addrs(&self) -> &[VirtPageNum] {
        &self.addrs[..self.count.min(Q)]
    }

    /// Resets the queue to empty. Called once its contents have been fully flushed.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for InvalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds a context's mutations into its [`InvalQueue`], additionally performing the immediate local
/// invalidation the context lock's mutators require when the context is loaded on the current CPU.
///
/// Constructed fresh for each call to `map`/`unmap`/`remap` made under the lock, since whether the
/// context is loaded locally can only change while the lock is not held.
pub struct ContextGather<'a> {
    queue: &'a mut InvalQueue,
    locally_loaded: bool,
}

impl<'a> ContextGather<'a> {
    pub fn new(queue: &'a mut InvalQueue, locally_loaded: bool) -> Self {
        Self {
            queue,
            locally_loaded,
        }
    }
}

impl GatherInvalidations for ContextGather<'_> {
    fn add_tlb_flush(&mut self, vpn: VirtPageNum) {
        self.queue.push(vpn);

        // Keeps this CPU's own view consistent for any subsequent read under the same lock hold;
        // the remote CPUs are caught up only once the outermost unlock fires the real shootdown.
        if self.locally_loaded {
            flush_tlb_page(vpn);
        }
    }
}

/// Answers "who might have a stale TLB entry for this context" on behalf of the shootdown
/// dispatcher. Implemented by the consuming kernel's scheduler/MP layer.
pub trait CpuDirectory {
    /// The CPU executing the call into this trait.
    fn current_cpu(&self) -> CpuId;

    /// Every CPU that currently has `root` loaded as its active address space.
    fn cpus_using(&self, root: PhysFrameNum) -> ArrayVec<CpuId, MAX_CPUS>;
}

/// A synchronous inter-processor call mechanism. Implemented by the consuming kernel; both methods
/// must not return until every targeted CPU has completed the requested work.
pub trait IpiTransport {
    /// Runs `f` on `cpu` and blocks until it has completed.
    fn call_single(&self, cpu: CpuId, f: &mut dyn FnMut());

    /// Runs `f` on every online CPU other than the caller, and blocks until all have completed.
    fn broadcast(&self, f: &mut dyn FnMut());
}

/// Dispatches the shootdown implied by `queue`'s current state and resets it to empty.
///
/// `is_kernel` selects the kernel context's broadcast-everyone fan-out (per the kernel-half-sharing
/// invariant, every other CPU may be using the kernel context); non-kernel contexts instead query
/// `directory` for the precise set of CPUs using `root`. The calling CPU is never re-targeted: its
/// local view was already kept current by [`ContextGather`] as each mutation was made.
///
/// # Panics
///
/// IPI dispatch failure is a programmer error per the core's error-handling design: there is no
/// safe way to continue if a remote TLB might retain a stale translation, so a transport that
/// cannot deliver its call must panic rather than return an error here.
pub fn flush_on_unlock(
    queue: &mut InvalQueue,
    is_kernel: bool,
    root: PhysFrameNum,
    directory: &impl CpuDirectory,
    ipi: &impl IpiTransport,
) {
    let state = queue.state();
    if state == QueueState::Empty {
        return;
    }

    let current = directory.current_cpu();

    if is_kernel {
        match state {
            QueueState::Empty => unreachable!(),
            QueueState::NonEmpty => {
                let addrs = queue.addrs().to_owned_array();
                ipi.broadcast(&mut || {
                    for vpn in addrs.iter().copied() {
                        flush_tlb_page(vpn);
                    }
                });
            }
            QueueState::Saturated => {
                ipi.broadcast(&mut flush_tlb_full);
            }
        }
    } else {
        let targets = directory.cpus_using(root);

        match state {
            QueueState::Empty => unreachable!(),
            QueueState::NonEmpty => {
                let addrs = queue.addrs().to_owned_array();
                for cpu in targets {
                    if cpu == current {
                        continue;
                    }
                    ipi.call_single(cpu, &mut || {
                        for vpn in addrs.iter().copied() {
                            flush_tlb_page(vpn);
                        }
                    });
                }
            }
            QueueState::Saturated => {
                for cpu in targets {
                    if cpu == current {
                        continue;
                    }
                    ipi.call_single(cpu, &mut flush_tlb_current_context);
                }
            }
        }
    }

    queue.reset();
}

trait ToOwnedArray {
    fn to_owned_array(&self) -> ArrayVec<VirtPageNum, Q>;
}

impl ToOwnedArray for [VirtPageNum] {
    fn to_owned_array(&self) -> ArrayVec<VirtPageNum, Q> {
        self.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use super::*;

    #[test]
    fn queue_transitions_empty_nonempty_saturated() {
        let mut queue = InvalQueue::new();
        assert_eq!(queue.state(), QueueState::Empty);

        queue.push(VirtPageNum::new(1));
        assert_eq!(queue.state(), QueueState::NonEmpty);

        for i in 0..Q {
            queue.push(VirtPageNum::new(i));
        }
        assert_eq!(queue.state(), QueueState::Saturated);

        queue.reset();
        assert_eq!(queue.state(), QueueState::Empty);
    }

    struct FakeDirectory {
        current: CpuId,
        using: ArrayVec<CpuId, MAX_CPUS>,
    }

    impl CpuDirectory for FakeDirectory {
        fn current_cpu(&self) -> CpuId {
            self.current
        }

        fn cpus_using(&self, _root: PhysFrameNum) -> ArrayVec<CpuId, MAX_CPUS> {
            self.using.clone()
        }
    }

    struct RecordingIpi {
        single_calls: RefCell<ArrayVec<CpuId, MAX_CPUS>>,
        broadcasts: RefCell<usize>,
    }

    impl IpiTransport for RecordingIpi {
        fn call_single(&self, cpu: CpuId, f: &mut dyn FnMut()) {
            f();
            self.single_calls.borrow_mut().push(cpu);
        }

        fn broadcast(&self, f: &mut dyn FnMut()) {
            f();
            *self.broadcasts.borrow_mut() += 1;
        }
    }

    #[test]
    fn user_context_targets_only_cpus_using_it_excluding_self() {
        let mut queue = InvalQueue::new();
        queue.push(VirtPageNum::new(0x10));

        let directory = FakeDirectory {
            current: CpuId::new(0),
            using: ArrayVec::from_iter([CpuId::new(0), CpuId::new(1), CpuId::new(2)]),
        };
        let ipi = RecordingIpi {
            single_calls: RefCell::new(ArrayVec::new()),
            broadcasts: RefCell::new(0),
        };

        flush_on_unlock(&mut queue, false, PhysFrameNum::new(7), &directory, &ipi);

        assert_eq!(queue.state(), QueueState::Empty);
        assert_eq!(*ipi.single_calls.borrow(), [CpuId::new(1), CpuId::new(2)]);
        assert_eq!(*ipi.broadcasts.borrow(), 0);
    }

    #[test]
    fn kernel_context_broadcasts() {
        let mut queue = InvalQueue::new();
        queue.push(VirtPageNum::new(0x10));

        let directory = FakeDirectory {
            current: CpuId::new(0),
            using: ArrayVec::new(),
        };
        let ipi = RecordingIpi {
            single_calls: RefCell::new(ArrayVec::new()),
            broadcasts: RefCell::new(0),
        };

        flush_on_unlock(&mut queue, true, PhysFrameNum::new(7), &directory, &ipi);

        assert_eq!(*ipi.broadcasts.borrow(), 1);
        assert!(ipi.single_calls.borrow().is_empty());
    }

    #[test]
    fn empty_queue_performs_no_shootdown() {
        let mut queue = InvalQueue::new();
        let directory = FakeDirectory {
            current: CpuId::new(0),
            using: ArrayVec::new(),
        };
        let ipi = RecordingIpi {
            single_calls: RefCell::new(ArrayVec::new()),
            broadcasts: RefCell::new(0),
        };

        flush_on_unlock(&mut queue, true, PhysFrameNum::new(7), &directory, &ipi);
        assert_eq!(*ipi.broadcasts.borrow(), 0);
    }
}
