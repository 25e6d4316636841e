//! A reentrant per-context spinlock.
//!
//! [`SpinLock`](super::spinlock::SpinLock) cannot be used here: VM code legitimately holds an
//! `MmuContext`'s lock across several `map`/`unmap`/`remap` calls made from nested helpers running
//! on the same CPU, and a plain spinlock would deadlock against itself. `ContextLock` instead
//! tracks the owning CPU and a hold depth, so nested `lock`/`unlock` pairs from the same CPU are
//! free, and the lock is only actually released - and the caller only told the hold is fully
//! released - when the outermost `unlock` completes.

use core::cell::UnsafeCell;
use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::percpu::CpuId;

const FREE: usize = 0;

pub struct ContextLock<T> {
    owner: AtomicUsize,
    depth: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

impl<T> ContextLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(FREE),
            depth: UnsafeCell::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock on behalf of `cpu`. If `cpu` already holds the lock, increments the hold
    /// depth instead of spinning; otherwise spins until the previous owner releases it.
    pub fn lock(&self, cpu: CpuId) {
        let token = Self::token(cpu);

        if self.owner.load(Ordering::Relaxed) == token {
            // Safety: only the current holder ever touches `depth`.
            unsafe {
                *self.depth.get() += 1;
            }
            return;
        }

        while self
            .owner
            .compare_exchange_weak(FREE, token, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }

        // Safety: we just became the sole owner.
        unsafe {
            *self.depth.get() = 1;
        }
    }

    /// Releases one level of hold on behalf of `cpu`. Returns `true` if this was the outermost
    /// unlock: the hold depth dropped to zero and the lock is now free for other CPUs.
    ///
    /// If this is the outermost unlock, `on_outermost` is run against the protected data while
    /// this CPU still exclusively holds the lock, and only afterwards is the lock marked free -
    /// so outermost-only work (such as flushing queued TLB invalidations) can never race a
    /// different CPU's subsequent lock/mutate sequence.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` does not currently hold the lock.
    pub fn unlock(&self, cpu: CpuId, on_outermost: impl FnOnce(&mut T)) -> bool {
        let token = Self::token(cpu);
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            token,
            "context lock released by non-owner"
        );

        // Safety: we are the current owner.
        unsafe {
            let depth = &mut *self.depth.get();
            *depth -= 1;

            if *depth == 0 {
                on_outermost(&mut *self.data.get());
                self.owner.store(FREE, Ordering::Release);
                true
            } else {
                false
            }
        }
    }

    /// Returns a reference to the protected data.
    ///
    /// # Safety
    ///
    /// The caller must currently hold the lock.
    pub unsafe fn get(&self) -> &T {
        unsafe { &*self.data.get() }
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// # Safety
    ///
    /// The caller must currently hold the lock, and must not alias this reference with another
    /// live reference obtained from [`ContextLock::get`] or [`ContextLock::get_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    fn token(cpu: CpuId) -> usize {
        cpu.as_usize() + 1
    }
}

// Safety: access to the protected data is serialized by the owner/depth protocol above.
unsafe impl<T: Send> Sync for ContextLock<T> {}
unsafe impl<T: Send> Send for ContextLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_lock_only_reports_outermost_unlock() {
        let lock = ContextLock::new(0u32);
        let cpu = CpuId::new(0);

        lock.lock(cpu);
        lock.lock(cpu);
        lock.lock(cpu);

        assert!(!lock.unlock(cpu, |_| panic!("not the outermost unlock")));
        assert!(!lock.unlock(cpu, |_| panic!("not the outermost unlock")));

        let mut ran = false;
        assert!(lock.unlock(cpu, |_| ran = true));
        assert!(ran);
    }

    #[test]
    #[should_panic]
    fn unlock_by_non_owner_panics() {
        let lock = ContextLock::new(0u32);
        lock.lock(CpuId::new(0));
        lock.unlock(CpuId::new(1), |_| {});
    }
}
