pub mod context_lock;
pub mod irq;
pub mod spinlock;

pub use spinlock::SpinLock;
