use core::arch::asm;

use super::x64_cpu::get_rflags;

const RFLAGS_IF: u64 = 1 << 9;

#[inline]
pub fn halt() -> ! {
    unsafe {
        asm!("cli", options(nomem, nostack));
        loop {
            asm!("hlt", options(nomem, nostack));
        }
    }
}

/// Returns whether interrupts are currently enabled on this CPU.
#[inline]
pub fn irq_enabled() -> bool {
    get_rflags() & RFLAGS_IF != 0
}

/// Enables interrupts on this CPU.
///
/// # Safety
///
/// The caller must ensure that the kernel is prepared to take interrupts, e.g. that any
/// currently-held locks are not required by an interrupt handler.
#[inline]
pub unsafe fn enable_irq() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Disables interrupts on this CPU.
///
/// # Safety
///
/// The caller must ensure that any code relying on interrupts remaining enabled (e.g. to be
/// preempted) tolerates them being masked for the duration.
#[inline]
pub unsafe fn disable_irq() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}
