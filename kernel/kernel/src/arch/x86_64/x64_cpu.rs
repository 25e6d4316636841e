use core::arch::asm;

use bitflags::bitflags;

const IA32_EFER: u32 = 0xc000_0080;
const IA32_PAT: u32 = 0x277;
const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u64 {
        const WP = 1 << 16;
        const NW = 1 << 29;
        const CD = 1 << 30;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4: u64 {
        const PGE = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ia32Efer: u64 {
        const NXE = 1 << 11;
    }
}

#[inline]
pub fn get_rflags() -> u64 {
    let rflags: u64;
    unsafe {
        asm!("pushf; pop {}", out(reg) rflags);
    }
    rflags
}

#[inline]
pub unsafe fn read_cr0() -> Cr0 {
    let val: u64;
    unsafe {
        asm!("mov {}, cr0", out(reg) val, options(nomem, nostack));
    }
    Cr0::from_bits_truncate(val)
}

#[inline]
pub unsafe fn write_cr0(val: Cr0) {
    unsafe {
        asm!("mov cr0, {}", in(reg) val.bits(), options(nomem, nostack));
    }
}

#[inline]
pub unsafe fn read_cr3() -> u64 {
    let val: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) val, options(nomem, nostack));
    }
    val
}

#[inline]
pub unsafe fn write_cr3(val: u64) {
    unsafe {
        asm!("mov cr3, {}", in(reg) val, options(nomem, nostack));
    }
}

#[inline]
pub unsafe fn read_cr4() -> Cr4 {
    let val: u64;
    unsafe {
        asm!("mov {}, cr4", out(reg) val, options(nomem, nostack));
    }
    Cr4::from_bits_truncate(val)
}

#[inline]
pub unsafe fn write_cr4(val: Cr4) {
    unsafe {
        asm!("mov cr4, {}", in(reg) val.bits(), options(nomem, nostack));
    }
}

#[inline]
unsafe fn read_msr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

#[inline]
unsafe fn write_msr(msr: u32, val: u64) {
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") val as u32,
            in("edx") (val >> 32) as u32,
            options(nomem, nostack),
        );
    }
}

#[inline]
pub unsafe fn read_ia32_efer() -> Ia32Efer {
    Ia32Efer::from_bits_truncate(unsafe { read_msr(IA32_EFER) })
}

#[inline]
pub unsafe fn write_ia32_efer(val: Ia32Efer) {
    unsafe { write_msr(IA32_EFER, val.bits()) }
}

#[inline]
pub unsafe fn write_pat(val: u64) {
    unsafe { write_msr(IA32_PAT, val) }
}

#[inline]
pub unsafe fn read_mtrr_def_type() -> u64 {
    unsafe { read_msr(IA32_MTRR_DEF_TYPE) }
}

#[inline]
pub unsafe fn write_mtrr_def_type(val: u64) {
    unsafe { write_msr(IA32_MTRR_DEF_TYPE, val) }
}

#[inline]
pub unsafe fn wbinvd() {
    unsafe {
        asm!("wbinvd", options(nomem, nostack));
    }
}

/// Queries via CPUID whether the processor supports the No-Execute page bit (`EFER.NXE`).
///
/// Checks the extended-function leaf count before reading leaf `0x8000_0001`, since CPUID leaves
/// above `0x8000_0000` are only defined when the processor reports support for them.
pub fn cpuid_nx_supported() -> bool {
    let max_extended = cpuid(0x8000_0000).0;
    if max_extended < 0x8000_0001 {
        return false;
    }

    let (_, _, _, edx) = cpuid(0x8000_0001);
    edx & (1 << 20) != 0
}

/// Writes the current CPU's `GS.base` via the `wrgsbase` instruction, used to stash a per-CPU
/// identifier that survives task switches without touching any descriptor-table state.
///
/// # Safety
///
/// The caller must ensure the CPU supports and has enabled the `FSGSBASE` feature (CR4.FSGSBASE).
#[inline]
pub unsafe fn wrgsbase(val: u64) {
    unsafe {
        asm!("wrgsbase {}", in(reg) val, options(nostack, nomem));
    }
}

/// Reads the current CPU's `GS.base` via the `rdgsbase` instruction.
///
/// # Safety
///
/// The caller must ensure the CPU supports and has enabled the `FSGSBASE` feature (CR4.FSGSBASE).
#[inline]
pub unsafe fn rdgsbase() -> u64 {
    let val: u64;
    unsafe {
        asm!("rdgsbase {}", out(reg) val, options(nostack, nomem));
    }
    val
}

fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx);
    unsafe {
        asm!(
            "cpuid",
            inlateout("eax") leaf => eax,
            lateout("ebx") ebx,
            lateout("ecx") ecx,
            lateout("edx") edx,
            options(nomem, nostack),
        );
    }
    (eax, ebx, ecx, edx)
}
