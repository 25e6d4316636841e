#![feature(alloc_error_handler)]
#![feature(asm_const)]
#![feature(allocator_api)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use arch::cpu;
use mm::types::PhysAddr;

use crate::mm::context::MmuContext;
use crate::mm::types::PageTablePerms;
use crate::mm::MappingPointer;
use crate::sync::irq::IrqDisabled;

mod arch;
#[macro_use]
mod console;
mod err;
mod global_alloc;
mod kimage;
mod logging;
mod mm;
mod panic;
mod sync;

#[derive(Debug, Clone, Copy)]
#[repr(align(512))]
struct AlignedU32(u32);

#[no_mangle]
extern "C" fn kernel_main(
    kernel_paddr: PhysAddr,
    bootinfo_paddr: PhysAddr,
    bootinfo_size: usize,
) -> ! {
    // Safety: main is called with interrupts disabled.
    let irq_disabled = unsafe { IrqDisabled::new() };

    console::init();
    logging::init();

    unsafe {
        kimage::init(kernel_paddr);
    }

    println!(
        "kernel loaded at {}-{}, mapped at {}-{}",
        kimage::phys_base().addr(),
        kimage::phys_end().addr(),
        kimage::virt_base().addr(),
        kimage::virt_end().addr()
    );

    println!("bootinfo at {}, size {:#x}", bootinfo_paddr, bootinfo_size);

    // Safety: we are the BSP, running with interrupts disabled, early in bring-up.
    unsafe {
        arch::mmu::init_early(&irq_disabled);
    }

    println!("initializing memory manager");
    unsafe {
        mm::init(bootinfo_paddr, bootinfo_size, &irq_disabled);
        arch::mmu::finish_init_kernel_pt();
    }
    println!("memory manager initialized");

    // Safety: we are the BSP, and this is the first and only time it registers itself.
    let bsp = unsafe { arch::percpu::init_current() };
    // Safety: `init_early` has already run on the BSP.
    unsafe {
        arch::mmu::init_percpu();
    }

    let kernel_ctx = MmuContext::kernel();
    // Safety: the kernel context is always valid to load; this just makes the per-CPU residency
    // tracking match what boot.s already set up in CR3.
    unsafe {
        kernel_ctx.load();
    }
    println!("CPU {} online, kernel context loaded", bsp.as_usize());

    remap_kernel_image(&kernel_ctx);

    mm::heap::dump_size_classes();

    let x = Box::new(AlignedU32(5));
    let y = Box::new(AlignedU32(7));
    println!("x: {:?} ({:p}), y: {:?} ({:p})", *x, x, *y, y);

    mm::pmm::dump_usage();

    cpu::halt();
}

/// Tightens the kernel image's segments to their final permissions: text RX, rodata RO, data
/// RW, all NX except text, and the init segment RWX (it may still be patched by later bring-up
/// code, e.g. AP trampoline relocation).
///
/// `boot.s` has already mapped the whole image RWX so that `kernel_main` itself can execute and
/// write its own static data before the memory manager exists to do anything smarter; this just
/// narrows those mappings down to what each segment actually needs, in place.
fn remap_kernel_image(kernel_ctx: &MmuContext) {
    let segments = [
        (kimage::code_base(), kimage::code_end(), PageTablePerms::EXECUTE),
        (kimage::rodata_base(), kimage::rodata_end(), PageTablePerms::empty()),
        (kimage::data_base(), kimage::data_end(), PageTablePerms::WRITE),
        (
            kimage::init_base(),
            kimage::init_end(),
            PageTablePerms::WRITE | PageTablePerms::EXECUTE,
        ),
    ];

    kernel_ctx.lock();
    for (base, end, perms) in segments {
        let mut pointer = MappingPointer::new(base, end - base);
        // Safety: the lock is held, and every page in a kernel image segment is already present
        // (mapped by `boot.s` before `kernel_main` runs); this only rewrites protection bits.
        unsafe {
            kernel_ctx
                .remap(&mut pointer, perms)
                .expect("failed to remap kernel image segment");
        }
    }
    kernel_ctx.unlock(&arch::percpu::BspOnly, &arch::percpu::BspOnly);

    println!("kernel image segments remapped to final permissions");
}
