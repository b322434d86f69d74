/*
 * Kestrel Kernel Entry Point
 *
 * Bare-metal Rust kernel entry for a bootloader following the BOOTBOOT
 * hand-off convention: a fixed-layout boot record (`bootinfo::BootInfo`) is
 * mapped at a known virtual address before `_start` runs on every core.
 *
 * Boot sequence on the bootstrap processor:
 *  - switch off the tiny entry stack onto a real BSP stack
 *  - debug/logging infrastructure, so every later step narrates
 *  - GDT, then IDT (must precede the CR3 switch memory init performs)
 *  - SYSCALL/SYSRET MSR setup
 *  - memory subsystem bootstrap
 *
 * Application processors park themselves in a halt loop; this kernel has no
 * scheduler to hand them work.
 */

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

extern crate alloc;

use core::panic::PanicInfo;

mod arch;
mod bootinfo;
mod drivers;
mod io;
mod memory;
mod syscall;
mod utils;

#[repr(C, align(16))]
pub struct AlignedBspStack([u8; 64 * 1024]);

#[unsafe(no_mangle)]
pub static mut BSP_STACK: AlignedBspStack = AlignedBspStack([0; 64 * 1024]);

/// Called directly by the bootloader on every core. Identifies the
/// bootstrap processor by comparing its local APIC ID against the boot
/// record's `bspid`, switches to a dedicated stack, and jumps into `kstart`.
/// Application processors park in a halt loop.
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "mov eax, 1",
        "cpuid",
        "shr ebx, 24",

        "lea rax, [rip + bootboot]",
        "movzx ecx, word ptr [rax + 0x0C]",

        "cmp ebx, ecx",
        "jne 2f",

        "lea rax, [rip + BSP_STACK]",
        "add rax, {stack_size}",
        "mov rsp, rax",

        "jmp kstart",

        "2:",
        "1:",
        "hlt",
        "jmp 1b",

        stack_size = const 64 * 1024,
    );
}

#[unsafe(no_mangle)]
pub extern "C" fn kstart() -> ! {
    utils::debug::init_debug_infrastructure();

    utils::debug::logger::init(true);
    log::info!("Kestrel kernel starting...");

    arch::x86_64::gdt::init();

    // Must run before memory::initialize_memory: an exception during the
    // CR3 switch with no IDT loaded triple-faults the CPU.
    arch::x86_64::idt::init();

    syscall::init();

    log::info!("Initializing memory management...");
    let boot_info = unsafe { &bootinfo::bootboot };
    match memory::initialize_memory(boot_info) {
        Ok(()) => log::info!("Memory management initialized successfully"),
        Err(e) => panic!("memory initialization failed: {}", e),
    }

    {
        use alloc::vec::Vec;
        let mut test_vec = Vec::new();
        test_vec.push(42);
        test_vec.push(1337);
        log::info!("Heap test successful: {:?}", test_vec);
    }

    log::info!("Kernel initialization complete, idling");

    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        x86_64::instructions::hlt();
    }
}
