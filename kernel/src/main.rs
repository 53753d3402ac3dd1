//! Nostalgia OS Kernel
//!
//! A minimal x86_64 kernel whose sole job at this stage is bringing up
//! the memory manager: seeding its memory descriptor list before any
//! pool exists, folding in the UEFI memory map handed down by the
//! bootloader, and then switching the list's own bookkeeping over to
//! pool-backed storage once the pool allocator is online.

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]
#![allow(static_mut_refs)]
#![allow(dead_code)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::declare_interior_mutable_const)]

extern crate alloc;

pub mod mm;

mod serial;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Boot information passed from the bootloader.
/// Must match the bootloader's BootInfo structure exactly!
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// Magic number for validation.
    pub magic: u64,
    /// Physical address of the framebuffer.
    pub framebuffer_addr: u64,
    /// Framebuffer width in pixels.
    pub framebuffer_width: u32,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u32,
    /// Framebuffer stride (bytes per row).
    pub framebuffer_stride: u32,
    /// Bytes per pixel.
    pub framebuffer_bpp: u32,
    /// Physical address of the memory map.
    pub memory_map_addr: u64,
    /// Number of memory map entries.
    pub memory_map_entries: u64,
    /// Size of each memory map entry.
    pub memory_map_entry_size: u64,
    /// Physical address of the kernel.
    pub kernel_physical_base: u64,
    /// Virtual address of the kernel.
    pub kernel_virtual_base: u64,
    /// Size of the kernel in bytes.
    pub kernel_size: u64,
    /// Physical address of the PML4 table.
    pub pml4_physical_addr: u64,
    /// ACPI RSDP address (if found).
    pub rsdp_addr: u64,
}

impl BootInfo {
    pub const MAGIC: u64 = 0x4E4F5354414C4749; // "NOSTALGI" in ASCII

    /// Validate the boot info structure.
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC
    }
}

/// Global boot info pointer.
static BOOT_INFO: AtomicPtr<BootInfo> = AtomicPtr::new(core::ptr::null_mut());

/// Get the boot info.
pub fn boot_info() -> Option<&'static BootInfo> {
    let ptr = BOOT_INFO.load(Ordering::Relaxed);
    if ptr.is_null() {
        None
    } else {
        unsafe { Some(&*ptr) }
    }
}

// BSS section symbols from linker script.
extern "C" {
    static __bss_start: u8;
    static __bss_end: u8;
}

/// Zero the .bss section.
///
/// # Safety
/// Must be called exactly once at the very start of kernel execution,
/// before any statics are accessed.
#[inline(never)]
unsafe fn zero_bss() {
    let start = &__bss_start as *const u8 as *mut u8;
    let end = &__bss_end as *const u8 as *mut u8;
    let size = end as usize - start as usize;

    for i in 0..size {
        core::ptr::write_volatile(start.add(i), 0);
    }
}

/// Static copy of boot info (placed in .data, not .bss).
static mut BOOT_INFO_COPY: BootInfo = BootInfo {
    magic: 0,
    framebuffer_addr: 0,
    framebuffer_width: 0,
    framebuffer_height: 0,
    framebuffer_stride: 0,
    framebuffer_bpp: 0,
    memory_map_addr: 0,
    memory_map_entries: 0,
    memory_map_entry_size: 0,
    kernel_physical_base: 0,
    kernel_virtual_base: 0,
    kernel_size: 0,
    pml4_physical_addr: 0,
    rsdp_addr: 0,
};

/// Halt the CPU until the next interrupt.
#[inline(always)]
fn halt() {
    unsafe { core::arch::asm!("hlt") };
}

/// Kernel entry point, called by the bootloader.
///
/// The bootloader passes a pointer to BootInfo in RDI (System V ABI).
#[no_mangle]
pub extern "C" fn kernel_main(boot_info_ptr: *const BootInfo) -> ! {
    // CRITICAL: copy boot_info before zeroing .bss. The bootloader may
    // have placed it in our .bss region.
    let saved_boot_info = unsafe { core::ptr::read_volatile(boot_info_ptr) };

    unsafe { zero_bss() };
    unsafe { BOOT_INFO_COPY = saved_boot_info };

    serial::early_puts(b"K\n");
    serial_println!("Kernel entry point reached!");

    BOOT_INFO.store(&raw mut BOOT_INFO_COPY, Ordering::SeqCst);
    let boot_info = unsafe { &BOOT_INFO_COPY };
    serial_println!("Boot info ptr: {:#x}", boot_info_ptr as u64);
    serial_println!("Boot info magic: {:#x}", boot_info.magic);

    if !boot_info.is_valid() {
        serial_println!("FATAL: Invalid boot info magic!");
        loop {
            halt();
        }
    }
    serial_println!("Boot info validated OK");

    serial_println!("========================================");
    serial_println!("  Nostalgia OS Kernel v0.1.0");
    serial_println!("========================================");

    serial_println!("[MM] Initializing memory manager...");
    unsafe {
        mm::init(boot_info);
    }
    serial_println!("[MM] Memory manager initialized");

    demo_mdl_usage();

    serial_println!("Kernel initialization complete!");
    serial_println!("Entering idle loop...");
    idle_loop()
}

/// Exercises the memory descriptor list once it is fully brought up:
/// a lookup, a strategy-based allocation, and a released range, with
/// the running audit printed after each step.
fn demo_mdl_usage() {
    use mm::mdl::AllocStrategy;

    serial_println!("[MM] Memory descriptor list summary:");
    mm::mdl_print();

    match mm::mdl_allocate(64 * 1024, AllocStrategy::LowestAddress) {
        Ok(base) => serial_println!("[MM] Allocated 64KiB at {:#x}", base),
        Err(e) => serial_println!("[MM] Allocation failed: {:?}", e),
    }

    mm::mdl_print();
}

/// Kernel idle loop.
///
/// Runs when there is nothing else to do. Halts the CPU until an
/// interrupt arrives.
fn idle_loop() -> ! {
    loop {
        halt();
    }
}

/// Panic handler.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("");
    serial_println!("!!! KERNEL PANIC !!!");
    serial_println!("{}", info);

    loop {
        halt();
    }
}

/// Allocation error handler.
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("Allocation failed: {:?}", layout);
}
