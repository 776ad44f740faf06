#![no_std]
#![no_main]

extern crate alloc;

mod arch;
mod config;
mod drivers;
mod error;
mod fs;
mod memory;
mod sync;
mod task;
mod traps;
mod util;

use log::info;

/// Kernel entry point called by the Limine bootloader.
#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    util::logger::init();
    info!("booting");

    unsafe {
        memory::address::init_hhdm(arch::boot::get_hhdm_offset());
    }
    memory::pmm::init(arch::boot::get_memory_map());
    info!(
        "pmm initialized: {} MiB free of {} MiB total",
        memory::pmm::free_memory() / (1024 * 1024),
        memory::pmm::total_memory() / (1024 * 1024)
    );

    traps::init_idt();
    arch::pic::remap();
    arch::pic::unmask(0); // timer
    arch::pit::init(config::TIMER_HZ as u32);

    unsafe {
        arch::syscall::init(arch::tss::Tss::kernel_rsp0());
    }

    task::process::spawn_idle();

    match arch::boot::get_boot_module() {
        Some(image) => match fs::unifs::init(image) {
            Ok(count) => {
                info!("unifs: {} entries in boot ROM", count);
                if let Err(e) = fs::unifs::mount("/") {
                    log::warn!("unifs mount failed: {}", e);
                }
            }
            Err(e) => log::warn!("unifs init failed: {}", e),
        },
        None => log::warn!("no boot module supplied; / will be empty until fat32 mounts"),
    }

    drivers::ata::init();
    match fs::fat32::init("ata0") {
        Ok(()) => {
            if let Err(e) = fs::fat32::mount("/disk") {
                log::warn!("fat32 mount failed: {}", e);
            }
        }
        Err(e) => log::warn!("fat32 init failed: {}", e),
    }

    if let Some(fb) = arch::boot::get_framebuffer_info() {
        drivers::framebuffer::init(fb);
    } else {
        log::warn!("no framebuffer available");
    }

    match task::process::spawn("/init", 0) {
        Ok(pid) => info!("spawned init (pid {})", pid),
        Err(e) => log::warn!("failed to spawn /init: {}", e),
    }

    unsafe {
        core::arch::asm!("sti");
    }

    loop {
        task::process::yield_now();
        core::arch::asm!("hlt", options(nomem, nostack));
    }
}
