// =============================================================================
// MinimalOS NextGen — Kernel Panic Handler
// =============================================================================
//
// Panics are tier-1 unrecoverable faults (§7): freeze, dump what's known
// about the fault, halt. We write straight to a fresh SerialPort bound to
// COM1 rather than going through the SERIAL spinlock or the log crate —
// the panic may have been caused by a corrupted lock, and a second thread
// of execution (another core, or a handler re-entered from here) must
// never deadlock trying to print the very message explaining the crash.
// =============================================================================

use core::fmt::Write;
use core::panic::PanicInfo;

use crate::arch::cpu;
use crate::arch::x86_64::serial::SerialPort;

const COM1: u16 = 0x3F8;

/// The kernel panic handler.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut out = SerialPort::new(COM1);

    let _ = writeln!(out);
    let _ = writeln!(out, "================ KERNEL PANIC ================");
    if let Some(location) = info.location() {
        let _ = writeln!(out, "at {}:{}", location.file(), location.line());
    }
    let _ = writeln!(out, "{}", info.message());

    let cr2 = cpu::read_cr2();
    let cr3 = cpu::read_cr3();
    let _ = writeln!(out, "cr2={:#018x} cr3={:#018x}", cr2, cr3);

    walk_stack(&mut out);

    let _ = writeln!(out, "===============================================");
    let _ = writeln!(out, "system halted");

    freeze_framebuffer_red();
    cpu::halt_forever()
}

/// Walks the rbp chain, printing each saved return address. Stops after a
/// bounded number of frames or at a null/misaligned rbp — kernel stacks are
/// small and a runaway chain means the frame pointers themselves are
/// corrupted, in which case more output wouldn't help anyway.
fn walk_stack(out: &mut SerialPort) {
    let _ = writeln!(out, "stack trace:");
    let mut rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }

    for frame in 0..32 {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let ret_addr = unsafe { *((rbp + 8) as *const u64) };
        let next_rbp = unsafe { *(rbp as *const u64) };
        let _ = writeln!(out, "  #{:<2} {:#018x}", frame, ret_addr);
        if ret_addr == 0 {
            break;
        }
        rbp = next_rbp;
    }
}

/// Fills the framebuffer (if one was ever registered) solid red so a panic
/// is visible even when serial isn't being watched.
fn freeze_framebuffer_red() {
    if let Some(info) = crate::arch::boot::get_framebuffer_info() {
        let rows = info.height as usize;
        let stride = info.pitch as usize;
        unsafe {
            for row in 0..rows {
                let row_ptr = info.address.add(row * stride) as *mut u32;
                for col in 0..(info.width as usize) {
                    row_ptr.add(col).write_volatile(0x00FF_0000);
                }
            }
        }
    }
}
