//! Interrupt and exception handlers.

use log::{error, warn};
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

use crate::arch::cpu;
use crate::memory::vmm::{self, PageFaultError};
use crate::task::process;

/// IST index (1-based in the TSS, 0-based here) carrying the double-fault
/// stack. Double fault always runs on its own stack so a kernel-stack
/// overflow doesn't turn into a triple fault.
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

const PIC1_COMMAND: u16 = 0x20;
const PIC2_COMMAND: u16 = 0xA0;
const PIC_EOI: u8 = 0x20;

fn send_eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            Port::new(PIC2_COMMAND).write(PIC_EOI);
        }
        Port::new(PIC1_COMMAND).write(PIC_EOI);
    }
}

/// Breakpoint exception handler (INT 3).
pub extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::info!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

/// Double fault: the kernel's own stack is gone or corrupted. Nothing can
/// be trusted past this point, so freeze and halt rather than try to
/// continue.
pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    error!(
        "DOUBLE FAULT (error {:#x}) at rip={:#x}",
        error_code,
        stack_frame.instruction_pointer.as_u64()
    );
    cpu::halt_forever();
}

/// IRQ0: drives the scheduler's notion of time and preempts the running
/// task in favor of the next Ready one.
pub extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    crate::task::clock::tick();
    send_eoi(0);
    process::do_schedule();
}

/// Vector 0xFF: the PIC's spurious-interrupt vector. No device actually
/// requested service; just acknowledge and return.
pub extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {
    send_eoi(7);
}

/// Page fault: consult the faulting process's VMA list for a COW or
/// demand-fill resolution; anything else is unrecoverable.
pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = cpu::read_cr2();
    let error = PageFaultError::from_bits_truncate(error_code.bits());

    let resolved = process::with_current(|p| {
        vmm::handle_page_fault(p.cr3, &p.vma_list, fault_addr, error)
    });

    match resolved {
        Some(vmm::FaultOutcome::Resolved) => {}
        Some(vmm::FaultOutcome::Fatal) | None => {
            error!(
                "unrecoverable page fault at {:#x} (rip={:#x}, error={:?})",
                fault_addr,
                stack_frame.instruction_pointer.as_u64(),
                error
            );
            if resolved.is_none() {
                warn!("page fault occurred with no current process");
            }
            cpu::halt_forever();
        }
    }
}
