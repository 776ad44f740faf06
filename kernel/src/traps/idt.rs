//! IDT initialization and management.

use core::sync::atomic::{AtomicPtr, Ordering};

use log::{debug, info};
use spin::Once;

use crate::arch::gdt::Gdt;
use crate::arch::idt::{EntryOptions, GateType, Idt};
use crate::arch::tss::Tss;

use super::handlers;

/// IRQ0, remapped past the CPU exception range.
pub const TIMER_VECTOR: u8 = 32;
/// The PIC's spurious-interrupt vector (traditionally the last one).
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Global IDT instance.
static IDT: Once<Idt> = Once::new();

/// Global TSS instance.
static TSS: Once<Tss> = Once::new();

/// Global GDT instance.
static GDT: Once<Gdt> = Once::new();

/// Raw pointer to the TSS, set after init, for dynamic RSP0 updates.
static TSS_PTR: AtomicPtr<Tss> = AtomicPtr::new(core::ptr::null_mut());

/// Initializes the GDT (with user segments + TSS descriptor), the TSS
/// (IST1 pointing at a dedicated double-fault stack, RSP0 for Ring 3→0
/// transitions), and the IDT (exceptions, timer, spurious).
pub fn init_idt() {
    let tss_ref = TSS.call_once(|| {
        let mut tss = Tss::new();
        tss.init();
        tss
    });

    TSS_PTR.store(tss_ref as *const Tss as *mut Tss, Ordering::Relaxed);

    let (gdt, selectors) = Gdt::new(tss_ref);
    let gdt_ref = GDT.call_once(|| gdt);

    unsafe {
        gdt_ref.load(&selectors);
    }
    debug!(
        "gdt loaded (kcs={:#06x} kds={:#06x} ucs={:#06x} uds={:#06x} tss={:#06x})",
        selectors.kernel_code, selectors.kernel_data, selectors.user_code, selectors.user_data, selectors.tss
    );

    let mut idt = Idt::new();
    let cs = selectors.kernel_code;

    let bp_options = EntryOptions::new().set_present(true).set_gate_type(GateType::Interrupt);
    idt.set_handler(3, handlers::breakpoint_handler as usize, cs, bp_options);

    let df_options = EntryOptions::new()
        .set_present(true)
        .set_gate_type(GateType::Interrupt)
        .set_stack_index(handlers::DOUBLE_FAULT_IST_INDEX);
    idt.set_handler(8, handlers::double_fault_handler as usize, cs, df_options);

    let timer_options = EntryOptions::new().set_present(true).set_gate_type(GateType::Interrupt);
    idt.set_handler(TIMER_VECTOR as usize, handlers::timer_handler as usize, cs, timer_options);

    let spurious_options = EntryOptions::new().set_present(true).set_gate_type(GateType::Interrupt);
    idt.set_handler(SPURIOUS_VECTOR as usize, handlers::spurious_handler as usize, cs, spurious_options);

    let pf_options = EntryOptions::new().set_present(true).set_gate_type(GateType::Interrupt);
    idt.set_handler(14, handlers::page_fault_handler as usize, cs, pf_options);

    let idt_ref = IDT.call_once(|| idt);
    idt_ref.load();

    info!("idt loaded: breakpoint, double-fault(ist1), timer({}), spurious, page-fault", TIMER_VECTOR);
}

/// Get a reference to the global IDT.
#[allow(dead_code)]
pub fn get_idt() -> Option<&'static Idt> {
    IDT.get()
}

/// Get a raw mutable pointer to the TSS (for dynamic RSP0 updates).
pub fn tss_ptr() -> *mut Tss {
    TSS_PTR.load(Ordering::Relaxed)
}
