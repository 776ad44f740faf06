//! 8259 Programmable Interrupt Controller.
//!
//! Limine leaves the PIC in its power-on state, where IRQ0-7 map to
//! vectors 0x08-0x0F — squarely inside the CPU exception range. Before
//! interrupts can be unmasked, both PICs must be remapped to spare
//! vectors (`traps::idt::TIMER_VECTOR` and friends).

use x86_64::instructions::port::Port;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

/// Vector offset for the master PIC (IRQ0-7).
pub const PIC1_OFFSET: u8 = 32;
/// Vector offset for the slave PIC (IRQ8-15).
pub const PIC2_OFFSET: u8 = 40;

/// Remaps both PICs past the CPU exception range and masks every line
/// except IRQ0 (timer) and IRQ2 (the master's slave-cascade line, needed
/// for IRQ8-15 to reach the CPU at all, even though nothing here uses
/// them yet).
pub fn remap() {
    unsafe {
        let mut cmd1 = Port::<u8>::new(PIC1_COMMAND);
        let mut data1 = Port::<u8>::new(PIC1_DATA);
        let mut cmd2 = Port::<u8>::new(PIC2_COMMAND);
        let mut data2 = Port::<u8>::new(PIC2_DATA);

        let mask1 = data1.read();
        let mask2 = data2.read();

        cmd1.write(ICW1_INIT | ICW1_ICW4);
        io_wait();
        cmd2.write(ICW1_INIT | ICW1_ICW4);
        io_wait();

        data1.write(PIC1_OFFSET);
        io_wait();
        data2.write(PIC2_OFFSET);
        io_wait();

        data1.write(4); // master: slave PIC lives on IRQ2
        io_wait();
        data2.write(2); // slave: cascade identity
        io_wait();

        data1.write(ICW4_8086);
        io_wait();
        data2.write(ICW4_8086);
        io_wait();

        data1.write(mask1);
        data2.write(mask2);
    }
}

/// Unmasks (enables) a single IRQ line, 0-15.
pub fn unmask(irq: u8) {
    unsafe {
        if irq < 8 {
            let mut data1 = Port::<u8>::new(PIC1_DATA);
            let mask = data1.read();
            data1.write(mask & !(1 << irq));
        } else {
            let mut data2 = Port::<u8>::new(PIC2_DATA);
            let mask = data2.read();
            data2.write(mask & !(1 << (irq - 8)));
        }
    }
}

/// A throwaway write to an unused port, giving the (ancient, slow) PIC
/// time to process the preceding command.
fn io_wait() {
    unsafe { Port::<u8>::new(0x80).write(0u8) };
}
