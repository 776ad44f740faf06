//! 8253/8254 Programmable Interval Timer.
//!
//! Drives IRQ0 at a fixed rate. The PIT's base oscillator runs at
//! 1.193182 MHz; programming channel 0 with a 16-bit reload divisor sets
//! the interrupt rate to `1_193_182 / divisor` Hz.

use x86_64::instructions::port::Port;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_HZ: u32 = 1_193_182;

/// Channel 0, low/high byte access, mode 3 (square wave generator).
const COMMAND_CHANNEL0_RATE_LOHI: u8 = 0b0011_0110;

/// Programs channel 0 to fire at approximately `hz` (clamped to the
/// 16-bit divisor range the hardware supports, i.e. 19 Hz and up).
pub fn init(hz: u32) {
    let divisor = (PIT_BASE_HZ / hz).clamp(1, u16::MAX as u32) as u16;
    unsafe {
        let mut command = Port::<u8>::new(PIT_COMMAND);
        let mut channel0 = Port::<u8>::new(PIT_CHANNEL0);
        command.write(COMMAND_CHANNEL0_RATE_LOHI);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
}
