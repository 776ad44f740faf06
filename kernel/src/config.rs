//! Build-time tunables.
//!
//! There is no runtime configuration file — every knob here is a `pub
//! const`, picked the way the rest of the kernel already names its
//! module-level constants (`task::pipe::MAX_PIPES`, `memory::heap`'s
//! `MAX_TRACKED_PAGES`).

/// Size of each process's kernel-mode stack, in bytes.
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

/// Fixed per-process file-descriptor table capacity.
pub const MAX_OPEN_FILES: usize = 16;

/// PIT tick rate, in Hz. Used to convert millisecond sleep durations into
/// tick counts (`task::clock`).
pub const TIMER_HZ: u64 = 100;
