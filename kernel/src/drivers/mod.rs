// =============================================================================
// MinimalOS NextGen — Kernel Drivers
// =============================================================================
//
// This is a monolithic kernel: drivers live in kernel space and run
// privileged, reachable through the VFS or direct kernel calls rather than
// a userspace IPC boundary.
//
//   framebuffer.rs — pixel writes into the Limine framebuffer
//   ata.rs         — ATA PIO block device backing FAT32
// =============================================================================

pub mod ata;
pub mod framebuffer;
