//! Filesystem stack: block devices, the boot ROM image, FAT32, VFS glue,
//! and the ELF64 loader.

pub mod block_dev;
pub mod elf;
pub mod fat32;
pub mod unifs;
pub mod vfs;
