// =============================================================================
// MinimalOS NextGen — ATA PIO Disk Driver
// =============================================================================
//
// Minimal polled (PIO, no DMA, no IRQs) driver for the primary ATA channel's
// master device. Enough to back a read-only FAT32 mount: identify the drive,
// then read 512-byte sectors with LBA28 addressing.
// =============================================================================

use log::{info, warn};
use x86_64::instructions::port::Port;

use crate::fs::block_dev::{self, BlockDevice};

const IO_BASE: u16 = 0x1F0;
const CTRL_BASE: u16 = 0x3F6;

const REG_DATA: u16 = IO_BASE;
const REG_ERROR: u16 = IO_BASE + 1;
const REG_SECCOUNT: u16 = IO_BASE + 2;
const REG_LBA_LO: u16 = IO_BASE + 3;
const REG_LBA_MID: u16 = IO_BASE + 4;
const REG_LBA_HI: u16 = IO_BASE + 5;
const REG_DRIVE: u16 = IO_BASE + 6;
const REG_STATUS: u16 = IO_BASE + 7;
const REG_COMMAND: u16 = IO_BASE + 7;

const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_BSY: u8 = 1 << 7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_IDENTIFY: u8 = 0xEC;

const SECTOR_SIZE: u32 = 512;

fn wait_not_busy() {
    let mut status_port = Port::<u8>::new(REG_STATUS);
    unsafe {
        while status_port.read() & STATUS_BSY != 0 {
            core::hint::spin_loop();
        }
    }
}

fn wait_drq() -> bool {
    let mut status_port = Port::<u8>::new(REG_STATUS);
    loop {
        let status = unsafe { status_port.read() };
        if status & STATUS_ERR != 0 {
            return false;
        }
        if status & STATUS_DRQ != 0 {
            return true;
        }
    }
}

fn select_lba28(lba: u64, sector_count: u8) {
    unsafe {
        Port::<u8>::new(REG_DRIVE).write(0xE0 | ((lba >> 24) & 0x0F) as u8);
        Port::<u8>::new(REG_SECCOUNT).write(sector_count);
        Port::<u8>::new(REG_LBA_LO).write((lba & 0xFF) as u8);
        Port::<u8>::new(REG_LBA_MID).write(((lba >> 8) & 0xFF) as u8);
        Port::<u8>::new(REG_LBA_HI).write(((lba >> 16) & 0xFF) as u8);
    }
}

/// Reads `count` 512-byte sectors starting at `lba` into `buf`.
/// `private` is unused (there's a single fixed channel/drive).
fn read_blocks(_private: usize, lba: u64, count: u32, buf: &mut [u8]) -> isize {
    if buf.len() < (count * SECTOR_SIZE) as usize {
        return -1;
    }
    wait_not_busy();
    select_lba28(lba, count as u8);
    unsafe { Port::<u8>::new(REG_COMMAND).write(CMD_READ_SECTORS) };

    let mut data_port = Port::<u16>::new(REG_DATA);
    for sector in 0..count {
        wait_not_busy();
        if !wait_drq() {
            warn!("ata: read error at lba {}", lba + sector as u64);
            return -1;
        }
        let base = (sector * SECTOR_SIZE) as usize;
        for word in 0..(SECTOR_SIZE / 2) as usize {
            let value = unsafe { data_port.read() };
            buf[base + word * 2] = (value & 0xFF) as u8;
            buf[base + word * 2 + 1] = (value >> 8) as u8;
        }
    }
    (count * SECTOR_SIZE) as isize
}

/// Writes are not supported by the core; always fails.
fn write_blocks(_private: usize, _lba: u64, _count: u32, _buf: &[u8]) -> isize {
    -1
}

fn identify() -> Option<u64> {
    unsafe {
        Port::<u8>::new(REG_DRIVE).write(0xA0);
        Port::<u8>::new(REG_SECCOUNT).write(0);
        Port::<u8>::new(REG_LBA_LO).write(0);
        Port::<u8>::new(REG_LBA_MID).write(0);
        Port::<u8>::new(REG_LBA_HI).write(0);
        Port::<u8>::new(REG_COMMAND).write(CMD_IDENTIFY);
    }

    let mut status_port = Port::<u8>::new(REG_STATUS);
    let status = unsafe { status_port.read() };
    if status == 0 {
        return None; // no drive attached
    }
    wait_not_busy();
    if !wait_drq() {
        return None;
    }

    let mut data_port = Port::<u16>::new(REG_DATA);
    let mut identify_data = [0u16; 256];
    for word in identify_data.iter_mut() {
        *word = unsafe { data_port.read() };
    }

    let sectors = (identify_data[61] as u64) << 16 | identify_data[60] as u64;
    Some(sectors)
}

/// Probes the primary-master ATA device and registers it as `"ata0"` if
/// present. Disables the legacy interrupt line via the control register
/// since this driver is purely polled.
pub fn init() {
    unsafe {
        Port::<u8>::new(CTRL_BASE).write(0x02); // nIEN: disable IRQs
    }

    let Some(total_sectors) = identify() else {
        info!("ata0: no drive detected");
        return;
    };

    block_dev::register(alloc::boxed::Box::new(BlockDevice {
        name: "ata0",
        block_size: SECTOR_SIZE,
        total_blocks: total_sectors,
        read_blocks,
        write_blocks,
        private: 0,
        next: None,
    }));

    info!("ata0: {} sectors ({} MiB)", total_sectors, total_sectors / 2048);
}
