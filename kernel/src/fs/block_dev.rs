//! Block-device registry (§6).
//!
//! Filesystems never talk to hardware directly — they go through a
//! `BlockDevice` obtained from this registry. Devices register themselves
//! once at driver init; lookups are by name.

use alloc::boxed::Box;

use crate::sync::spinlock::SpinLock;

pub type ReadBlocksFn = fn(private: usize, lba: u64, count: u32, buf: &mut [u8]) -> isize;
pub type WriteBlocksFn = fn(private: usize, lba: u64, count: u32, buf: &[u8]) -> isize;

/// A registered block device, intrusively linked into the registry.
pub struct BlockDevice {
    pub name: &'static str,
    pub block_size: u32,
    pub total_blocks: u64,
    pub read_blocks: ReadBlocksFn,
    pub write_blocks: WriteBlocksFn,
    pub private: usize,
    pub next: Option<Box<BlockDevice>>,
}

impl BlockDevice {
    pub fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> isize {
        (self.read_blocks)(self.private, lba, count, buf)
    }

    pub fn write(&self, lba: u64, count: u32, buf: &[u8]) -> isize {
        (self.write_blocks)(self.private, lba, count, buf)
    }
}

static REGISTRY: SpinLock<Option<Box<BlockDevice>>> = SpinLock::new(None);

/// Registers a new block device at the head of the registry.
pub fn register(mut dev: Box<BlockDevice>) {
    let mut head = REGISTRY.lock();
    dev.next = head.take();
    *head = Some(dev);
}

/// Runs `f` with the named device, if registered. The registry lock is held
/// for the duration of `f` — keep it short.
pub fn with_device<R>(name: &str, f: impl FnOnce(&BlockDevice) -> R) -> Option<R> {
    let head = REGISTRY.lock();
    let mut cur = head.as_deref();
    while let Some(dev) = cur {
        if dev.name == name {
            return Some(f(dev));
        }
        cur = dev.next.as_deref();
    }
    None
}

/// Returns the name of the first registered device, if any — used to pick
/// a default disk when no explicit name is configured.
pub fn first_device_name() -> Option<&'static str> {
    REGISTRY.lock().as_deref().map(|d| d.name)
}
