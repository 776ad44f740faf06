//! Read-only FAT32 driver (§4.9).
//!
//! Parses the boot sector once at mount time and caches the handful of
//! geometry fields every other operation needs. All reads go through the
//! block-device registry — this module never touches hardware directly.

use alloc::vec;
use log::info;
use spin::Once;

use crate::fs::block_dev;
use crate::fs::vfs::{self, ReaddirFn, SeqHint, VNode, VNodeOps};
use crate::sync::spinlock::SpinLock;

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_LFN: u8 = 0x0F;
const ATTR_VOLUME_LABEL: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ENTRY_FREE: u8 = 0xE5;
const ENTRY_END: u8 = 0x00;
const END_OF_CHAIN: u32 = 0x0FFF_FFF8;

struct Fat32 {
    device: &'static str,
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    fat_count: u8,
    sectors_per_fat: u32,
    root_dir_cluster: u32,
}

impl Fat32 {
    fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    fn cluster_to_lba(&self, cluster: u32) -> u64 {
        let data_start = self.reserved_sectors as u64 + self.fat_count as u64 * self.sectors_per_fat as u64;
        data_start + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    fn read_cluster(&self, cluster: u32, out: &mut [u8]) -> bool {
        let lba = self.cluster_to_lba(cluster);
        block_dev::with_device(self.device, |dev| {
            dev.read(lba, self.sectors_per_cluster as u32, out) == out.len() as isize
        })
        .unwrap_or(false)
    }

    /// Reads the FAT sector containing cluster `c`'s entry and returns the
    /// 28-bit-masked next-cluster value.
    fn next_cluster(&self, cluster: u32) -> Option<u32> {
        let fat_offset = cluster as u64 * 4;
        let fat_sector = self.reserved_sectors as u64 + fat_offset / self.bytes_per_sector as u64;
        let sector_offset = (fat_offset % self.bytes_per_sector as u64) as usize;

        let mut sector_buf = FAT_SECTOR_CACHE.lock();
        if sector_buf.cached_lba != Some(fat_sector) {
            let mut buf = [0u8; 512];
            let ok = block_dev::with_device(self.device, |dev| dev.read(fat_sector, 1, &mut buf) == 512).unwrap_or(false);
            if !ok {
                return None;
            }
            sector_buf.buf = buf;
            sector_buf.cached_lba = Some(fat_sector);
        }
        let raw = u32::from_le_bytes(sector_buf.buf[sector_offset..sector_offset + 4].try_into().unwrap());
        Some(raw & 0x0FFF_FFFF)
    }
}

struct FatSectorCache {
    cached_lba: Option<u64>,
    buf: [u8; 512],
}

static FAT_SECTOR_CACHE: SpinLock<FatSectorCache> = SpinLock::new(FatSectorCache { cached_lba: None, buf: [0; 512] });
static FS: Once<Fat32> = Once::new();

fn fs() -> &'static Fat32 {
    FS.get().expect("fat32 not initialised")
}

/// Parses the boot sector of `device` and records the geometry. Must be
/// called before `mount`.
pub fn init(device: &'static str) -> Result<(), &'static str> {
    let mut sector = [0u8; 512];
    let read_ok = block_dev::with_device(device, |dev| dev.read(0, 1, &mut sector) == 512).ok_or("no such block device")?;
    if !read_ok {
        return Err("failed to read FAT32 boot sector");
    }

    let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]);
    let sectors_per_cluster = sector[13];
    let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]);
    let fat_count = sector[16];
    let sectors_per_fat = u32::from_le_bytes([sector[36], sector[37], sector[38], sector[39]]);
    let root_dir_cluster = u32::from_le_bytes([sector[44], sector[45], sector[46], sector[47]]);

    if bytes_per_sector == 0 || sectors_per_cluster == 0 || sectors_per_fat == 0 {
        return Err("not a FAT32 volume");
    }

    FS.call_once(|| Fat32 {
        device,
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        fat_count,
        sectors_per_fat,
        root_dir_cluster,
    });

    info!(
        "fat32: bps={} spc={} reserved={} fats={} spf={} root_cluster={}",
        bytes_per_sector, sectors_per_cluster, reserved_sectors, fat_count, sectors_per_fat, root_dir_cluster
    );
    Ok(())
}

/// Mounts the parsed volume at `path`.
pub fn mount(path: &str) -> Result<(), &'static str> {
    let fs = fs();
    let root = VNode {
        inode_id: fs.root_dir_cluster as u64,
        size: 0,
        is_dir: true,
        ops: &DIR_OPS,
        fs_data: 0,
        ref_count: 1,
    };
    let handle = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(root));
    vfs::mount(path, handle)
}

fn file_read(node: &mut VNode, offset: u64, buf: &mut [u8], hint: &mut SeqHint) -> isize {
    let fs = fs();
    let cluster_size = fs.cluster_size() as u64;

    let (mut cluster, base) = if hint.last_cluster != 0 && offset >= hint.last_offset {
        (hint.last_cluster, hint.last_offset)
    } else {
        (node.inode_id as u32, 0)
    };

    let clusters_to_skip = (offset - base) / cluster_size;
    for _ in 0..clusters_to_skip {
        match fs.next_cluster(cluster) {
            Some(next) if next < END_OF_CHAIN => cluster = next,
            _ => return 0, // ran off the end of the chain
        }
    }

    let mut cluster_base = base + clusters_to_skip * cluster_size;
    let mut total = 0usize;
    let mut cluster_buf = vec![0u8; cluster_size as usize];

    while total < buf.len() {
        if !fs.read_cluster(cluster, &mut cluster_buf) {
            break;
        }
        let want_offset = offset + total as u64;
        let in_cluster_off = (want_offset - cluster_base) as usize;
        if in_cluster_off >= cluster_buf.len() {
            break;
        }
        let n = core::cmp::min(buf.len() - total, cluster_buf.len() - in_cluster_off);
        buf[total..total + n].copy_from_slice(&cluster_buf[in_cluster_off..in_cluster_off + n]);
        total += n;

        hint.last_cluster = cluster;
        hint.last_offset = cluster_base;

        if total >= buf.len() {
            break;
        }
        match fs.next_cluster(cluster) {
            Some(next) if next < END_OF_CHAIN => {
                cluster = next;
                cluster_base += cluster_size;
            }
            _ => break,
        }
    }

    total as isize
}

/// Converts a raw 11-byte 8.3 directory name field to `"NAME.EXT"` form.
fn format_83_name(raw: &[u8; 11], out: &mut [u8]) -> usize {
    let name = raw[0..8].iter().rposition(|&b| b != b' ').map(|i| i + 1).unwrap_or(0);
    let ext = raw[8..11].iter().rposition(|&b| b != b' ').map(|i| i + 1).unwrap_or(0);

    let mut len = 0;
    for &b in &raw[0..name] {
        out[len] = b;
        len += 1;
    }
    if ext > 0 {
        out[len] = b'.';
        len += 1;
        for &b in &raw[8..8 + ext] {
            out[len] = b;
            len += 1;
        }
    }
    len
}

const DIR_READDIR: ReaddirFn = |node, index, name_out, is_dir| {
    let fs = fs();
    let cluster_size = fs.cluster_size() as usize;
    let mut cluster = node.inode_id as u32;
    let mut cluster_buf = vec![0u8; cluster_size];
    let mut surviving = 0usize;

    loop {
        if !fs.read_cluster(cluster, &mut cluster_buf) {
            return None;
        }
        for chunk in cluster_buf.chunks_exact(DIR_ENTRY_SIZE) {
            if chunk[0] == ENTRY_END {
                return None; // end of directory
            }
            if chunk[0] == ENTRY_FREE {
                continue;
            }
            let attr = chunk[11];
            if attr == ATTR_LFN || attr & ATTR_VOLUME_LABEL != 0 {
                continue;
            }
            if surviving == index {
                let raw: [u8; 11] = chunk[0..11].try_into().unwrap();
                let len = format_83_name(&raw, name_out);
                *is_dir = attr & ATTR_DIRECTORY != 0;
                return Some(len);
            }
            surviving += 1;
        }
        match fs.next_cluster(cluster) {
            Some(next) if next < END_OF_CHAIN => cluster = next,
            _ => return None,
        }
    }
};

fn dir_lookup(node: &VNode, name: &str) -> Option<VNode> {
    let fs = fs();
    let target = to_83_padded(name)?;
    let cluster_size = fs.cluster_size() as usize;
    let mut cluster = node.inode_id as u32;
    let mut cluster_buf = vec![0u8; cluster_size];

    loop {
        if !fs.read_cluster(cluster, &mut cluster_buf) {
            return None;
        }
        for chunk in cluster_buf.chunks_exact(DIR_ENTRY_SIZE) {
            if chunk[0] == ENTRY_END {
                return None;
            }
            if chunk[0] == ENTRY_FREE {
                continue;
            }
            let attr = chunk[11];
            if attr == ATTR_LFN || attr & ATTR_VOLUME_LABEL != 0 {
                continue;
            }
            if chunk[0..11] == target {
                let cluster_hi = u16::from_le_bytes([chunk[20], chunk[21]]) as u32;
                let cluster_lo = u16::from_le_bytes([chunk[26], chunk[27]]) as u32;
                let start_cluster = (cluster_hi << 16) | cluster_lo;
                let size = u32::from_le_bytes([chunk[28], chunk[29], chunk[30], chunk[31]]);
                let is_dir = attr & ATTR_DIRECTORY != 0;
                return Some(VNode {
                    inode_id: start_cluster as u64,
                    size: size as u64,
                    is_dir,
                    ops: if is_dir { &DIR_OPS } else { &FILE_OPS },
                    fs_data: 0,
                    ref_count: 0,
                });
            }
        }
        match fs.next_cluster(cluster) {
            Some(next) if next < END_OF_CHAIN => cluster = next,
            _ => return None,
        }
    }
}

fn to_83_padded(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    if base.len() > 8 || ext.len() > 3 {
        return None;
    }
    let mut out = [b' '; 11];
    for (i, b) in base.bytes().enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    Some(out)
}

static DIR_OPS: VNodeOps = VNodeOps {
    read: None,
    write: None,
    readdir: Some(DIR_READDIR),
    lookup: Some(dir_lookup),
    create: None,
    mkdir: None,
    unlink: None,
    close: None,
};

static FILE_OPS: VNodeOps = VNodeOps {
    read: Some(file_read),
    write: None,
    readdir: None,
    lookup: None,
    create: None,
    mkdir: None,
    unlink: None,
    close: None,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_83_name_with_extension() {
        let raw = *b"HELLO   TXT";
        let mut out = [0u8; 16];
        let len = format_83_name(&raw, &mut out);
        assert_eq!(&out[..len], b"HELLO.TXT");
    }

    #[test]
    fn formats_83_name_without_extension() {
        let raw = *b"SUBDIR     ";
        let mut out = [0u8; 16];
        let len = format_83_name(&raw, &mut out);
        assert_eq!(&out[..len], b"SUBDIR");
    }

    #[test]
    fn pads_lookup_name_to_83() {
        assert_eq!(to_83_padded("a.b").unwrap(), *b"A       B  ");
        assert_eq!(to_83_padded("toolongname.txt"), None);
    }
}
