//! Boot ROM filesystem reader ("unifs", §6).
//!
//! Flat, read-only format carried in boot module[0]: an 8-byte magic
//! followed by `{name[<=32, NUL-terminated], size: u32, payload[size]}`
//! records, back to back until the module ends. Enumerated once at mount.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::info;
use spin::Once;

use crate::fs::vfs::{self, ReaddirFn, SeqHint, VNode, VNodeOps};

const MAGIC: &[u8; 8] = b"UNIFS v1";
const NAME_CAP: usize = 32;

struct Entry {
    name: String,
    data: &'static [u8],
}

struct Image {
    entries: Vec<Entry>,
}

static IMAGE: Once<Image> = Once::new();

/// Parses the boot ROM image at `data` (must outlive the kernel — it is
/// backed by a Limine boot module, which stays resident). Returns the
/// number of entries found.
pub fn init(data: &'static [u8]) -> Result<usize, &'static str> {
    if data.len() < 8 || &data[0..8] != MAGIC {
        return Err("bad unifs magic");
    }

    let mut entries = Vec::new();
    let mut cursor = 8usize;
    while cursor + NAME_CAP + 4 <= data.len() {
        let name_bytes = &data[cursor..cursor + NAME_CAP];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_CAP);
        if nul == 0 {
            break; // empty name marks end of the image
        }
        let name = core::str::from_utf8(&name_bytes[..nul]).map_err(|_| "bad unifs name")?.to_string();
        cursor += NAME_CAP;

        let size = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;

        if cursor + size > data.len() {
            return Err("truncated unifs record");
        }
        let payload = &data[cursor..cursor + size];
        cursor += size;

        entries.push(Entry { name, data: payload });
    }

    let count = entries.len();
    IMAGE.call_once(|| Image { entries });
    info!("unifs: mounted {} entries", count);
    Ok(count)
}

fn image() -> &'static Image {
    IMAGE.get().expect("unifs not initialised")
}

fn root_read(_node: &mut VNode, _offset: u64, _buf: &mut [u8], _hint: &mut SeqHint) -> isize {
    -1 // the root is a directory; reads go through per-file vnodes
}

fn file_read(node: &mut VNode, offset: u64, buf: &mut [u8], _hint: &mut SeqHint) -> isize {
    let entry = &image().entries[node.inode_id as usize];
    let offset = offset as usize;
    if offset >= entry.data.len() {
        return 0;
    }
    let n = core::cmp::min(buf.len(), entry.data.len() - offset);
    buf[..n].copy_from_slice(&entry.data[offset..offset + n]);
    n as isize
}

const ROOT_READDIR: ReaddirFn = |_node, index, name_out, is_dir| {
    let entries = &image().entries;
    let entry = entries.get(index)?;
    let len = core::cmp::min(name_out.len(), entry.name.len());
    name_out[..len].copy_from_slice(&entry.name.as_bytes()[..len]);
    *is_dir = false;
    Some(len)
};

fn root_lookup(_node: &VNode, name: &str) -> Option<VNode> {
    let entries = &image().entries;
    let index = entries.iter().position(|e| e.name == name)?;
    Some(VNode {
        inode_id: index as u64,
        size: entries[index].data.len() as u64,
        is_dir: false,
        ops: &FILE_OPS,
        fs_data: 0,
        ref_count: 0,
    })
}

static ROOT_OPS: VNodeOps = VNodeOps {
    read: Some(root_read),
    write: None,
    readdir: Some(ROOT_READDIR),
    lookup: Some(root_lookup),
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

/// Mounts the parsed image at `path` (after `init` has run). Returns an
/// error if the mount-path bookkeeping in `vfs` rejects it.
pub fn mount(path: &str) -> Result<(), &'static str> {
    let root = VNode {
        inode_id: 0,
        size: 0,
        is_dir: true,
        ops: &ROOT_OPS,
        fs_data: 0,
        ref_count: 1, // mount roots are pinned, not freed through refcounting
    };
    let handle = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(root));
    vfs::mount(path, handle)
}
