//! Virtual filesystem: mount list, vnode cache, path resolution (§4.7).
//!
//! Vnodes are manually reference-counted heap allocations (no `Arc` — the
//! `ref_count` field is the contract the spec's operations thunk through,
//! and filesystems mutate it directly the way they mutate `fs_data`).

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use bitflags::bitflags;
use log::warn;

use crate::sync::spinlock::SpinLock;

/// Max length of a mount's path prefix, NUL-free.
pub const MOUNT_PATH_MAX: usize = 64;

/// Sequential-read cache carried by the file descriptor, not the vnode —
/// it lets FAT32 fast-forward from the last cluster visited instead of
/// re-walking the chain from the head on every read.
pub type ReadFn = fn(node: &mut VNode, offset: u64, buf: &mut [u8], hint: &mut SeqHint) -> isize;
pub type WriteFn = fn(node: &mut VNode, offset: u64, buf: &[u8]) -> isize;
/// Returns `Some(name_len)` for the `index`-th surviving directory entry,
/// writing the name into `name_out` and updating `*is_dir`.
pub type ReaddirFn = fn(node: &mut VNode, index: usize, name_out: &mut [u8], is_dir: &mut bool) -> Option<usize>;
pub type LookupFn = fn(node: &VNode, name: &str) -> Option<VNode>;
pub type CreateFn = fn(node: &mut VNode, name: &str) -> Option<VNode>;
pub type MkdirFn = fn(node: &mut VNode, name: &str) -> bool;
pub type UnlinkFn = fn(node: &mut VNode, name: &str) -> bool;
pub type CloseFn = fn(node: &mut VNode);

/// Operations table. Unbound entries are `None` (e.g. FAT32's writes).
pub struct VNodeOps {
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    pub readdir: Option<ReaddirFn>,
    pub lookup: Option<LookupFn>,
    pub create: Option<CreateFn>,
    pub mkdir: Option<MkdirFn>,
    pub unlink: Option<UnlinkFn>,
    pub close: Option<CloseFn>,
}

pub struct VNode {
    pub inode_id: u64,
    pub size: u64,
    pub is_dir: bool,
    pub ops: &'static VNodeOps,
    /// Filesystem-private data: a pipe id, a leaked fs instance pointer, etc.
    pub fs_data: usize,
    pub ref_count: usize,
}

/// A heap-owned, manually refcounted vnode handle. Null only transiently.
pub type VNodeHandle = *mut VNode;

/// Opaque filesystem-private sequential-read cache: `{last_cluster,
/// last_offset}` for FAT32, unused by other filesystems.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqHint {
    pub last_cluster: u32,
    pub last_offset: u64,
}

/// A process's open-file entry. Fixed capacity per process — see
/// `task::process::MAX_FDS`.
#[derive(Clone, Copy)]
pub struct FileDescriptor {
    pub used: bool,
    pub vnode: VNodeHandle,
    pub offset: u64,
    pub dir_cursor: usize,
    pub hint: SeqHint,
}

impl FileDescriptor {
    pub const fn empty() -> Self {
        Self {
            used: false,
            vnode: core::ptr::null_mut(),
            offset: 0,
            dir_cursor: 0,
            hint: SeqHint { last_cluster: 0, last_offset: 0 },
        }
    }
}

fn box_vnode(node: VNode) -> VNodeHandle {
    Box::into_raw(Box::new(node))
}

/// Allocates a vnode for a non-filesystem backing store (pipes). Other
/// filesystems reach for `box_vnode` internally; this is the one external
/// door into the same allocation so pipe fds can be closed through the
/// ordinary `close_vnode` refcounting path.
pub fn box_vnode_pub(node: VNode) -> VNodeHandle {
    box_vnode(node)
}

/// Increments `handle`'s ref_count.
pub fn ref_inc(handle: VNodeHandle) {
    unsafe { (*handle).ref_count += 1 };
}

/// Decrements `handle`'s ref_count; at zero, invokes `ops.close` (if bound)
/// and frees the node, unless `pinned` (mount roots are never freed here).
pub fn close_vnode(handle: VNodeHandle, pinned: bool) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let node = &mut *handle;
        if node.ref_count == 0 {
            warn!("vfs: close_vnode on already-zero ref_count node");
            return;
        }
        node.ref_count -= 1;
        if node.ref_count == 0 && !pinned {
            if let Some(close) = node.ops.close {
                close(node);
            }
            drop(Box::from_raw(handle));
        }
    }
}

pub struct Mount {
    pub path: String,
    pub root: VNodeHandle,
    pub next: Option<Box<Mount>>,
}

// SAFETY: single-core kernel; the mount list lives behind MOUNTS's SpinLock
// and is never touched from more than one logical owner at a time.
unsafe impl Send for Mount {}

static MOUNTS: SpinLock<Option<Box<Mount>>> = SpinLock::new(None);

/// Registers a new mount at `path` (absolute, `<64` bytes) rooted at `root`.
/// Later mounts win ties in `resolve`'s longest-prefix search.
pub fn mount(path: &str, root: VNodeHandle) -> Result<(), &'static str> {
    if path.len() >= MOUNT_PATH_MAX {
        return Err("mount path too long");
    }
    let mut head = MOUNTS.lock();
    let new_mount = Box::new(Mount {
        path: path.to_string(),
        root,
        next: head.take(),
    });
    *head = Some(new_mount);
    Ok(())
}

/// Finds the mount whose path is the longest prefix of `path`. Ties favor
/// the most recently mounted (head of the list).
fn resolve(path: &str) -> Option<(VNodeHandle, String)> {
    let head = MOUNTS.lock();
    let mut best: Option<(&str, VNodeHandle)> = None;
    let mut cur = head.as_deref();
    while let Some(m) = cur {
        if path.starts_with(m.path.as_str()) {
            let better = match best {
                None => true,
                Some((best_path, _)) => m.path.len() >= best_path.len(),
            };
            if better {
                best = Some((m.path.as_str(), m.root));
            }
        }
        cur = m.next.as_deref();
    }
    best.map(|(prefix, root)| {
        let residual = path[prefix.len()..].trim_start_matches('/').to_string();
        (root, residual)
    })
}

/// Resolves `path` to a caller-owned vnode reference (ref_count already
/// incremented to account for the caller's hold).
pub fn lookup_vnode(path: &str) -> Option<VNodeHandle> {
    let (mount_root, residual) = resolve(path)?;
    ref_inc(mount_root);
    let mut current = mount_root;
    let mut current_is_root = true;

    for segment in residual.split('/').filter(|s| !s.is_empty()) {
        let node_ref = unsafe { &*current };
        let lookup = node_ref.ops.lookup?;
        let found = lookup(node_ref, segment);
        if !current_is_root {
            close_vnode(current, false);
        } else {
            close_vnode(current, true);
        }
        match found {
            Some(mut vn) => {
                vn.ref_count = 1;
                current = box_vnode(vn);
                current_is_root = false;
            }
            None => return None,
        }
    }
    Some(current)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR   = 1 << 1;
        const CREAT  = 1 << 2;
        const APPEND = 1 << 3;
    }
}

/// Result of a successful `open`: a fresh, caller-owned vnode plus the
/// initial byte offset (size, if `O_APPEND`, else zero).
pub struct OpenResult {
    pub vnode: VNodeHandle,
    pub offset: u64,
}

/// Opens `path`. Looks up the vnode (or creates it via the parent
/// directory's `ops.create` if `O_CREAT` and absent). Disallows write
/// flags on directories.
pub fn open(path: &str, flags: OpenFlags) -> Option<OpenResult> {
    let vnode = match lookup_vnode(path) {
        Some(v) => v,
        None if flags.contains(OpenFlags::CREAT) => create_via_parent(path)?,
        None => return None,
    };

    let node_ref = unsafe { &*vnode };
    let wants_write = flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);
    if node_ref.is_dir && wants_write {
        close_vnode(vnode, false);
        return None;
    }

    let offset = if flags.contains(OpenFlags::APPEND) { node_ref.size } else { 0 };
    Some(OpenResult { vnode, offset })
}

fn create_via_parent(path: &str) -> Option<VNodeHandle> {
    let (dir_path, name) = path.rsplit_once('/')?;
    let dir_path = if dir_path.is_empty() { "/" } else { dir_path };
    let parent = lookup_vnode(dir_path)?;
    let result = unsafe {
        let parent_ref = &mut *parent;
        let create = parent_ref.ops.create?;
        create(parent_ref, name)
    };
    close_vnode(parent, false);
    result.map(|mut vn| {
        vn.ref_count = 1;
        box_vnode(vn)
    })
}

/// Reads into `buf` at `fd.offset`, advancing `fd.offset` by the bytes
/// actually read and updating `fd.hint` for filesystems that cache
/// sequential-read position (FAT32).
pub fn read(fd: &mut FileDescriptor, buf: &mut [u8]) -> isize {
    if fd.vnode.is_null() {
        return -1;
    }
    let node = unsafe { &mut *fd.vnode };
    match node.ops.read {
        Some(read_fn) => {
            let n = read_fn(node, fd.offset, buf, &mut fd.hint);
            if n > 0 {
                fd.offset += n as u64;
            }
            n
        }
        None => -1,
    }
}

/// Writes `buf` at `fd.offset`, advancing `fd.offset` by the bytes written.
pub fn write(fd: &mut FileDescriptor, buf: &[u8]) -> isize {
    if fd.vnode.is_null() {
        return -1;
    }
    let node = unsafe { &mut *fd.vnode };
    match node.ops.write {
        Some(write_fn) => {
            let n = write_fn(node, fd.offset, buf);
            if n > 0 {
                fd.offset += n as u64;
            }
            n
        }
        None => -1,
    }
}

pub fn readdir(vnode: VNodeHandle, index: usize, name_out: &mut [u8], is_dir: &mut bool) -> Option<usize> {
    let node = unsafe { &mut *vnode };
    node.ops.readdir?(node, index, name_out, is_dir)
}

pub fn mkdir(vnode: VNodeHandle, name: &str) -> bool {
    let node = unsafe { &mut *vnode };
    node.ops.mkdir.map(|f| f(node, name)).unwrap_or(false)
}

pub fn unlink(vnode: VNodeHandle, name: &str) -> bool {
    let node = unsafe { &mut *vnode };
    node.ops.unlink.map(|f| f(node, name)).unwrap_or(false)
}

/// Looks up `path` and returns its cached `(inode_id, size, is_dir)`
/// without going through `ops` — the fields are already resident on the
/// vnode, so this is a lookup-and-read rather than a dispatched call.
pub fn stat(path: &str) -> Option<(u64, u64, bool)> {
    let vnode = lookup_vnode(path)?;
    let node = unsafe { &*vnode };
    let result = (node.inode_id, node.size, node.is_dir);
    close_vnode(vnode, false);
    Some(result)
}

// ── Seek ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Computes a new offset for `seek`. Rejects a negative absolute result.
pub fn seek(current_offset: u64, size: u64, whence: SeekWhence, delta: i64) -> Option<u64> {
    let base: i64 = match whence {
        SeekWhence::Set => 0,
        SeekWhence::Cur => current_offset as i64,
        SeekWhence::End => size as i64,
    };
    let result = base.checked_add(delta)?;
    if result < 0 {
        None
    } else {
        Some(result as u64)
    }
}

// ── Path canonicalization ────────────────────────────────────────

/// Produces a canonical absolute path from `cwd` and `path`, resolving `.`
/// and `..` and collapsing repeated slashes. Never ascends above `/`.
pub fn resolve_relative(cwd: &str, path: &str) -> String {
    let mut stack: alloc::vec::Vec<&str> = alloc::vec::Vec::new();

    let base_components = if path.starts_with('/') { &[][..] } else { &cwd_components(cwd)[..] };
    for component in base_components {
        stack.push(component);
    }

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn cwd_components(cwd: &str) -> alloc::vec::Vec<&str> {
    cwd.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_handles_dotdot() {
        assert_eq!(resolve_relative("/usr/bin", "../lib"), "/usr/lib");
        assert_eq!(resolve_relative("/", "../../etc"), "/etc");
        assert_eq!(resolve_relative("/a/b", "/c/d"), "/c/d");
        assert_eq!(resolve_relative("/a", "./b/./c"), "/a/b/c");
    }

    #[test]
    fn seek_rejects_negative_absolute() {
        assert_eq!(seek(10, 100, SeekWhence::Set, 5), Some(5));
        assert_eq!(seek(10, 100, SeekWhence::Cur, -20), None);
        assert_eq!(seek(10, 100, SeekWhence::End, -10), Some(90));
    }
}
