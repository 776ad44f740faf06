//! Anonymous pipes (§4.8).
//!
//! Fixed-size kernel ring buffers for inter-process communication.
//! Non-blocking at this layer — reads and writes return immediately with
//! whatever could be transferred; EOF and "broken pipe" are signalled
//! through return values rather than blocking.

use crate::fs::vfs::{self, VNode, VNodeHandle, VNodeOps};
use crate::sync::spinlock::SpinLock;

/// Size of each pipe's internal buffer (4 KiB).
const PIPE_BUF_SIZE: usize = 4096;

/// Maximum number of simultaneously open pipes.
const MAX_PIPES: usize = 16;

/// A single IPC pipe backed by a ring buffer.
#[derive(Clone, Copy)]
struct Pipe {
    buf: [u8; PIPE_BUF_SIZE],
    read_pos: usize,
    write_pos: usize,
    count: usize,
    in_use: bool,
    read_closed: bool,
    write_closed: bool,
}

impl Pipe {
    const fn new() -> Self {
        Self {
            buf: [0; PIPE_BUF_SIZE],
            read_pos: 0,
            write_pos: 0,
            count: 0,
            in_use: true,
            read_closed: false,
            write_closed: false,
        }
    }

    /// Returns `None` once both ends are closed — the slot should be freed.
    fn maybe_retire(&mut self) -> bool {
        if self.read_closed && self.write_closed {
            self.in_use = false;
            true
        } else {
            false
        }
    }

    /// Writes `data`. Returns `-1` if the read end is already closed
    /// (broken pipe), else the number of bytes actually written (may be
    /// less than `data.len()` if the buffer fills up).
    fn write(&mut self, data: &[u8]) -> isize {
        if self.read_closed {
            return -1;
        }
        let mut written = 0usize;
        for &byte in data {
            if self.count >= PIPE_BUF_SIZE {
                break;
            }
            self.buf[self.write_pos] = byte;
            self.write_pos = (self.write_pos + 1) % PIPE_BUF_SIZE;
            self.count += 1;
            written += 1;
        }
        written as isize
    }

    /// Reads up to `buf.len()` bytes. Returns `0` if the pipe is empty and
    /// the write end is closed (EOF), else the number of bytes read (which
    /// may legitimately be `0` while the write end is still open).
    fn read(&mut self, buf: &mut [u8]) -> isize {
        let mut nread = 0usize;
        for slot in buf.iter_mut() {
            if self.count == 0 {
                break;
            }
            *slot = self.buf[self.read_pos];
            self.read_pos = (self.read_pos + 1) % PIPE_BUF_SIZE;
            self.count -= 1;
            nread += 1;
        }
        nread as isize
    }
}

static PIPES: SpinLock<[Option<Pipe>; MAX_PIPES]> = {
    const NONE: Option<Pipe> = None;
    SpinLock::new([NONE; MAX_PIPES])
};

/// Creates a new pipe. Returns the pipe ID (0..MAX_PIPES), or `None` if
/// the pool is full.
pub fn create() -> Option<usize> {
    let mut pipes = PIPES.lock();
    for (id, slot) in pipes.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(Pipe::new());
            return Some(id);
        }
    }
    None
}

pub fn write(id: usize, data: &[u8]) -> isize {
    let mut pipes = PIPES.lock();
    if id >= MAX_PIPES {
        return -1;
    }
    match pipes[id].as_mut() {
        Some(pipe) => pipe.write(data),
        None => -1,
    }
}

pub fn read(id: usize, buf: &mut [u8]) -> isize {
    let mut pipes = PIPES.lock();
    if id >= MAX_PIPES {
        return -1;
    }
    match pipes[id].as_mut() {
        Some(pipe) => {
            if pipe.count == 0 && pipe.write_closed {
                0
            } else {
                pipe.read(buf)
            }
        }
        None => -1,
    }
}

/// Closes the read end. When both ends are closed the slot returns to the pool.
pub fn close_read(id: usize) {
    let mut pipes = PIPES.lock();
    if id >= MAX_PIPES {
        return;
    }
    if let Some(pipe) = pipes[id].as_mut() {
        pipe.read_closed = true;
        if pipe.maybe_retire() {
            pipes[id] = None;
        }
    }
}

/// Closes the write end. When both ends are closed the slot returns to the pool.
pub fn close_write(id: usize) {
    let mut pipes = PIPES.lock();
    if id >= MAX_PIPES {
        return;
    }
    if let Some(pipe) = pipes[id].as_mut() {
        pipe.write_closed = true;
        if pipe.maybe_retire() {
            pipes[id] = None;
        }
    }
}

// ── Pipe ends as vnodes (§4.8) ──────────────────────────────────
//
// Exposed to the VFS as a vnode whose `fs_data` is the pipe id and whose
// `inode_id` encodes which end: 0 = read, 1 = write. This lets `read`/
// `write`/`close` syscalls treat a pipe fd exactly like any other open
// file.

const END_READ: u64 = 0;
const END_WRITE: u64 = 1;

fn pipe_read(node: &mut VNode, _offset: u64, buf: &mut [u8], _hint: &mut crate::fs::vfs::SeqHint) -> isize {
    read(node.fs_data, buf)
}

fn pipe_write(node: &mut VNode, _offset: u64, buf: &[u8]) -> isize {
    write(node.fs_data, buf)
}

fn pipe_close(node: &mut VNode) {
    if node.inode_id == END_READ {
        close_read(node.fs_data);
    } else {
        close_write(node.fs_data);
    }
}

static PIPE_READ_OPS: VNodeOps = VNodeOps {
    read: Some(pipe_read),
    write: None,
    readdir: None,
    lookup: None,
    create: None,
    mkdir: None,
    unlink: None,
    close: Some(pipe_close),
};

static PIPE_WRITE_OPS: VNodeOps = VNodeOps {
    read: None,
    write: Some(pipe_write),
    readdir: None,
    lookup: None,
    create: None,
    mkdir: None,
    unlink: None,
    close: Some(pipe_close),
};

/// Wraps pipe `id` as a freshly-allocated vnode for the given end.
pub fn vnode_for(id: usize, write_end: bool) -> VNodeHandle {
    let node = VNode {
        inode_id: if write_end { END_WRITE } else { END_READ },
        size: 0,
        is_dir: false,
        ops: if write_end { &PIPE_WRITE_OPS } else { &PIPE_READ_OPS },
        fs_data: id,
        ref_count: 1,
    };
    vfs::box_vnode_pub(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_after_write_close() {
        let id = create().unwrap();
        assert_eq!(write(id, b"hello"), 5);
        close_write(id);
        let mut buf = [0u8; 10];
        assert_eq!(read(id, &mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(read(id, &mut buf), 0);
    }

    #[test]
    fn write_after_read_close_is_broken_pipe() {
        let id = create().unwrap();
        close_read(id);
        assert_eq!(write(id, b"x"), -1);
    }

    #[test]
    fn slot_recycled_once_both_ends_closed() {
        let id = create().unwrap();
        close_read(id);
        close_write(id);
        let id2 = create().unwrap();
        assert_eq!(id, id2);
    }
}
