// =============================================================================
// MinimalOS NextGen — Virtual Memory Area (VMA) List
// =============================================================================
//
// Per-process, singly-linked, unsorted list of virtual memory regions.
// `add` pushes to the head; overlap checking is the caller's responsibility
// (the scheduler/exec/fork call sites never add overlapping ranges in
// practice). `find` and `remove` are linear scans — process address spaces
// hold at most a handful of regions (text, data, heap, stack, maybe mmio),
// so this is never a hot path.
// =============================================================================

use alloc::boxed::Box;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXEC    = 1 << 2;
        const USER    = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaType {
    Generic,
    Text,
    Data,
    Stack,
    Heap,
    Mmio,
    Anonymous,
}

pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
    pub kind: VmaType,
    pub is_cow: bool,
    pub next: Option<Box<Vma>>,
}

/// Head of a process's VMA list.
pub type VmaList = Option<Box<Vma>>;

/// Finds the VMA containing `addr`, if any.
pub fn find(list: &VmaList, addr: u64) -> Option<&Vma> {
    let mut cur = list.as_deref();
    while let Some(vma) = cur {
        if addr >= vma.start && addr < vma.end {
            return Some(vma);
        }
        cur = vma.next.as_deref();
    }
    None
}

pub fn find_mut(list: &mut VmaList, addr: u64) -> Option<&mut Vma> {
    let mut cur = list.as_deref_mut();
    while let Some(vma) = cur {
        if addr >= vma.start && addr < vma.end {
            return Some(vma);
        }
        cur = vma.next.as_deref_mut();
    }
    None
}

/// Pushes a new VMA to the head of the list. Returns `false` if `start >= end`.
pub fn add(list: &mut VmaList, start: u64, end: u64, flags: VmaFlags, kind: VmaType) -> bool {
    if start >= end {
        return false;
    }
    let new_head = Box::new(Vma {
        start,
        end,
        flags,
        kind,
        is_cow: false,
        next: list.take(),
    });
    *list = Some(new_head);
    true
}

/// Removes the VMA with the exact range `[start, end)`.
pub fn remove(list: &mut VmaList, start: u64, end: u64) {
    let mut cur = list;
    loop {
        match cur {
            None => return,
            Some(vma) if vma.start == start && vma.end == end => {
                *cur = vma.next.take();
                return;
            }
            Some(vma) => cur = &mut vma.next,
        }
    }
}

/// Deep-clones the list, preserving order and every field (including `is_cow`).
pub fn clone_list(src: &VmaList) -> VmaList {
    // Built tail-first via a Vec so the clone preserves source order without
    // a recursive helper (kernel code avoids unbounded recursion depth).
    let mut collected: alloc::vec::Vec<(u64, u64, VmaFlags, VmaType, bool)> = alloc::vec::Vec::new();
    let mut cur = src.as_deref();
    while let Some(vma) = cur {
        collected.push((vma.start, vma.end, vma.flags, vma.kind, vma.is_cow));
        cur = vma.next.as_deref();
    }
    let mut out: VmaList = None;
    for (start, end, flags, kind, is_cow) in collected.into_iter().rev() {
        let mut node = Box::new(Vma {
            start,
            end,
            flags,
            kind,
            is_cow,
            next: out.take(),
        });
        node.is_cow = is_cow;
        out = Some(node);
    }
    out
}

/// Drops the whole list, freeing every node.
pub fn free_all(list: &mut VmaList) {
    *list = None; // Box drop chain frees the rest recursively via `next`.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_respects_half_open_ranges() {
        let mut list: VmaList = None;
        add(&mut list, 0x1000, 0x2000, VmaFlags::READ, VmaType::Anonymous);
        assert!(find(&list, 0x1000).is_some());
        assert!(find(&list, 0x1FFF).is_some());
        assert!(find(&list, 0x2000).is_none());
    }

    #[test]
    fn remove_deletes_exact_match_only() {
        let mut list: VmaList = None;
        add(&mut list, 0x1000, 0x2000, VmaFlags::READ, VmaType::Anonymous);
        add(&mut list, 0x3000, 0x4000, VmaFlags::READ, VmaType::Heap);
        remove(&mut list, 0x1000, 0x2000);
        assert!(find(&list, 0x1000).is_none());
        assert!(find(&list, 0x3000).is_some());
    }

    #[test]
    fn clone_preserves_cow_flag_and_order() {
        let mut list: VmaList = None;
        add(&mut list, 0x1000, 0x2000, VmaFlags::READ, VmaType::Anonymous);
        add(&mut list, 0x3000, 0x4000, VmaFlags::READ, VmaType::Heap);
        list.as_mut().unwrap().is_cow = true;
        let cloned = clone_list(&list);
        let head = cloned.as_deref().unwrap();
        assert!(head.is_cow);
        assert_eq!(head.start, 0x3000);
        assert_eq!(head.next.as_deref().unwrap().start, 0x1000);
    }
}
