//! Process management — PCB, context switching, scheduling, and the
//! fork/exec/wait/exit/sleep lifecycle (§4.5).

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};

use crate::config;
use crate::fs::vfs::{self, FileDescriptor, OpenFlags};
use crate::memory::address::PhysAddr;
use crate::memory::vma::{self, VmaFlags, VmaList, VmaType};
use crate::memory::vmm::{self, PageTableFlags};
use crate::sync::spinlock::SpinLock;

// ── Process identifiers ─────────────────────────────────────────

/// Monotonically increasing PID counter.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique PID.
fn alloc_pid() -> u64 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Fixed per-process file-descriptor table capacity — see `FileDescriptor`.
pub const MAX_FDS: usize = config::MAX_OPEN_FILES;

// ── Process state ───────────────────────────────────────────────

/// The possible states of a process, per the §4.5 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Ready to be scheduled.
    Ready,
    /// Currently running on the CPU.
    Running,
    /// Blocked waiting for an event (mutex contention, pipe I/O).
    Blocked,
    /// Asleep until `wake_time` ticks have elapsed.
    Sleeping,
    /// Terminated; `exit_status` holds its code, awaiting reap by parent.
    Zombie,
    /// Blocked in `wait4`/exec's handshake on a specific (or any) child.
    Waiting,
}

// ── Context (saved registers) ───────────────────────────────────

/// Callee-saved register context for `context_switch_asm`.
///
/// Not read directly from Rust — this documents the layout the assembly
/// pushes onto / pops from the kernel stack. Layout must match the
/// push/pop order in `context_switch_asm`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
#[allow(dead_code)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

// ── FPU state ────────────────────────────────────────────────────

/// 512-byte FXSAVE area, 16-byte aligned as the instruction requires.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState {
    pub bytes: [u8; 512],
    /// Cleared until the first context switch away from this process saves
    /// real state into `bytes` — avoids loading garbage into a fresh
    /// process's FPU on its very first switch-in.
    pub initialized: bool,
}

impl FpuState {
    pub const fn new() -> Self {
        Self { bytes: [0; 512], initialized: false }
    }
}

/// Saves the current FPU/SSE state into `state.bytes`, marking it initialized.
#[inline]
fn fpu_save(state: &mut FpuState) {
    unsafe {
        core::arch::asm!("fxsave64 [{0}]", in(reg) state.bytes.as_mut_ptr(), options(nostack));
    }
    state.initialized = true;
}

/// Restores FPU/SSE state from `state.bytes`, if it was ever saved.
#[inline]
fn fpu_restore(state: &FpuState) {
    if !state.initialized {
        return;
    }
    unsafe {
        core::arch::asm!("fxrstor64 [{0}]", in(reg) state.bytes.as_ptr(), options(nostack));
    }
}

// ── Kernel stack ────────────────────────────────────────────────

/// An aligned kernel stack, sized per `config::KERNEL_STACK_SIZE`.
#[repr(C, align(16))]
pub struct KernelStack {
    pub data: [u8; config::KERNEL_STACK_SIZE],
}

impl KernelStack {
    /// Top of the stack (stacks grow downward).
    pub fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + config::KERNEL_STACK_SIZE as u64
    }
}

// ── Process Control Block ───────────────────────────────────────

/// The Process Control Block — stores everything the kernel needs to
/// manage and schedule a single task (§3 "Process").
pub struct Process {
    pub pid: u64,
    pub parent_pid: u64,
    pub name: String,
    pub state: ProcessState,
    /// Saved kernel RSP (points into `kernel_stack`). Updated by
    /// `context_switch_asm` when suspending.
    pub kernel_rsp: u64,
    pub kernel_stack: Box<KernelStack>,
    /// Physical address of this process's PML4.
    pub cr3: PhysAddr,
    /// The user-mode entry point (RIP for iretq on first run).
    pub entry_point: u64,
    /// User-mode stack pointer (top of stack on first run).
    pub user_rsp: u64,
    pub vma_list: VmaList,
    pub fd_table: [FileDescriptor; MAX_FDS],
    pub cwd: String,
    pub fpu_state: FpuState,
    /// Text-cursor position for framebuffer STDOUT/STDERR rendering —
    /// per-process so concurrent writers don't interleave (§4.6).
    pub cursor_x: u32,
    pub cursor_y: u32,
    pub exit_status: i32,
    /// pid this process is blocked waiting for in `wait4`/exec's handshake;
    /// -1 means "any child".
    pub wait_for_pid: i64,
    pub wake_time: u64,
    /// Set once this process's `wait4`/exec handshake observes its target
    /// child reach Zombie.
    pub exec_done: bool,
    pub exec_child_entry: u64,
    pub exec_child_status: i32,
    /// Resume state for a forked child's very first run — `None` for a
    /// process created by `exec`/initial spawn, which instead resumes via
    /// `entry_point`/`user_rsp` through the usual trampoline.
    pub fork_resume: Option<ForkResume>,
}

/// The exact register snapshot a forked child must resume into, captured
/// from the parent's `syscall` entry frame.
#[derive(Clone, Copy)]
pub struct ForkResume {
    pub regs: crate::arch::syscall::SyscallFrame,
}

// SAFETY: Process carries raw VNodeHandle pointers in its fd_table, which
// are not auto-Send. Single-core kernel, and ownership of a Process (and
// everything it reaches) transfers wholesale between the run queue and
// "current" under the scheduler lock — never aliased across cores.
unsafe impl Send for Process {}

impl Process {
    /// Create a new process. `cr3` is the page-table root, `entry_point` is
    /// the user RIP, `user_rsp` is the user stack top.
    pub fn new(name: &str, parent_pid: u64, cr3: PhysAddr, entry_point: u64, user_rsp: u64) -> Self {
        let pid = alloc_pid();
        // Allocate the kernel stack directly on the heap without placing
        // the full array on the current stack first (would blow the
        // caller's own kernel stack when spawning from syscall context).
        let kernel_stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            if ptr.is_null() {
                panic!("failed to allocate kernel stack for PID {}", pid);
            }
            Box::from_raw(ptr)
        };

        Self {
            pid,
            parent_pid,
            name: String::from(name),
            state: ProcessState::Ready,
            kernel_rsp: 0,
            kernel_stack,
            cr3,
            entry_point,
            user_rsp,
            vma_list: None,
            fd_table: [FileDescriptor::empty(); MAX_FDS],
            cwd: String::from("/"),
            fpu_state: FpuState::new(),
            cursor_x: 0,
            cursor_y: 0,
            exit_status: 0,
            wait_for_pid: -1,
            wake_time: 0,
            exec_done: false,
            exec_child_entry: 0,
            exec_child_status: 0,
            fork_resume: None,
        }
    }

    /// Prepare the kernel stack so that when `context_switch_asm` pops from
    /// it for the first time, execution arrives at `task_entry_trampoline`.
    pub fn prepare_initial_stack(&mut self) {
        let top = self.kernel_stack.top();
        let sp = top - 7 * 8;

        unsafe {
            let ptr = sp as *mut u64;
            // Must match the pop order in context_switch_asm:
            //   pop r15, pop r14, pop r13, pop r12, pop rbx, pop rbp, ret
            ptr.add(0).write(0); // r15
            ptr.add(1).write(0); // r14
            ptr.add(2).write(0); // r13
            ptr.add(3).write(0); // r12
            ptr.add(4).write(0); // rbx
            ptr.add(5).write(0); // rbp
            ptr.add(6).write(task_entry_trampoline as u64); // rip (ret target)
        }

        self.kernel_rsp = sp;
    }

    fn alloc_fd(&mut self) -> Option<usize> {
        self.fd_table.iter().position(|fd| !fd.used)
    }

    // ── Syscall bodies (process-relative state only) ────────────

    pub fn sys_read(&mut self, fd: usize, buf: &mut [u8]) -> i64 {
        if fd == 0 {
            // STDIN: no terminal read in core.
            return 0;
        }
        let Some(entry) = self.fd_table.get_mut(fd) else { return -1 };
        if !entry.used {
            return -1;
        }
        vfs::read(entry, buf) as i64
    }

    pub fn sys_write(&mut self, fd: usize, buf: &[u8]) -> i64 {
        if fd == 1 || fd == 2 {
            crate::drivers::framebuffer::write_at(&mut self.cursor_x, &mut self.cursor_y, buf);
            return buf.len() as i64;
        }
        let Some(entry) = self.fd_table.get_mut(fd) else { return -1 };
        if !entry.used {
            return -1;
        }
        vfs::write(entry, buf) as i64
    }

    pub fn sys_open(&mut self, path: &str) -> i64 {
        let resolved = vfs::resolve_relative(&self.cwd, path);
        let Some(result) = vfs::open(&resolved, OpenFlags::RDONLY) else { return -1 };
        let Some(slot) = self.alloc_fd() else {
            vfs::close_vnode(result.vnode, false);
            return -1;
        };
        self.fd_table[slot] = FileDescriptor {
            used: true,
            vnode: result.vnode,
            offset: result.offset,
            dir_cursor: 0,
            hint: Default::default(),
        };
        slot as i64
    }

    pub fn sys_close(&mut self, fd: usize) -> i64 {
        let Some(entry) = self.fd_table.get_mut(fd) else { return -1 };
        if !entry.used {
            return -1;
        }
        vfs::close_vnode(entry.vnode, false);
        *entry = FileDescriptor::empty();
        0
    }

    pub fn sys_pipe(&mut self) -> Option<(usize, usize)> {
        let id = crate::task::pipe::create()?;
        let read_slot = self.alloc_fd()?;
        let read_vnode = crate::task::pipe::vnode_for(id, false);
        self.fd_table[read_slot] = FileDescriptor {
            used: true,
            vnode: read_vnode,
            offset: 0,
            dir_cursor: 0,
            hint: Default::default(),
        };
        let Some(write_slot) = self.alloc_fd() else {
            vfs::close_vnode(read_vnode, false);
            self.fd_table[read_slot] = FileDescriptor::empty();
            return None;
        };
        let write_vnode = crate::task::pipe::vnode_for(id, true);
        self.fd_table[write_slot] = FileDescriptor {
            used: true,
            vnode: write_vnode,
            offset: 0,
            dir_cursor: 0,
            hint: Default::default(),
        };
        Some((read_slot, write_slot))
    }

    pub fn sys_getdents(&mut self, fd: usize, idx: usize, name_out: &mut [u8]) -> i64 {
        let Some(entry) = self.fd_table.get(fd) else { return -1 };
        if !entry.used {
            return -1;
        }
        let mut is_dir = false;
        match vfs::readdir(entry.vnode, idx, name_out, &mut is_dir) {
            Some(_) => 0,
            None => -1,
        }
    }
}

// ── Context switch ──────────────────────────────────────────────

core::arch::global_asm!(
    ".global context_switch_asm",
    "context_switch_asm:",
    // rdi = &mut old_task.kernel_rsp
    // rsi = new_task.kernel_rsp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    /// Raw assembly context switch: saves callee-saved registers on the old
    /// task's stack, writes RSP to `*old_rsp_ptr`, loads `new_rsp`, restores
    /// registers, and `ret`s to the new task's saved RIP.
    fn context_switch_asm(old_rsp_ptr: *mut u64, new_rsp: u64);
}

// ── Trampoline for first entry ──────────────────────────────────

/// When a newly-created task is switched to for the first time,
/// `context_switch_asm` `ret`s into this function. It reads the current
/// process's entry parameters from the scheduler, then drops to Ring 3.
///
/// A forked child instead resumes via `jump_to_ring3_from_fork`, restoring
/// its exact parent-syscall-time register snapshot.
extern "C" fn task_entry_trampoline() {
    let (entry, user_rsp, resume) = {
        let sched = SCHEDULER.lock();
        let current = sched.current().expect("trampoline: no current task");
        (current.entry_point, current.user_rsp, current.fork_resume)
    };

    if let Some(resume) = resume {
        info!("resuming forked child at rip={:#x} rsp={:#x}", entry, user_rsp);
        let frame = super::usermode::IretqFrame::new(entry, 0x23, 0x1b, user_rsp);
        unsafe {
            super::usermode::jump_to_ring3_from_fork(&frame, &resume.regs, 0);
        }
    } else {
        info!("entering user mode: rip={:#x} rsp={:#x}", entry, user_rsp);
        let frame = super::usermode::IretqFrame::new(entry, 0x23, 0x1b, user_rsp);
        unsafe {
            super::usermode::jump_to_ring3(&frame);
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────

/// The global scheduler instance, protected by the kernel's own ticket
/// spinlock (not `spin::Mutex` — interrupt handlers touch this too, and
/// `SpinLock`'s guard restores the caller's IF state on drop).
pub static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

/// Round-robin scheduler over a ready queue plus the running task.
pub struct Scheduler {
    tasks: VecDeque<Process>,
    current: Option<Process>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { tasks: VecDeque::new(), current: None }
    }

    pub fn push(&mut self, task: Process) {
        self.tasks.push_back(task);
    }

    pub fn ready_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len() + if self.current.is_some() { 1 } else { 0 }
    }

    pub fn current(&self) -> Option<&Process> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.current.as_mut()
    }

    pub fn set_current(&mut self, task: Process) {
        self.current = Some(task);
    }

    /// Finds a zombie child of `parent_pid` (or any zombie child if
    /// `target == -1`), removes it from the ready queue, and returns its
    /// (pid, exit_status).
    fn reap_zombie_child(&mut self, parent_pid: u64, target: i64) -> Option<(u64, i32)> {
        let index = self.tasks.iter().position(|t| {
            t.parent_pid == parent_pid
                && t.state == ProcessState::Zombie
                && (target == -1 || t.pid as i64 == target)
        })?;
        let zombie = self.tasks.remove(index).unwrap();
        let result = (zombie.pid, zombie.exit_status);
        let mut zombie = zombie;
        crate::memory::vmm::free_address_space(zombie.cr3);
        vma::free_all(&mut zombie.vma_list);
        Some(result)
    }

    fn has_child(&self, parent_pid: u64) -> bool {
        self.tasks.iter().any(|t| t.parent_pid == parent_pid)
            || self.current.as_ref().is_some_and(|c| c.parent_pid == parent_pid && c.pid != parent_pid)
    }

    /// Promotes any `Sleeping` task whose `wake_time` has passed to `Ready`.
    fn wake_sleepers(&mut self, ticks: u64) {
        for task in self.tasks.iter_mut() {
            if task.state == ProcessState::Sleeping && ticks >= task.wake_time {
                task.state = ProcessState::Ready;
            }
        }
    }

    /// Wakes a `Waiting` task whose target child (or any child) has become
    /// a zombie — used by `wait4` and the exec handshake.
    fn wake_waiters(&mut self) {
        let zombie_pids: alloc::vec::Vec<(u64, i64)> =
            self.tasks.iter().filter(|t| t.state == ProcessState::Zombie).map(|t| (t.parent_pid, t.pid as i64)).collect();
        for task in self.tasks.iter_mut() {
            if task.state != ProcessState::Waiting {
                continue;
            }
            let woken = zombie_pids
                .iter()
                .any(|&(parent, pid)| parent == task.pid && (task.wait_for_pid == -1 || task.wait_for_pid == pid));
            if woken {
                task.state = ProcessState::Ready;
            }
        }
    }
}

/// Free-standing schedule function: acquires the scheduler lock, picks the
/// next Ready task (waking any sleepers/waiters whose condition is now
/// met), saves the outgoing task's FPU state and loads the incoming task's,
/// switches CR3 if needed, updates TSS RSP0, drops the lock, then performs
/// the raw register context switch.
///
/// Safe to call from both syscall context and interrupt context (a ticket
/// `SpinLock` disables/restores local interrupts around its critical
/// section).
pub fn do_schedule() {
    static mut DEAD_RSP: u64 = 0;

    let (old_rsp_ptr, new_rsp) = {
        let mut sched = SCHEDULER.lock();

        let ticks = crate::task::clock::now();
        sched.wake_sleepers(ticks);
        sched.wake_waiters();

        // Find the next Ready task in the queue, cycling non-Ready ones to
        // the back. Bounded by one full pass so a queue with nothing Ready
        // (everything Blocked/Sleeping/Waiting/Zombie) falls through to the
        // idle task, which is always present and always Ready.
        let mut new = None;
        for _ in 0..sched.tasks.len() {
            let Some(candidate) = sched.tasks.pop_front() else { break };
            if candidate.state == ProcessState::Ready {
                new = Some(candidate);
                break;
            }
            sched.tasks.push_back(candidate);
        }

        let Some(mut new) = new else { return };

        let old = sched.current.take();

        if let Some(mut old) = old {
            fpu_save(&mut old.fpu_state);
            if old.state == ProcessState::Running {
                old.state = ProcessState::Ready;
            }
            // Zombies stay in the queue too — reap_zombie_child removes
            // them directly; the ready-scan above simply skips non-Ready
            // states.
            sched.tasks.push_back(old);
        }

        fpu_restore(&new.fpu_state);

        if vmm::active_pml4() != new.cr3 {
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) new.cr3.as_u64(), options(nostack));
            }
        }

        let new_kstack_top = new.kernel_stack.top();
        unsafe {
            core::ptr::write_volatile(&raw mut crate::arch::syscall::SYSCALL_KERNEL_RSP, new_kstack_top);
            let tss = crate::traps::tss_ptr();
            if !tss.is_null() {
                crate::arch::tss::Tss::set_rsp0(tss, new_kstack_top);
            }
        }

        new.state = ProcessState::Running;
        sched.current = Some(new);

        let old_rsp_ptr = match sched.tasks.back_mut() {
            Some(t) => &mut t.kernel_rsp as *mut u64,
            None => &raw mut DEAD_RSP,
        };
        let new_rsp = sched.current.as_ref().unwrap().kernel_rsp;

        (old_rsp_ptr, new_rsp)
        // lock dropped here
    };

    unsafe {
        context_switch_asm(old_rsp_ptr, new_rsp);
        // May return from an interrupt context where IF=0.
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Runs `f` against the currently running process, if any.
pub fn with_current<R>(f: impl FnOnce(&Process) -> R) -> Option<R> {
    let sched = SCHEDULER.lock();
    sched.current().map(f)
}

/// Runs `f` against the currently running process mutably, if any.
pub fn with_current_mut<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut sched = SCHEDULER.lock();
    sched.current_mut().map(f)
}

// ── COW marking ([fork] helper) ──────────────────────────────────

/// Marks every writable VMA in `list` copy-on-write. `vmm::clone_address_space`
/// only manipulates PTE-level WRITABLE bits and frame refcounts; the page
/// fault handler's COW policy (`vmm::handle_page_fault`) additionally
/// requires `Vma::is_cow` to be set on the region, so this must run before
/// cloning the address space.
fn mark_cow_writable(list: &mut VmaList) {
    let mut cur = list.as_deref_mut();
    while let Some(region) = cur {
        if region.flags.contains(VmaFlags::WRITE) {
            region.is_cow = true;
        }
        cur = region.next.as_deref_mut();
    }
}

// ── Fork / exec / exit / wait / sleep (§4.5) ─────────────────────

/// Implements `fork()`. `frame` is the full register snapshot captured by
/// `syscall_entry` at the moment of the `syscall` instruction. Returns the
/// child's pid to the parent (the child itself resumes later through
/// `task_entry_trampoline`'s `fork_resume` path with a return value of 0,
/// never through this function).
pub fn fork(frame: &crate::arch::syscall::SyscallFrame) -> i64 {
    let mut sched = SCHEDULER.lock();
    let Some(current) = sched.current_mut() else { return -1 };

    mark_cow_writable(&mut current.vma_list);

    let Some(child_cr3) = vmm::clone_address_space(current.cr3, &current.vma_list) else {
        warn!("fork: out of memory cloning address space");
        return -1;
    };
    let child_vma = vma::clone_list(&current.vma_list);

    let mut child = Process::new(&current.name.clone(), current.pid, child_cr3, frame.user_rip, frame.user_rsp);
    child.vma_list = child_vma;
    child.cwd = current.cwd.clone();
    child.cursor_x = current.cursor_x;
    child.cursor_y = current.cursor_y;
    child.fpu_state = current.fpu_state;
    for i in 0..MAX_FDS {
        if current.fd_table[i].used {
            vfs::ref_inc(current.fd_table[i].vnode);
        }
        child.fd_table[i] = current.fd_table[i];
    }
    child.fork_resume = Some(ForkResume { regs: *frame });
    child.prepare_initial_stack();

    let pid = child.pid;
    sched.push(child);
    pid as i64
}

/// Implements `exit()`. Sets Zombie, stores `status`, and lets the
/// scheduler's `wake_waiters` pick up any parent blocked in `wait4`/exec.
/// The address space is freed at reap time (`Scheduler::reap_zombie_child`),
/// not here, so the parent can still observe the exit status and the
/// vma-list-derived page-fault policy stays valid for any in-flight fault.
pub fn exit(status: i32) -> ! {
    {
        let mut sched = SCHEDULER.lock();
        if let Some(current) = sched.current_mut() {
            current.state = ProcessState::Zombie;
            current.exit_status = status;
        }
    }
    loop {
        do_schedule();
    }
}

/// Implements `exec()`. Non-POSIX: does not replace the calling process's
/// image. Instead it loads `path` into a fresh address space as a new
/// child process, blocks the caller in the exec handshake until that
/// child exits, and returns the child's exit status.
pub fn exec(path: &str) -> i64 {
    let (parent_pid, cwd) = match with_current(|p| (p.pid, p.cwd.clone())) {
        Some(v) => v,
        None => return -1,
    };
    let resolved = vfs::resolve_relative(&cwd, path);

    let child_pid = match spawn(&resolved, parent_pid) {
        Ok(pid) => pid,
        Err(e) => {
            warn!("exec: {} failed: {}", resolved, e);
            return -1;
        }
    };

    {
        let mut sched = SCHEDULER.lock();
        if let Some(current) = sched.current_mut() {
            current.state = ProcessState::Waiting;
            current.wait_for_pid = child_pid as i64;
            current.exec_done = false;
        }
    }

    loop {
        {
            let mut sched = SCHEDULER.lock();
            if let Some((_pid, status)) = sched.reap_zombie_child(parent_pid, child_pid as i64) {
                if let Some(current) = sched.current_mut() {
                    current.exec_done = true;
                    current.exec_child_status = status;
                    current.wait_for_pid = -1;
                }
                return status as i64;
            }
        }
        do_schedule();
    }
}

/// Implements `wait4(pid, ...)`. `pid == -1` waits for any child; a
/// specific pid waits only for that child. Returns `None` immediately if
/// the caller has no matching child at all.
pub fn wait4(pid: i64) -> Option<(i64, i32)> {
    let parent_pid = with_current(|p| p.pid)?;

    loop {
        let mut sched = SCHEDULER.lock();
        if let Some((child_pid, status)) = sched.reap_zombie_child(parent_pid, pid) {
            return Some((child_pid as i64, status));
        }
        if !sched.has_child(parent_pid) {
            return None;
        }
        if let Some(current) = sched.current_mut() {
            current.state = ProcessState::Waiting;
            current.wait_for_pid = pid;
        }
        drop(sched);
        do_schedule();
    }
}

/// Implements `sleep(ms)`: computes `wake_time` and yields until reached.
pub fn sleep_ms(ms: u64) {
    let wake_time = crate::task::clock::now() + ms * config::TIMER_HZ / 1000;
    {
        let mut sched = SCHEDULER.lock();
        if let Some(current) = sched.current_mut() {
            current.state = ProcessState::Sleeping;
            current.wake_time = wake_time;
        }
    }
    loop {
        do_schedule();
        if with_current(|p| p.state != ProcessState::Sleeping).unwrap_or(true) {
            break;
        }
    }
}

/// Voluntary yield — same mechanism as preemption.
pub fn yield_now() {
    do_schedule();
}

// ── Spawn / ELF loading (§4.10, used by exec and boot) ───────────

const USER_STACK_TOP: u64 = 0x7FFF_F000;
const USER_STACK_PAGES: u64 = 16; // 64 KiB

/// Loads an ELF64 executable from `path` into a fresh address space and
/// creates a Ready child process for it (parented to `parent_pid`). Used
/// both by `exec()` and by the kernel's initial `init` spawn.
pub fn spawn(path: &str, parent_pid: u64) -> Result<u64, &'static str> {
    let open = vfs::open(path, OpenFlags::RDONLY).ok_or("file not found")?;
    let node = unsafe { &*open.vnode };
    let size = node.size as usize;
    let mut data = alloc::vec![0u8; size];
    let mut fd = FileDescriptor { used: true, vnode: open.vnode, offset: 0, dir_cursor: 0, hint: Default::default() };
    let mut total = 0usize;
    while total < size {
        let n = vfs::read(&mut fd, &mut data[total..]);
        if n <= 0 {
            break;
        }
        total += n as usize;
    }
    vfs::close_vnode(open.vnode, false);
    data.truncate(total);

    let elf = crate::fs::elf::parse(&data).map_err(|_| "invalid ELF64")?;

    let pml4 = vmm::create_address_space().ok_or("out of memory")?;
    let mut vma_list: VmaList = None;

    for phdr in elf.phdrs {
        if !phdr.is_load() {
            continue;
        }
        let vaddr = phdr.p_vaddr;
        let memsz = phdr.p_memsz as usize;
        let filesz = phdr.p_filesz as usize;
        let offset = phdr.p_offset as usize;
        let (_readable, executable) = crate::fs::elf::segment_flags(phdr.p_flags);
        let writable = phdr.p_flags & 0x2 != 0;

        let page_start = vaddr & !0xFFF;
        let page_end = (vaddr + memsz as u64 + 0xFFF) & !0xFFF;
        let num_pages = (page_end - page_start) / 4096;

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if !executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }

        // This address space isn't the active one yet, so segment bytes are
        // copied through each frame's HHDM mapping rather than through the
        // (unmapped, in this CR3) user virtual address.
        for i in 0..num_pages {
            let page_virt = crate::memory::address::VirtAddr::new(page_start + i * 4096);
            let frame = crate::memory::pmm::alloc_frame_zeroed().ok_or("out of physical memory")?;

            let page_file_start = page_start + i * 4096;
            let page_file_end = page_file_start + 4096;
            let copy_start = core::cmp::max(page_file_start, vaddr);
            let copy_end = core::cmp::min(page_file_end, vaddr + filesz as u64);
            if copy_end > copy_start {
                let src_off = offset + (copy_start - vaddr) as usize;
                let dst_off = (copy_start - page_file_start) as usize;
                let len = (copy_end - copy_start) as usize;
                unsafe {
                    let dst = frame.to_virt().as_mut_ptr::<u8>().add(dst_off);
                    core::ptr::copy_nonoverlapping(data.as_ptr().add(src_off), dst, len);
                }
            }

            unsafe {
                let _ = vmm::map_page(pml4, page_virt, frame, flags);
            }
        }

        let mut vma_flags = VmaFlags::READ | VmaFlags::USER;
        if writable {
            vma_flags |= VmaFlags::WRITE;
        }
        if executable {
            vma_flags |= VmaFlags::EXEC;
        }
        let kind = if executable { VmaType::Text } else { VmaType::Data };
        vma::add(&mut vma_list, page_start, page_end, vma_flags, kind);
    }

    // User stack: USER_STACK_PAGES pages ending at USER_STACK_TOP.
    let stack_bottom = USER_STACK_TOP - USER_STACK_PAGES * 4096;
    for i in 0..USER_STACK_PAGES {
        let page_virt = crate::memory::address::VirtAddr::new(stack_bottom + i * 4096);
        let frame = crate::memory::pmm::alloc_frame_zeroed().ok_or("out of physical memory")?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER | PageTableFlags::NO_EXECUTE;
        unsafe {
            let _ = vmm::map_page(pml4, page_virt, frame, flags);
        }
    }
    vma::add(&mut vma_list, stack_bottom, USER_STACK_TOP, VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER, VmaType::Stack);

    let mut proc = Process::new(path, parent_pid, pml4, elf.entry, USER_STACK_TOP);
    proc.vma_list = vma_list;
    proc.prepare_initial_stack();
    let pid = proc.pid;

    SCHEDULER.lock().push(proc);
    info!("spawned '{}' (pid {}): entry={:#x}", path, pid, elf.entry);
    Ok(pid)
}

/// Creates the always-Ready idle task that guarantees `do_schedule` never
/// finds an empty ready queue. It never enters user mode: its kernel stack
/// is prepared to run `idle_loop` directly rather than the usual
/// ring-3 trampoline.
pub fn spawn_idle() {
    let pml4 = vmm::active_pml4();
    let mut proc = Process::new("idle", 0, pml4, 0, 0);
    let top = proc.kernel_stack.top();
    let sp = top - 7 * 8;
    unsafe {
        let ptr = sp as *mut u64;
        ptr.add(0).write(0);
        ptr.add(1).write(0);
        ptr.add(2).write(0);
        ptr.add(3).write(0);
        ptr.add(4).write(0);
        ptr.add(5).write(0);
        ptr.add(6).write(idle_loop as u64);
    }
    proc.kernel_rsp = sp;
    SCHEDULER.lock().push(proc);
}

extern "C" fn idle_loop() -> ! {
    loop {
        unsafe {
            core::arch::asm!("sti; hlt", options(nomem, nostack));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_unique_and_increasing() {
        let a = alloc_pid();
        let b = alloc_pid();
        let c = alloc_pid();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn mark_cow_writable_only_flags_writable_vmas() {
        let mut list: VmaList = None;
        vma::add(
            &mut list,
            0x1000,
            0x2000,
            VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER,
            VmaType::Text,
        );
        vma::add(
            &mut list,
            0x2000,
            0x3000,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
            VmaType::Data,
        );

        mark_cow_writable(&mut list);

        let text = vma::find(&list, 0x1000).unwrap();
        assert!(!text.is_cow, "non-writable segment must not become COW");
        let data = vma::find(&list, 0x2000).unwrap();
        assert!(data.is_cow, "writable segment must become COW on fork");
    }

    #[test]
    fn scheduler_starts_with_no_tasks_and_no_current() {
        let sched = Scheduler::new();
        assert_eq!(sched.task_count(), 0);
        assert_eq!(sched.ready_count(), 0);
        assert!(sched.current().is_none());
    }
}
