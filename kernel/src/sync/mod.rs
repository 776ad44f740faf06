// =============================================================================
// MinimalOS NextGen — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel.
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, multi-core, interrupt-driven
// environment.
//
// IMPORTANT: Lock ordering rules (see architecture doc):
//   Level 1 (innermost): PMM bitmap lock
//   Level 2: Page table lock
//   Level 3: VFS mount/vnode lock
//   Level 4: Scheduler run queue lock (outermost)
//
// NEVER acquire a lower-level lock while holding a higher-level lock.
// Violating this WILL cause deadlocks on multi-core.
// =============================================================================

pub mod spinlock;

