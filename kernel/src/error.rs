//! Kernel-internal error type for the operation-failure tier of the error
//! model (Tier 3 — a syscall or kernel operation that can't complete, as
//! opposed to a corrupted invariant, which panics instead).
//!
//! Call sites log at `warn!` on the way out and return `-1`/`None` across
//! the syscall boundary; `KernelError` itself never crosses into user
//! space.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidPointer,
    NotFound,
    NotADirectory,
    IsADirectory,
    BadDescriptor,
    NoSpace,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::InvalidPointer => "invalid user pointer",
            KernelError::NotFound => "not found",
            KernelError::NotADirectory => "not a directory",
            KernelError::IsADirectory => "is a directory",
            KernelError::BadDescriptor => "bad file descriptor",
            KernelError::NoSpace => "no space left",
        };
        f.write_str(msg)
    }
}
