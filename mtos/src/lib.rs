//! # mtos
//!
//! Infrastructure of the mtos teaching kernel.
//!
//! This crate provides the pieces every kernel project builds upon but does
//! not implement itself: the low-level [`SpinLock`], kernel threads with a
//! parking protocol, the register file and physical memory of the simulated
//! machine, the [`Task`] and [`Machine`] abstractions that connect user
//! programs to the kernel, and the executable images the loader reads from.
//!
//! Host threads stand in for kernel threads, and a [`NativeMachine`] runs user
//! programs written as host routines, so the kernel can be exercised
//! end-to-end without an instruction-level emulator.
//!
//! [`SpinLock`]: sync::SpinLock
//! [`Task`]: task::Task
//! [`Machine`]: machine::Machine
//! [`NativeMachine`]: machine::NativeMachine
#![deny(missing_docs)]

pub mod fs;
pub mod machine;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod thread;

/// Represents errors that can occur in the kernel.
///
/// Each variant carries the closest errno name in its documentation. A user
/// program never observes the variant itself: the syscall layer folds every
/// error into a `-1` return value.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// No such thread. (ESRCH)
    NoSuchThread,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Resource temporarily unavailable. (EAGAIN)
    TryAgain,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Too many processes. (EPROCLIM)
    TooManyProcesses,
    /// No space left. (ENOSPC)
    NoSpace,
    /// Resource deadlock would occur. (EDEADLK)
    Deadlock,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            KernelError::NoSuchEntry => "no such file or directory",
            KernelError::NoSuchThread => "no such thread",
            KernelError::NoExec => "exec format error",
            KernelError::TryAgain => "resource temporarily unavailable",
            KernelError::NoMemory => "out of memory",
            KernelError::InvalidAccess => "permission denied",
            KernelError::BadAddress => "bad address",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::TooManyProcesses => "too many processes",
            KernelError::NoSpace => "no space left",
            KernelError::Deadlock => "resource deadlock would occur",
            KernelError::NameTooLong => "file name too long",
            KernelError::NoSuchSyscall => "invalid system call number",
        };
        f.write_str(s)
    }
}

impl std::error::Error for KernelError {}

#[cfg(test)]
mod tests {
    use super::KernelError;

    #[test]
    fn display_names_the_errno_meaning() {
        assert_eq!(KernelError::NoSuchThread.to_string(), "no such thread");
        assert_eq!(KernelError::TryAgain.to_string(), "resource temporarily unavailable");
        assert_eq!(
            KernelError::Deadlock.to_string(),
            "resource deadlock would occur"
        );
        let boxed: Box<dyn std::error::Error> = Box::new(KernelError::NoSpace);
        assert_eq!(boxed.to_string(), "no space left");
    }
}
