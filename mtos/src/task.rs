//! Task trait for interact with user process.

use crate::{KernelError, syscall::Registers};

/// Represents a **task** executed by a thread.
///
/// This trait defines the functionalities the machine needs from the kernel
/// while it runs a user program: handling **system calls** and accessing the
/// program's **virtual memory**.
pub trait Task: Send {
    /// Handles a **system call** triggered by the user program.
    ///
    /// - The `registers` parameter contains the state of the CPU registers at
    ///   the time of the system call.
    /// - Implementations of this function should parse the system call
    ///   arguments, execute the corresponding operation, and store the result
    ///   back in `registers`.
    ///
    /// Some calls, such as thread exit, never return to the caller.
    fn syscall(&mut self, registers: &mut Registers);

    /// Copy user memory at virtual address `va` into `buf`.
    fn read_user(&self, va: usize, buf: &mut [u8]) -> Result<(), KernelError>;

    /// Copy `data` into user memory at virtual address `va`.
    fn write_user(&self, va: usize, data: &[u8]) -> Result<(), KernelError>;
}
