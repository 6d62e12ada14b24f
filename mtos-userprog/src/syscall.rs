//! System call dispatch.
//!
//! A user program traps with the call number in the result register and up
//! to four arguments in the argument registers. [`SyscallAbi`] reads them,
//! the [`Task`] implementation of [`UserThread`] routes the call to the
//! matching `do_*` operation, and the outcome goes back into the result
//! register. Every failure reaches user code as `-1`.

use crate::userthread::UserThread;
use mtos::{
    KernelError,
    syscall::{ARG_REGS, RESULT_REG, Registers},
    task::Task,
    thread::Current,
};
use num_enum::TryFromPrimitive;

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Stops the machine.
    Halt = 0,
    /// Ends the calling process.
    Exit = 1,
    /// Starts a thread in the calling process.
    ThreadCreate = 2,
    /// Ends the calling thread.
    ThreadExit = 3,
    /// Waits for a thread of the calling process.
    ThreadJoin = 4,
    /// Id of the calling thread.
    ThreadId = 5,
    /// Creates a semaphore.
    SemInit = 6,
    /// Takes a unit of a semaphore.
    SemP = 7,
    /// Returns a unit to a semaphore.
    SemV = 8,
    /// Starts a program as a new process.
    ProcessCreate = 9,
    /// Waits for a process.
    WaitProcess = 10,
    /// Id of the calling process.
    GetProcessId = 11,
}

/// A struct representing the system call ABI (Application Binary Interface).
///
/// It holds the system call number, its four arguments, and the registers the
/// return value is written to.
pub struct SyscallAbi<'a> {
    /// The system call number that identifies the requested system service.
    pub sysno: usize,
    /// First argument for the system call.
    pub arg1: usize,
    /// Second argument for the system call.
    pub arg2: usize,
    /// Third argument for the system call.
    pub arg3: usize,
    /// Fourth argument for the system call.
    pub arg4: usize,
    /// Registers of the calling context.
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Constructs a [`SyscallAbi`] instance from the provided registers.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        Self {
            sysno: regs.read(RESULT_REG),
            arg1: regs.read(ARG_REGS[0]),
            arg2: regs.read(ARG_REGS[1]),
            arg3: regs.read(ARG_REGS[2]),
            arg4: regs.read(ARG_REGS[3]),
            regs,
        }
    }

    /// Sets the return value for the system call.
    ///
    /// On success the value is returned as is; any error becomes `-1`.
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        let value = match return_val {
            Ok(value) => value,
            Err(e) => {
                log::debug!("syscall {} failed: {e}", self.sysno);
                -1isize as usize
            }
        };
        self.regs.write(RESULT_REG, value);
    }
}

impl Task for UserThread {
    fn syscall(&mut self, regs: &mut Registers) {
        if self.kernel.is_halted() {
            Current::exit(0);
        }

        let abi = SyscallAbi::from_registers(regs);
        log::trace!(
            "pid {} thread {}: syscall {} ({:#x}, {:#x}, {:#x}, {:#x})",
            self.space.pid,
            self.tid,
            abi.sysno,
            abi.arg1,
            abi.arg2,
            abi.arg3,
            abi.arg4
        );
        let return_val = SyscallNumber::try_from(abi.sysno)
            .map_err(|_| KernelError::NoSuchSyscall)
            .and_then(|no| match no {
                SyscallNumber::Halt => self.do_halt(),
                SyscallNumber::Exit => self.do_process_exit(abi.arg1 as i32),
                SyscallNumber::ThreadCreate => self
                    .do_thread_create(abi.arg1, abi.arg2, abi.arg3)
                    .map(|tid| tid as usize),
                SyscallNumber::ThreadExit => self.do_thread_exit(),
                SyscallNumber::ThreadJoin => self.do_thread_join(abi.arg1 as u64).map(|_| 0),
                SyscallNumber::ThreadId => Ok(self.tid as usize),
                SyscallNumber::SemInit if (abi.arg1 as isize) < 0 => {
                    Err(KernelError::InvalidArgument)
                }
                SyscallNumber::SemInit => Ok(self.space.sem_init(abi.arg1)),
                SyscallNumber::SemP => self.space.semaphore(abi.arg1).map(|sem| {
                    sem.p();
                    0
                }),
                SyscallNumber::SemV => self.space.semaphore(abi.arg1).map(|sem| {
                    sem.v();
                    0
                }),
                SyscallNumber::ProcessCreate => self
                    .do_process_create(abi.arg1, abi.arg2, abi.arg3)
                    .map(|pid| pid as usize),
                SyscallNumber::WaitProcess => self.do_wait_process(abi.arg1 as u64).map(|_| 0),
                SyscallNumber::GetProcessId => Ok(self.space.pid as usize),
            });
        abi.set_return_value(return_val);
    }

    fn read_user(&self, va: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        self.space.read_mem(va, buf)
    }

    fn write_user(&self, va: usize, data: &[u8]) -> Result<(), KernelError> {
        self.space.write_mem(va, data)
    }
}
