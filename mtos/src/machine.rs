//! The CPU of the simulated machine.
//!
//! A [`Machine`] executes the user context described by a register file on
//! behalf of a [`Task`]. Whenever the program traps, the machine calls back
//! into the task.
//!
//! [`NativeMachine`] executes programs whose "instructions" are host
//! routines. Each routine is registered at a code address. Running a context
//! means calling the routine at the program counter, storing its return value
//! in the result register, and continuing at the return address. When the
//! return address is zero the context has nothing left to execute and
//! [`Machine::run`] returns.

use crate::{
    KernelError,
    syscall::{ARG_REGS, RESULT_REG, RET_ADDR_REG, Registers},
    task::Task,
};
use std::{collections::BTreeMap, sync::Arc};

/// A CPU able to run user contexts.
pub trait Machine: Send + Sync {
    /// Run the context described by `regs` until it returns to address zero.
    ///
    /// Syscalls are delivered to `task`. A syscall that terminates the
    /// current thread unwinds through this function.
    fn run(&self, task: &mut dyn Task, regs: &mut Registers);
}

/// Code of a user routine.
pub type Routine = Arc<dyn Fn(&mut UserContext<'_>) -> isize + Send + Sync>;

/// A machine whose code is made of host routines.
#[derive(Default, Clone)]
pub struct NativeMachine {
    routines: BTreeMap<usize, Routine>,
}

impl NativeMachine {
    /// Create a machine without any code.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `routine` at code address `addr`, replacing what was there.
    pub fn register<F>(&mut self, addr: usize, routine: F) -> &mut Self
    where
        F: Fn(&mut UserContext<'_>) -> isize + Send + Sync + 'static,
    {
        self.routines.insert(addr, Arc::new(routine));
        self
    }

    fn routine(&self, addr: usize) -> Option<Routine> {
        self.routines.get(&addr).cloned()
    }
}

impl Machine for NativeMachine {
    fn run(&self, task: &mut dyn Task, regs: &mut Registers) {
        loop {
            let pc = regs.pc();
            let Some(routine) = self.routine(pc) else {
                log::warn!("no code at {pc:#x}, stopping context");
                return;
            };
            let ret = routine(&mut UserContext {
                machine: self,
                task: &mut *task,
                regs: &mut *regs,
            });
            regs.write(RESULT_REG, ret as usize);

            let ra = regs.read(RET_ADDR_REG);
            if ra == 0 {
                return;
            }
            regs.write(RET_ADDR_REG, 0);
            regs.set_pc(ra);
        }
    }
}

/// What a running routine sees of its execution context.
pub struct UserContext<'a> {
    machine: &'a NativeMachine,
    task: &'a mut dyn Task,
    regs: &'a mut Registers,
}

impl UserContext<'_> {
    /// The first argument register.
    pub fn arg(&self) -> usize {
        self.regs.read(ARG_REGS[0])
    }

    /// Current stack pointer.
    pub fn stack_pointer(&self) -> usize {
        self.regs.stack_pointer()
    }

    /// Register file of this context.
    pub fn registers(&self) -> &Registers {
        self.regs
    }

    /// Trap into the kernel with syscall `sysno` and up to four arguments.
    ///
    /// Argument registers are restored once the kernel returns.
    pub fn syscall(&mut self, sysno: usize, args: &[usize]) -> isize {
        let saved = ARG_REGS.map(|reg| self.regs.read(reg));
        self.regs.write(RESULT_REG, sysno);
        for (reg, arg) in ARG_REGS.iter().zip(args) {
            self.regs.write(*reg, *arg);
        }
        self.task.syscall(self.regs);
        for (reg, value) in ARG_REGS.iter().zip(saved) {
            self.regs.write(*reg, value);
        }
        self.regs.read(RESULT_REG) as isize
    }

    /// Call the routine at `addr` in this context.
    ///
    /// Returns `None` if no code lives at `addr`.
    pub fn call(&mut self, addr: usize) -> Option<isize> {
        let routine = self.machine.routine(addr)?;
        Some(routine(self))
    }

    /// Read `buf.len()` bytes of user memory.
    pub fn read_bytes(&self, va: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        self.task.read_user(va, buf)
    }

    /// Write `data` into user memory.
    pub fn write_bytes(&mut self, va: usize, data: &[u8]) -> Result<(), KernelError> {
        self.task.write_user(va, data)
    }

    /// Read a little-endian word of user memory.
    pub fn read_word(&self, va: usize) -> Result<u64, KernelError> {
        let mut buf = [0; 8];
        self.task.read_user(va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian word of user memory.
    pub fn write_word(&mut self, va: usize, value: u64) -> Result<(), KernelError> {
        self.task.write_user(va, &value.to_le_bytes())
    }
}
