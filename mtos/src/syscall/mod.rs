//! System call infrastructure.
//!
//! The simulated CPU has a MIPS-like register file. A user program requests a
//! kernel service by placing the call number in [`RESULT_REG`], up to four
//! arguments in [`ARG_REGS`], and trapping into [`Task::syscall`]; the kernel
//! leaves its answer in [`RESULT_REG`].
//!
//! [`Task::syscall`]: crate::task::Task::syscall

/// Number of general purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// Register holding the syscall number on entry and the result on return.
pub const RESULT_REG: usize = 2;
/// Registers holding the first four arguments.
pub const ARG_REGS: [usize; 4] = [4, 5, 6, 7];
/// User stack pointer.
pub const STACK_REG: usize = 29;
/// Holds the return address of a procedure call.
pub const RET_ADDR_REG: usize = 31;
/// Multiply result, high word.
pub const HI_REG: usize = 32;
/// Multiply result, low word.
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter (for branch delay).
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter (for debugging).
pub const PREV_PC_REG: usize = 36;
/// Total number of registers.
pub const NUM_TOTAL_REGS: usize = 40;

/// The user-visible CPU state of one execution context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registers {
    regs: [usize; NUM_TOTAL_REGS],
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            regs: [0; NUM_TOTAL_REGS],
        }
    }
}

impl Registers {
    /// Read register `reg`.
    ///
    /// # Panics
    /// Panics if `reg` is not below [`NUM_TOTAL_REGS`].
    #[inline]
    pub fn read(&self, reg: usize) -> usize {
        self.regs[reg]
    }

    /// Write `value` into register `reg`.
    ///
    /// # Panics
    /// Panics if `reg` is not below [`NUM_TOTAL_REGS`].
    #[inline]
    pub fn write(&mut self, reg: usize, value: usize) {
        self.regs[reg] = value;
    }

    /// Current program counter.
    pub fn pc(&self) -> usize {
        self.regs[PC_REG]
    }

    /// Jump to `pc`; the next program counter follows one instruction later.
    pub fn set_pc(&mut self, pc: usize) {
        self.regs[PREV_PC_REG] = self.regs[PC_REG];
        self.regs[PC_REG] = pc;
        self.regs[NEXT_PC_REG] = pc.wrapping_add(4);
    }

    /// User stack pointer.
    pub fn stack_pointer(&self) -> usize {
        self.regs[STACK_REG]
    }

    /// Set the user stack pointer.
    pub fn set_stack_pointer(&mut self, sp: usize) {
        self.regs[STACK_REG] = sp;
    }
}
