//! User library.
//!
//! What a user program links against when it runs on a
//! [`NativeMachine`]: the program entry stub, the thread exit stub, and one
//! wrapper per system call. [`install`] places the stubs at their code
//! addresses.
//!
//! Every program image starts with one word holding the code address of the
//! program's `main`. The entry stub at address [`START`] reads that word,
//! calls `main`, and passes its result to [`exit`], so returning from `main`
//! ends the process. Threads created with [`thread_create`] return into
//! [`THREAD_EXIT`], which ends the thread.

use crate::syscall::SyscallNumber;
use mtos::{
    fs::RamImage,
    machine::{NativeMachine, UserContext},
};

/// Code address of the program entry stub.
pub const START: usize = 0;
/// Code address of the thread exit stub.
pub const THREAD_EXIT: usize = 0x10;
/// Virtual address of the word naming `main`.
pub const MAIN_WORD: usize = 0;
/// Virtual address of the first byte of initialized data.
pub const DATA_BASE: usize = 8;

/// Places the stubs into `machine`.
pub fn install(machine: &mut NativeMachine) -> &mut NativeMachine {
    machine
        .register(START, |ctx| {
            let code = match ctx.read_word(MAIN_WORD) {
                Ok(main) => ctx.call(main as usize).unwrap_or(-1),
                Err(_) => -1,
            };
            exit(ctx, code as i32)
        })
        .register(THREAD_EXIT, |ctx| thread_exit(ctx))
}

/// Builds the image of a program whose `main` lives at code address `main`.
///
/// `data` is placed at [`DATA_BASE`], followed by `bss` zeroed bytes.
pub fn program(main: usize, data: &[u8], bss: usize) -> RamImage {
    RamImage::new(&(main as u64).to_le_bytes(), data, bss)
}

fn call(ctx: &mut UserContext<'_>, no: SyscallNumber, args: &[usize]) -> isize {
    ctx.syscall(no as usize, args)
}

/// Stops the machine.
pub fn halt(ctx: &mut UserContext<'_>) -> ! {
    call(ctx, SyscallNumber::Halt, &[]);
    unreachable!("halt returned")
}

/// Ends the process with `code`.
pub fn exit(ctx: &mut UserContext<'_>, code: i32) -> ! {
    call(ctx, SyscallNumber::Exit, &[code as usize]);
    unreachable!("exit returned")
}

/// Starts a thread running the routine at `function` with `arg`.
///
/// Returns the new thread id, or -1.
pub fn thread_create(ctx: &mut UserContext<'_>, function: usize, arg: usize) -> isize {
    call(ctx, SyscallNumber::ThreadCreate, &[function, arg, THREAD_EXIT])
}

/// Ends the calling thread.
pub fn thread_exit(ctx: &mut UserContext<'_>) -> ! {
    call(ctx, SyscallNumber::ThreadExit, &[]);
    unreachable!("thread exit returned")
}

/// Waits for thread `tid`. Returns 0, or -1.
pub fn thread_join(ctx: &mut UserContext<'_>, tid: isize) -> isize {
    call(ctx, SyscallNumber::ThreadJoin, &[tid as usize])
}

/// Id of the calling thread.
pub fn thread_id(ctx: &mut UserContext<'_>) -> isize {
    call(ctx, SyscallNumber::ThreadId, &[])
}

/// Creates a semaphore holding `value` units and returns its handle.
pub fn sem_init(ctx: &mut UserContext<'_>, value: usize) -> isize {
    call(ctx, SyscallNumber::SemInit, &[value])
}

/// Takes a unit of semaphore `sem`.
pub fn sem_p(ctx: &mut UserContext<'_>, sem: isize) -> isize {
    call(ctx, SyscallNumber::SemP, &[sem as usize])
}

/// Returns a unit to semaphore `sem`.
pub fn sem_v(ctx: &mut UserContext<'_>, sem: isize) -> isize {
    call(ctx, SyscallNumber::SemV, &[sem as usize])
}

/// Starts the program named by the NUL-terminated string at `filename`.
///
/// The return address is passed as 0: [`START`] exits once `main` returns.
/// Returns the process id, or -1.
pub fn process_create(ctx: &mut UserContext<'_>, filename: usize, arg: usize) -> isize {
    call(ctx, SyscallNumber::ProcessCreate, &[filename, arg, 0])
}

/// Writes `name` at `scratch` and starts the program it names.
pub fn process_create_named(ctx: &mut UserContext<'_>, scratch: usize, name: &str, arg: usize) -> isize {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    if ctx.write_bytes(scratch, &bytes).is_err() {
        return -1;
    }
    process_create(ctx, scratch, arg)
}

/// Waits for process `pid`. Returns 0, or -1.
pub fn wait_process(ctx: &mut UserContext<'_>, pid: isize) -> isize {
    call(ctx, SyscallNumber::WaitProcess, &[pid as usize])
}

/// Id of the calling process.
pub fn get_process_id(ctx: &mut UserContext<'_>) -> isize {
    call(ctx, SyscallNumber::GetProcessId, &[])
}
