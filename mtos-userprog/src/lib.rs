//! # Multithreaded user programs.
//!
//! This crate turns the [`mtos`] infrastructure into a kernel that runs
//! several user programs at once, each with several threads.
//!
//! The building blocks, from the bottom up:
//!
//! - [`sync`]: the semaphore, lock and condition variable everything else is
//!   synchronized with.
//! - [`bitmap`] and [`frame_provider`]: bookkeeping of physical frames.
//! - [`addrspace`] and [`thread_manager`]: the memory of a program and the
//!   lifecycle of the threads sharing it.
//! - [`process_table`]: the lifecycle of whole programs.
//! - [`userthread`] and [`userprocess`]: the operations behind the thread and
//!   process system calls, dispatched by [`syscall`].
//! - [`kernel`]: the context object tying all of the above together.
//!
//! User programs are written against [`ulib`].
//!
//! ## Example
//!
//! ```
//! use mtos::{fs::RamFs, machine::NativeMachine};
//! use mtos_userprog::{kernel::Kernel, ulib};
//! use std::sync::Arc;
//!
//! const MAIN: usize = 0x1000;
//!
//! let mut machine = NativeMachine::new();
//! ulib::install(&mut machine).register(MAIN, |_| 0);
//! let mut fs = RamFs::new();
//! fs.insert("hello", ulib::program(MAIN, &[], 0));
//!
//! let kernel = Kernel::builder().build(Arc::new(machine), Arc::new(fs)).unwrap();
//! kernel.start_process("hello").unwrap();
//! kernel.wait_for_halt();
//! ```
#![deny(missing_docs)]

pub mod addrspace;
pub mod bitmap;
pub mod frame_provider;
pub mod kernel;
pub mod process_table;
pub mod sync;
pub mod syscall;
pub mod thread_manager;
pub mod ulib;
pub mod userprocess;
pub mod userthread;
