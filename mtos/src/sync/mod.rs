//! Synchronization primitives of the infrastructure layer.
//!
//! Only [`SpinLock`] lives here. Blocking primitives are built by the kernel on
//! top of it and the parking protocol of [`crate::thread`].

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
