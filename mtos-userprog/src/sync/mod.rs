//! Blocking synchronization primitives.
//!
//! [`Semaphore`] is the foundation: it is the only primitive that parks a
//! thread. [`Lock`] is built from two semaphores, and [`Condition`] from two
//! semaphores plus a counter. Every shared kernel structure above this module
//! is protected by a [`Lock`], usually in the shape of a [`Mutex`].

pub mod condition;
pub mod lock;
pub mod semaphore;

pub use condition::Condition;
pub use lock::{Lock, Mutex, MutexGuard};
pub use semaphore::Semaphore;
