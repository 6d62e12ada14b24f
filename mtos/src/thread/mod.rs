//! Thread abstration, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. In mtos every kernel thread is backed by a host
//! thread, so threads run truly in parallel; the only way for a thread to
//! stop running before it exits is to park itself with
//! [`Current::park_with`] until another thread hands its [`ParkHandle`] back
//! through [`ParkHandle::unpark`].
//!
//! Threads that were not created by [`ThreadBuilder`] (for example the host
//! thread that boots the kernel) are adopted on first use and receive a
//! thread id like any other thread.

use crate::{KernelError, sync::SpinLock};
use std::{
    any::Any,
    cell::RefCell,
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Exit code reported for a thread that panicked.
pub const PANIC_EXIT_CODE: i32 = -1;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable.
    Runnable,
    /// Thread is running.
    Running,
    /// Thread is exited with exitcode.
    Exited(i32),
    /// Thread is parked.
    Parked,
}

static TID: AtomicU64 = AtomicU64::new(1);

static THREAD_STATE_TABLE: SpinLock<BTreeMap<u64, Arc<SpinLock<ThreadState>>>> =
    SpinLock::new(BTreeMap::new());

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// Get specified thread's [`ThreadState`] by TID (Thread ID).
pub fn get_state_by_tid(tid: u64) -> Result<ThreadState, KernelError> {
    let tst = THREAD_STATE_TABLE.lock();
    let state = tst.get(&tid).ok_or(KernelError::InvalidArgument)?;
    let result = *state.lock();
    Ok(result)
}

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: u64,
    /// Thread name
    pub name: String,
    /// State of the thread.
    pub state: Arc<SpinLock<ThreadState>>,
    native: std::thread::Thread,
}

impl Thread {
    fn register(state: ThreadState) -> (u64, Arc<SpinLock<ThreadState>>) {
        let tid = TID.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(SpinLock::new(state));
        THREAD_STATE_TABLE.lock().insert(tid, state.clone());
        (tid, state)
    }

    fn adopt() -> Arc<Self> {
        let native = std::thread::current();
        let (tid, state) = Self::register(ThreadState::Running);
        Arc::new(Self {
            tid,
            name: native.name().unwrap_or("adopted").to_string(),
            state,
            native,
        })
    }

    fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }
}

/// Request to terminate the current thread, carried by unwinding up to the
/// entry point installed by [`ThreadBuilder::spawn`].
struct ExitRequest(i32);

/// A handle to join thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: u64,
    inner: std::thread::JoinHandle<i32>,
}

impl JoinHandle {
    /// Join this handle and returns exit code.
    pub fn join(self) -> i32 {
        self.inner.join().unwrap_or(PANIC_EXIT_CODE)
    }
}

/// A handle that represent the parked thread.
pub struct ParkHandle {
    th: Arc<Thread>,
    woken: Arc<AtomicBool>,
}

impl ParkHandle {
    /// Thread id of the parked thread.
    pub fn tid(&self) -> u64 {
        self.th.tid
    }

    /// Consume the handle and unpark the underlying thread.
    pub fn unpark(self) {
        // State first: the parked thread marks itself running as soon as it
        // observes `woken`.
        self.th.set_state(ThreadState::Runnable);
        self.woken.store(true, Ordering::Release);
        self.th.native.unpark();
    }
}

/// Run a function `f` with current thread as an argument.
#[inline]
pub fn with_current<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    let th = CURRENT.with(|current| current.borrow_mut().get_or_insert_with(Thread::adopt).clone());
    f(&th)
}

/// The opaque structure indicating the running thread on the current cpu.
pub struct Current {
    _p: (),
}

impl Current {
    /// Run a function `f` with [`ParkHandle`] for current thread, and then park
    /// the current thread.
    ///
    /// `f` is the place to publish the handle (usually into a wait queue) and
    /// to drop any spinlock guarding that queue. The thread does not return
    /// from this function until the handle is unparked.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let th = with_current(Arc::clone);
        let woken = Arc::new(AtomicBool::new(false));
        th.set_state(ThreadState::Parked);
        f(ParkHandle {
            th: th.clone(),
            woken: woken.clone(),
        });
        while !woken.load(Ordering::Acquire) {
            std::thread::park();
        }
        th.set_state(ThreadState::Running);
    }

    /// Exit the current thread with `exit_code`.
    ///
    /// The stack of the current thread is unwound, so every guard it holds is
    /// released on the way out. Must be called from a thread spawned by
    /// [`ThreadBuilder`].
    pub fn exit(exit_code: i32) -> ! {
        panic::resume_unwind(Box::new(ExitRequest(exit_code)))
    }

    /// Get the current thread's id.
    pub fn get_tid() -> u64 {
        with_current(|th| th.tid)
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    tid: u64,
    state: Arc<SpinLock<ThreadState>>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        let (tid, state) = Thread::register(ThreadState::Runnable);
        Self {
            name: String::from(name),
            tid,
            state,
        }
    }

    /// Get the thread id of this thread.
    pub fn get_tid(&self) -> u64 {
        self.tid
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> Result<JoinHandle, KernelError> {
        let Self { name, tid, state } = self;
        let thread_state = state.clone();
        let thread_name = name.clone();
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || thread_start(tid, thread_name, thread_state, thread_fn));
        match spawned {
            Ok(inner) => Ok(JoinHandle { tid, inner }),
            Err(e) => {
                log::warn!("failed to spawn thread #{tid}: {e}");
                THREAD_STATE_TABLE.lock().remove(&tid);
                Err(KernelError::NoMemory)
            }
        }
    }
}

fn thread_start<F: FnOnce()>(
    tid: u64,
    name: String,
    state: Arc<SpinLock<ThreadState>>,
    thread_fn: F,
) -> i32 {
    let th = Arc::new(Thread {
        tid,
        name,
        state,
        native: std::thread::current(),
    });
    CURRENT.with(|current| *current.borrow_mut() = Some(th.clone()));
    th.set_state(ThreadState::Running);

    let exit_code = match panic::catch_unwind(AssertUnwindSafe(thread_fn)) {
        Ok(()) => 0,
        Err(payload) => exit_code_of(&th, payload),
    };
    th.set_state(ThreadState::Exited(exit_code));
    THREAD_STATE_TABLE.lock().remove(&tid);
    CURRENT.with(|current| current.borrow_mut().take());
    exit_code
}

fn exit_code_of(th: &Thread, payload: Box<dyn Any + Send>) -> i32 {
    match payload.downcast::<ExitRequest>() {
        Ok(request) => request.0,
        Err(_) => {
            log::error!("thread `{}` (#{}) panicked", th.name, th.tid);
            PANIC_EXIT_CODE
        }
    }
}
