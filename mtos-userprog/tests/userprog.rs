use mtos::{
    KernelError,
    fs::RamFs,
    machine::NativeMachine,
    mm::PhysicalMemory,
};
use mtos_userprog::{
    kernel::{Kernel, KernelBuilder},
    ulib::{self, DATA_BASE},
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

fn boot(machine: NativeMachine, programs: Vec<(&str, mtos::fs::RamImage)>, builder: KernelBuilder) -> Arc<Kernel> {
    let mut fs = RamFs::new();
    for (name, image) in programs {
        fs.insert(name, image);
    }
    builder
        .seed(0x5eed)
        .build(Arc::new(machine), Arc::new(fs))
        .unwrap()
}

fn wait_for_halt(kernel: &Arc<Kernel>) {
    let (tx, rx) = mpsc::channel();
    let cloned = kernel.clone();
    std::thread::spawn(move || {
        cloned.wait_for_halt();
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(20))
        .expect("machine did not halt");
    assert!(kernel.is_halted());
}

fn run(kernel: &Arc<Kernel>, program: &str) {
    assert_eq!(kernel.start_process(program), Ok(1));
    wait_for_halt(kernel);
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn all_frames_free(kernel: &Arc<Kernel>) {
    let frames = kernel.frames();
    wait_until("frames to be returned", || {
        frames.num_avail_frame() == frames.total() - 1
    });
}

type Record = Arc<Mutex<Vec<isize>>>;

mod threads {
    use super::*;

    #[test]
    fn shared_counter_under_user_semaphore() {
        const MAIN: usize = 0x1000;
        const ADDER: usize = 0x1100;
        const SEM: usize = DATA_BASE;
        const SUM: usize = DATA_BASE + 8;

        let sum = Arc::new(AtomicU64::new(0));
        let mut machine = NativeMachine::new();
        let result = sum.clone();
        ulib::install(&mut machine)
            .register(MAIN, move |ctx| {
                let sem = ulib::sem_init(ctx, 1);
                ctx.write_word(SEM, sem as u64).unwrap();
                let a = ulib::thread_create(ctx, ADDER, 0);
                let b = ulib::thread_create(ctx, ADDER, 0);
                ulib::thread_join(ctx, a);
                ulib::thread_join(ctx, b);
                result.store(ctx.read_word(SUM).unwrap(), Ordering::SeqCst);
                0
            })
            .register(ADDER, |ctx| {
                let sem = ctx.read_word(SEM).unwrap() as isize;
                for _ in 0..10 {
                    ulib::sem_p(ctx, sem);
                    let value = ctx.read_word(SUM).unwrap();
                    std::thread::yield_now();
                    ctx.write_word(SUM, value + 1).unwrap();
                    ulib::sem_v(ctx, sem);
                }
                0
            });

        let kernel = boot(
            machine,
            vec![("semtest", ulib::program(MAIN, &[0; 16], 0))],
            Kernel::builder(),
        );
        run(&kernel, "semtest");
        assert_eq!(sum.load(Ordering::SeqCst), 20);
        all_frames_free(&kernel);
    }

    #[test]
    fn join_waits_for_the_thread() {
        const MAIN: usize = 0x1000;
        const WORKER: usize = 0x1100;
        const COUNTER: usize = DATA_BASE;

        let record: Record = Arc::default();
        let mut machine = NativeMachine::new();
        let out = record.clone();
        ulib::install(&mut machine)
            .register(MAIN, move |ctx| {
                let worker = ulib::thread_create(ctx, WORKER, 0);
                let joined = ulib::thread_join(ctx, worker);
                let progress = ctx.read_word(COUNTER).unwrap() as isize;
                let again = ulib::thread_join(ctx, worker);
                let me = ulib::thread_id(ctx);
                let itself = ulib::thread_join(ctx, me);
                let bogus = ulib::thread_join(ctx, 999);
                out.lock()
                    .unwrap()
                    .extend([me, worker, joined, progress, again, itself, bogus]);
                0
            })
            .register(WORKER, |ctx| {
                for _ in 0..5 {
                    let value = ctx.read_word(COUNTER).unwrap();
                    std::thread::sleep(Duration::from_millis(2));
                    ctx.write_word(COUNTER, value + 1).unwrap();
                }
                ulib::thread_exit(ctx)
            });

        let kernel = boot(
            machine,
            vec![("join", ulib::program(MAIN, &[0; 8], 0))],
            Kernel::builder(),
        );
        run(&kernel, "join");
        assert_eq!(*record.lock().unwrap(), [1, 2, 0, 5, -1, -1, -1]);
    }

    #[test]
    fn thread_limit_and_stack_slots() {
        const MAIN: usize = 0x1000;
        const CHILD: usize = 0x1100;
        const GATE: usize = DATA_BASE;
        const DATA: usize = 16;

        // (thread id seen by the child, its stack pointer)
        let children = Arc::new(Mutex::new(Vec::new()));
        let record: Record = Arc::default();
        let mut machine = NativeMachine::new();
        let (seen, out) = (children.clone(), record.clone());
        ulib::install(&mut machine)
            .register(MAIN, move |ctx| {
                let gate = ulib::sem_init(ctx, 0);
                ctx.write_word(GATE, gate as u64).unwrap();
                let mut created: Vec<_> = (0..3).map(|_| ulib::thread_create(ctx, CHILD, 0)).collect();
                let refused = ulib::thread_create(ctx, CHILD, 0);
                for _ in &created {
                    ulib::sem_v(ctx, gate);
                }
                for tid in &created {
                    ulib::thread_join(ctx, *tid);
                }
                let again = ulib::thread_create(ctx, CHILD, 0);
                ulib::sem_v(ctx, gate);
                ulib::thread_join(ctx, again);

                created.extend([refused, again]);
                out.lock().unwrap().extend(created);
                0
            })
            .register(CHILD, move |ctx| {
                let tid = ulib::thread_id(ctx);
                seen.lock().unwrap().push((tid, ctx.stack_pointer()));
                let gate = ctx.read_word(GATE).unwrap() as isize;
                ulib::sem_p(ctx, gate);
                0
            });

        let builder = Kernel::builder()
            .page_size(128)
            .user_stack_size(1024)
            .thread_stack_pages(2);
        let kernel = boot(
            machine,
            vec![("limit", ulib::program(MAIN, &[0; DATA], 0))],
            builder,
        );
        run(&kernel, "limit");

        assert_eq!(*record.lock().unwrap(), [2, 3, 4, -1, 5]);

        let top = (DATA_BASE + DATA + 1024).div_ceil(128) * 128;
        let mut children = children.lock().unwrap().clone();
        children.sort();
        assert_eq!(
            children,
            [
                (2, top - 256),
                (3, top - 2 * 256),
                (4, top - 3 * 256),
                (5, top - 256),
            ]
        );
        all_frames_free(&kernel);
    }

    #[test]
    fn last_thread_exit_ends_the_process() {
        const MAIN: usize = 0x1000;
        const CHILD: usize = 0x1100;

        let finished = Arc::new(AtomicBool::new(false));
        let mut machine = NativeMachine::new();
        let flag = finished.clone();
        ulib::install(&mut machine)
            .register(MAIN, |ctx| {
                ulib::thread_create(ctx, CHILD, 0);
                ulib::thread_exit(ctx)
            })
            .register(CHILD, move |ctx| {
                std::thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::SeqCst);
                ulib::thread_exit(ctx)
            });

        let kernel = boot(
            machine,
            vec![("orphan", ulib::program(MAIN, &[], 0))],
            Kernel::builder(),
        );
        run(&kernel, "orphan");
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(kernel.processes().running(), 0);
    }

    #[test]
    fn process_exit_waits_for_other_threads() {
        const MAIN: usize = 0x1000;
        const CHILD: usize = 0x1100;

        let finished = Arc::new(AtomicBool::new(false));
        let mut machine = NativeMachine::new();
        let flag = finished.clone();
        ulib::install(&mut machine)
            .register(MAIN, |ctx| {
                ulib::thread_create(ctx, CHILD, 0);
                0
            })
            .register(CHILD, move |_| {
                std::thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
                0
            });

        let kernel = boot(
            machine,
            vec![("exit", ulib::program(MAIN, &[], 0))],
            Kernel::builder(),
        );
        run(&kernel, "exit");
        assert!(finished.load(Ordering::SeqCst));
    }
}

mod processes {
    use super::*;
    use mtos::syscall::RET_ADDR_REG;
    use mtos_userprog::syscall::SyscallNumber;

    #[test]
    fn table_capacity_counts_the_initial_process() {
        const PARENT: usize = 0x2000;
        const CHILD: usize = 0x2100;
        const SCRATCH: usize = DATA_BASE;

        let release = Arc::new(AtomicBool::new(false));
        let record: Record = Arc::default();
        let mut machine = NativeMachine::new();
        let (gate, out) = (release.clone(), record.clone());
        ulib::install(&mut machine)
            .register(PARENT, move |ctx| {
                let me = ulib::get_process_id(ctx);
                let first = ulib::process_create_named(ctx, SCRATCH, "child", 0);
                let second = ulib::process_create_named(ctx, SCRATCH, "child", 0);
                let refused = ulib::process_create_named(ctx, SCRATCH, "child", 0);
                gate.store(true, Ordering::SeqCst);
                let w1 = ulib::wait_process(ctx, first);
                let w2 = ulib::wait_process(ctx, second);
                let reused = ulib::process_create_named(ctx, SCRATCH, "child", 0);
                let w3 = ulib::wait_process(ctx, reused);
                out.lock()
                    .unwrap()
                    .extend([me, first, second, refused, w1, w2, reused, w3]);
                0
            })
            .register(CHILD, move |ctx| {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                ulib::get_process_id(ctx)
            });

        let kernel = boot(
            machine,
            vec![
                ("parent", ulib::program(PARENT, &[0; 16], 0)),
                ("child", ulib::program(CHILD, &[], 0)),
            ],
            Kernel::builder().max_processes(3),
        );
        run(&kernel, "parent");
        assert_eq!(*record.lock().unwrap(), [1, 2, 3, -1, 0, 0, 2, 0]);
        all_frames_free(&kernel);
    }

    #[test]
    fn initial_thread_gets_arg_and_return_address() {
        const PARENT: usize = 0x2000;
        const CHILD: usize = 0x2100;
        const SCRATCH: usize = DATA_BASE;

        let record: Record = Arc::default();
        let mut machine = NativeMachine::new();
        let (parent_out, child_out) = (record.clone(), record.clone());
        ulib::install(&mut machine)
            .register(PARENT, move |ctx| {
                if ctx.write_bytes(SCRATCH, b"child\0").is_err() {
                    return -1;
                }
                let pid = ctx.syscall(
                    SyscallNumber::ProcessCreate as usize,
                    &[SCRATCH, 7, 0x4321],
                );
                let waited = ulib::wait_process(ctx, pid);
                parent_out.lock().unwrap().extend([pid, waited]);
                0
            })
            .register(CHILD, move |ctx| {
                let seen = [ctx.arg(), ctx.registers().read(RET_ADDR_REG)];
                child_out.lock().unwrap().extend(seen.map(|v| v as isize));
                0
            });

        let kernel = boot(
            machine,
            vec![
                ("parent", ulib::program(PARENT, &[0; 16], 0)),
                ("child", ulib::program(CHILD, &[], 0)),
            ],
            Kernel::builder(),
        );
        run(&kernel, "parent");
        // The child still ends through the start routine, so the parent's
        // wait succeeds.
        assert_eq!(*record.lock().unwrap(), [7, 0x4321, 2, 0]);
        all_frames_free(&kernel);
    }

    #[test]
    fn wait_process_errors() {
        const MAIN: usize = 0x2000;
        const CHILD: usize = 0x2100;
        const SCRATCH: usize = DATA_BASE;

        let record: Record = Arc::default();
        let mut machine = NativeMachine::new();
        let out = record.clone();
        ulib::install(&mut machine)
            .register(MAIN, move |ctx| {
                let me = ulib::get_process_id(ctx);
                let own = ulib::wait_process(ctx, me);
                let zero = ulib::wait_process(ctx, 0);
                let far = ulib::wait_process(ctx, 999);
                let child = ulib::process_create_named(ctx, SCRATCH, "child", 0);
                let waited = ulib::wait_process(ctx, child);
                let finished = ulib::wait_process(ctx, child);
                out.lock()
                    .unwrap()
                    .extend([own, zero, far, child, waited, finished]);
                0
            })
            .register(CHILD, |_| 0);

        let kernel = boot(
            machine,
            vec![
                ("main", ulib::program(MAIN, &[0; 16], 0)),
                ("child", ulib::program(CHILD, &[], 0)),
            ],
            Kernel::builder().max_processes(4),
        );
        run(&kernel, "main");
        assert_eq!(*record.lock().unwrap(), [-1, -1, -1, 2, 0, 0]);
    }

    #[test]
    fn halt_stops_everything() {
        const MAIN: usize = 0x2000;
        const SPINNER: usize = 0x2100;

        let mut machine = NativeMachine::new();
        ulib::install(&mut machine)
            .register(MAIN, |ctx| {
                ulib::thread_create(ctx, SPINNER, 0);
                ulib::halt(ctx)
            })
            .register(SPINNER, |ctx| loop {
                // Every syscall after the halt ends the caller.
                ulib::thread_id(ctx);
                std::thread::sleep(Duration::from_millis(1));
            });

        let kernel = boot(
            machine,
            vec![("halt", ulib::program(MAIN, &[], 0))],
            Kernel::builder(),
        );
        run(&kernel, "halt");
    }

    #[test]
    fn bad_requests_return_minus_one() {
        const MAIN: usize = 0x2000;
        const SCRATCH: usize = DATA_BASE;

        let record: Record = Arc::default();
        let mut machine = NativeMachine::new();
        let out = record.clone();
        ulib::install(&mut machine).register(MAIN, move |ctx| {
            let unknown = ctx.syscall(99, &[]);
            let sem_p = ulib::sem_p(ctx, 42);
            let sem_v = ulib::sem_v(ctx, 42);
            let negative = ulib::sem_init(ctx, usize::MAX);
            let missing = ulib::process_create_named(ctx, SCRATCH, "missing", 0);
            let unmapped = ulib::process_create(ctx, usize::MAX - 4, 0);
            let sem = ulib::sem_init(ctx, 0);
            out.lock()
                .unwrap()
                .extend([unknown, sem_p, sem_v, negative, missing, unmapped, sem]);
            0
        });

        let kernel = boot(
            machine,
            vec![("bad", ulib::program(MAIN, &[0; 16], 0))],
            Kernel::builder(),
        );
        run(&kernel, "bad");
        assert_eq!(*record.lock().unwrap(), [-1, -1, -1, -1, -1, -1, 0]);
    }

    #[test]
    fn start_fails_without_memory() {
        let mut machine = NativeMachine::new();
        ulib::install(&mut machine);
        let kernel = boot(
            machine,
            vec![("big", ulib::program(0x1000, &[], 0))],
            Kernel::builder().phys_pages(8).page_size(128).user_stack_size(1024),
        );
        assert_eq!(kernel.start_process("big"), Err(KernelError::NoMemory));
        assert_eq!(kernel.start_process("none"), Err(KernelError::NoSuchEntry));
        assert_eq!(kernel.frames().num_avail_frame(), 7);
        assert_eq!(kernel.processes().running(), 0);
        assert!(!kernel.is_halted());
    }
}

mod addrspace {
    use super::*;
    use mtos::fs::RamImage;
    use mtos_userprog::{
        addrspace::{AddrSpace, SpaceLayout},
        frame_provider::FrameProvider,
        process_table::ProcessTable,
    };

    const LAYOUT: SpaceLayout = SpaceLayout {
        page_size: 128,
        user_stack_size: 512,
        thread_stack_size: 256,
    };

    fn frames(count: usize) -> Arc<FrameProvider> {
        Arc::new(FrameProvider::with_seed(Arc::new(PhysicalMemory::new(count, 128)), 9))
    }

    #[test]
    fn loads_segments_and_protects_code() {
        let frames = frames(32);
        let processes = ProcessTable::new(2);
        let image = RamImage::new(&[0xAA; 256], &[1, 2, 3, 4], 8);
        let space = AddrSpace::new(&image, &frames, &processes, LAYOUT).unwrap();

        assert_eq!(space.pid, 1);
        assert_eq!(space.num_pages(), (256 + 4 + 8 + 512usize).div_ceil(128));
        assert_eq!(frames.num_avail_frame(), 31 - space.num_pages());

        let mut code = [0; 4];
        space.read_mem(252, &mut code).unwrap();
        assert_eq!(code, [0xAA; 4]);
        assert_eq!(space.write_mem(0, &[0]), Err(KernelError::InvalidAccess));
        assert_eq!(space.write_mem(255, &[0]), Err(KernelError::InvalidAccess));

        let mut data = [0xFF; 12];
        space.read_mem(256, &mut data).unwrap();
        assert_eq!(data, [1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
        space.write_mem(300, b"hi\0").unwrap();
        assert_eq!(space.read_string(300, 16).as_deref(), Ok("hi"));
        assert_eq!(space.read_string(300, 2), Err(KernelError::NameTooLong));

        let mut byte = [0];
        assert_eq!(
            space.read_mem(space.size(), &mut byte),
            Err(KernelError::BadAddress)
        );
        let regs = space.init_registers();
        assert_eq!(regs.pc(), 0);
        assert_eq!(regs.stack_pointer(), space.size() - 16);

        drop(space);
        assert_eq!(frames.num_avail_frame(), 31);
    }

    #[test]
    fn full_process_table_keeps_frames() {
        let frames = frames(32);
        let processes = ProcessTable::new(1);
        processes.claim().unwrap();

        let result = AddrSpace::new(&ulib::program(0x10, &[], 0), &frames, &processes, LAYOUT);
        assert!(matches!(result, Err(KernelError::TooManyProcesses)));
        assert_eq!(frames.num_avail_frame(), 31);
    }

    #[test]
    fn not_enough_frames() {
        let image = RamImage::new(&[0; 8], &[], 1024);
        let processes = ProcessTable::new(1);

        // Larger than the whole machine.
        let small = frames(8);
        let result = AddrSpace::new(&image, &small, &processes, LAYOUT);
        assert!(matches!(result, Err(KernelError::NoMemory)));
        assert_eq!(small.num_avail_frame(), 7);

        // Fits the machine, but too few frames are free.
        let busy = frames(32);
        let taken: Vec<_> = (0..25).map(|_| busy.get_empty_frame().unwrap()).collect();
        let result = AddrSpace::new(&image, &busy, &processes, LAYOUT);
        assert!(matches!(result, Err(KernelError::NoMemory)));
        assert_eq!(busy.num_avail_frame(), 6);
        for frame in taken {
            busy.release_frame(frame);
        }
        assert!(!processes.is_active(1));
    }

    #[test]
    fn user_semaphores_are_per_space() {
        let frames = frames(32);
        let processes = ProcessTable::new(2);
        let a = AddrSpace::new(&ulib::program(0x10, &[], 0), &frames, &processes, LAYOUT).unwrap();
        let b = AddrSpace::new(&ulib::program(0x10, &[], 0), &frames, &processes, LAYOUT).unwrap();

        assert_eq!(a.sem_init(2), 0);
        assert_eq!(a.sem_init(0), 1);
        assert_eq!(a.semaphore(0).unwrap().value(), 2);
        assert!(b.semaphore(0).is_err());
        assert_eq!(b.sem_init(5), 0);
        assert_eq!(b.semaphore(0).unwrap().value(), 5);
    }
}

mod thread_manager {
    use super::*;
    use mtos::thread::{ThreadBuilder, ThreadState, get_state_by_tid};
    use mtos_userprog::thread_manager::{MAIN_THREAD_ID, ThreadManager};
    use std::collections::HashSet;

    #[test]
    fn remove_wakes_every_joiner() {
        let threads = Arc::new(ThreadManager::new(0x1000, 0x400, 0x100));
        let target = {
            let mut table = threads.lock_table();
            let id = table.next_thread_id();
            table.add_thread(id);
            id
        };

        let joiners: Vec<_> = (0..3)
            .map(|_| {
                let builder = ThreadBuilder::new("joiner");
                let tid = builder.get_tid();
                let threads = threads.clone();
                let handle = builder
                    .spawn(move || {
                        let table = threads.lock_table();
                        // `None` means the target was gone before we got the lock.
                        if let Some(table) = threads.join(table, target) {
                            assert!(!table.has_thread(target));
                            table.unlock();
                        }
                    })
                    .unwrap();
                (tid, handle)
            })
            .collect();
        for (tid, _) in &joiners {
            wait_until("joiner to sleep", || {
                get_state_by_tid(*tid) == Ok(ThreadState::Parked)
            });
        }

        let mut table = threads.lock_table();
        assert_eq!(threads.remove_thread(&mut table, target), Some(1));
        table.unlock();
        for (_, handle) in joiners {
            assert_eq!(handle.join(), 0);
        }
        assert_eq!(threads.num_threads(), 1);
    }

    #[test]
    fn exactly_one_remover_sees_the_table_empty() {
        const A: u64 = 10;
        const B: u64 = 11;
        const J: u64 = 12;

        for _ in 0..20 {
            let threads = Arc::new(ThreadManager::new(0x1000, 0x400, 0x100));
            {
                let mut table = threads.lock_table();
                assert_eq!(threads.remove_thread(&mut table, MAIN_THREAD_ID), Some(0));
                for id in [A, B, J] {
                    table.add_thread(id);
                }
            }
            let left: Arc<Mutex<Vec<Option<usize>>>> = Arc::default();

            // J waits for A, then leaves.
            let joiner = ThreadBuilder::new("J");
            let joiner_tid = joiner.get_tid();
            let joiner = {
                let (threads, left) = (threads.clone(), left.clone());
                joiner
                    .spawn(move || {
                        let table = threads.lock_table();
                        let mut table = threads.join(table, A).unwrap();
                        left.lock().unwrap().push(threads.remove_thread(&mut table, J));
                    })
                    .unwrap()
            };
            wait_until("J to join A", || {
                get_state_by_tid(joiner_tid) == Ok(ThreadState::Parked)
            });

            // A holds the table while B queues on it.
            let mut table = threads.lock_table();
            let queued = ThreadBuilder::new("B");
            let queued_tid = queued.get_tid();
            let queued = {
                let (threads, left) = (threads.clone(), left.clone());
                queued
                    .spawn(move || {
                        let mut table = threads.lock_table();
                        left.lock().unwrap().push(threads.remove_thread(&mut table, B));
                    })
                    .unwrap()
            };
            wait_until("B to queue on the table", || {
                get_state_by_tid(queued_tid) == Ok(ThreadState::Parked)
            });

            // Waking J releases the table, and B takes it before A does.
            left.lock().unwrap().push(threads.remove_thread(&mut table, A));
            table.unlock();
            assert_eq!(joiner.join(), 0);
            assert_eq!(queued.join(), 0);

            let left = left.lock().unwrap();
            assert_eq!(left.len(), 3);
            assert!(left.iter().all(Option::is_some));
            assert_eq!(left.iter().filter(|n| **n == Some(0)).count(), 1, "{left:?}");
            assert_eq!(threads.num_threads(), 0);
        }
    }

    #[test]
    fn concurrent_stack_reservations_are_distinct() {
        let threads = Arc::new(ThreadManager::new(0x1000, 0x1000, 0x100));
        assert_eq!(threads.max_threads(), 15);
        let handles: Vec<_> = (0..15)
            .map(|_| {
                let threads = threads.clone();
                std::thread::spawn(move || threads.get_stack_pointer())
            })
            .collect();
        let sps: HashSet<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        assert_eq!(sps.len(), 15);
        assert!(sps.iter().all(|sp| *sp <= 0x1000 - 0x100 && sp % 0x100 == 0));
        assert_eq!(threads.get_stack_pointer(), None);
    }
}
