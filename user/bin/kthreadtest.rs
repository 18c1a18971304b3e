#![no_std]
#![no_main]

use core::sync::atomic::{AtomicUsize, Ordering};

use user::*;

const STACK_SIZE: usize = 4096;

#[repr(C, align(16))]
struct Stack([u8; STACK_SIZE]);

// one stack per thread slot, plus a spare handed to the create that is
// expected to fail; slot 0 belongs to the main thread
static mut STACKS: [Stack; 9] = [const { Stack([0; STACK_SIZE]) }; 9];

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn stack(i: usize) -> &'static mut [u8] {
    unsafe { &mut (*(&raw mut STACKS[i])).0 }
}

#[unsafe(no_mangle)]
fn main(_args: Args) {
    join_round_trip();
    unknown_tid();
    counting_workers();
    kill_sleeping_worker();
    exhaust_threads();
    last_thread_exits_process();

    println!("kthreadtest: all tests passed");
}

extern "C" fn worker_seven() -> ! {
    kthread_exit(7);
}

/// create then join returns the status the worker passed to kthread_exit.
fn join_round_trip() {
    let tid = kthread_create(worker_seven, stack(1)).expect("join_round_trip: create");

    let mut status = 0;
    kthread_join(tid, Some(&mut status)).expect("join_round_trip: join");

    assert!(status == 7, "join_round_trip: wrong exit status");

    println!("kthreadtest: join round trip ok");
}

/// joining a tid that never existed fails immediately.
fn unknown_tid() {
    assert!(
        kthread_join(4096, None).is_err(),
        "unknown_tid: join should have failed"
    );
    assert!(
        kthread_join(kthread_id(), None).is_err(),
        "unknown_tid: self-join should have failed"
    );

    println!("kthreadtest: unknown tid ok");
}

extern "C" fn worker_count() -> ! {
    COUNTER.fetch_add(1, Ordering::SeqCst);
    kthread_exit(0);
}

/// several workers actually run: each bumps the counter before exiting.
fn counting_workers() {
    COUNTER.store(0, Ordering::SeqCst);

    let mut tids = [0usize; 3];
    for (i, tid) in tids.iter_mut().enumerate() {
        *tid = kthread_create(worker_count, stack(1 + i)).expect("counting_workers: create");
    }

    for tid in tids {
        kthread_join(tid, None).expect("counting_workers: join");
    }

    assert!(
        COUNTER.load(Ordering::SeqCst) == 3,
        "counting_workers: some worker never ran"
    );

    println!("kthreadtest: counting workers ok");
}

extern "C" fn worker_sleepy() -> ! {
    let _ = sleep(10_000);
    // only reached if the kill was lost
    kthread_exit(0);
}

/// a worker stuck in sleep() is killable with kthread_kill; it exits on its
/// next trip through the kernel with the killed status instead of finishing
/// its sleep.
fn kill_sleeping_worker() {
    let tid = kthread_create(worker_sleepy, stack(1)).expect("kill_sleeping_worker: create");

    // let the worker get into its sleep
    sleep(2).expect("kill_sleeping_worker: sleep");
    kthread_kill(tid).expect("kill_sleeping_worker: kill");

    // give the victim a chance to observe the flag and exit
    sleep(2).expect("kill_sleeping_worker: sleep");

    let mut status = 0;
    kthread_join(tid, Some(&mut status)).expect("kill_sleeping_worker: join");
    assert!(status == -1, "kill_sleeping_worker: worker finished its sleep");

    println!("kthreadtest: kill sleeping worker ok");
}

extern "C" fn worker_parked() -> ! {
    let _ = sleep(10_000);
    kthread_exit(0);
}

/// create until the thread table runs dry; the failing create reports an
/// error and the slots come back after the workers die.
fn exhaust_threads() {
    let mut tids = [0usize; 8];
    let mut created = 0;

    loop {
        match kthread_create(worker_parked, stack(1 + created)) {
            Ok(tid) => {
                tids[created] = tid;
                created += 1;
            }
            Err(_) => break,
        }
    }

    // the main thread occupies one slot
    assert!(created == 7, "exhaust_threads: wrong number of slots");

    for tid in tids.iter().take(created) {
        kthread_kill(*tid).expect("exhaust_threads: kill");
    }

    // let the victims run down, then reclaim their slots
    sleep(5).expect("exhaust_threads: sleep");
    for tid in tids.iter().take(created) {
        kthread_join(*tid, None).expect("exhaust_threads: join");
    }

    // the table must be usable again
    let tid = kthread_create(worker_seven, stack(1)).expect("exhaust_threads: create after drain");
    kthread_join(tid, None).expect("exhaust_threads: join after drain");

    println!("kthreadtest: thread exhaustion ok");
}

/// when the last live thread of a process calls kthread_exit, the whole
/// process exits with that status.
fn last_thread_exits_process() {
    let pid = fork().expect("last_thread: fork");

    if pid == 0 {
        // this is the child's only thread
        kthread_exit(5);
    }

    let mut status = 0;
    let reaped = wait(Some(&mut status)).expect("last_thread: wait");

    assert!(reaped == pid, "last_thread: reaped the wrong child");
    assert!(status == 5, "last_thread: kthread_exit did not become exit");

    println!("kthreadtest: last thread exit ok");
}
