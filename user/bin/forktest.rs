#![no_std]
#![no_main]

use user::*;

#[unsafe(no_mangle)]
fn main(_args: Args) {
    round_trip();
    no_children();
    grow_shrink();
    kill_sleeper();
    exhaust_table();
    orphan();

    println!("forktest: all tests passed");
}

/// fork, child exits with a status, wait returns the right pid and status.
fn round_trip() {
    let pid = fork().expect("round_trip: fork");

    if pid == 0 {
        exit(42);
    }

    let mut status = 0;
    let reaped = wait(Some(&mut status)).expect("round_trip: wait");

    assert!(reaped == pid, "round_trip: reaped the wrong child");
    assert!(status == 42, "round_trip: wrong exit status");

    println!("forktest: round trip ok");
}

/// wait with no children fails immediately instead of blocking.
fn no_children() {
    assert!(
        wait(None) == Err(SysError::NoChildren),
        "no_children: wait should have failed"
    );

    println!("forktest: no children ok");
}

/// sbrk up and back down leaves the break where it started, and the old
/// pages are usable again after regrowing.
fn grow_shrink() {
    const GROW: isize = 4 * 4096;

    let base = sbrk(0).expect("grow_shrink: sbrk(0)");

    let addr = sbrk(GROW).expect("grow_shrink: grow");
    assert!(addr == base, "grow_shrink: sbrk returned the wrong old break");

    // touch the new memory
    unsafe {
        let p = base as *mut u8;
        p.write_volatile(0xA5);
        p.add(GROW as usize - 1).write_volatile(0x5A);
    }

    sbrk(-GROW).expect("grow_shrink: shrink");
    let back = sbrk(0).expect("grow_shrink: sbrk(0) after");
    assert!(back == base, "grow_shrink: break moved");

    // regrow and make sure the high-water mark is addressable again
    sbrk(GROW).expect("grow_shrink: regrow");
    unsafe {
        (base as *mut u8).add(GROW as usize - 1).write_volatile(0xEE);
    }
    sbrk(-GROW).expect("grow_shrink: shrink again");

    println!("forktest: grow/shrink ok");
}

/// A child stuck in sleep() is killable; it never runs user code again and
/// reports the killed status.
fn kill_sleeper() {
    let pid = fork().expect("kill_sleeper: fork");

    if pid == 0 {
        let _ = sleep(10_000);
        // only reached if the kill was lost
        exit(0);
    }

    // let the child get into its sleep
    sleep(2).expect("kill_sleeper: sleep");
    kill(pid).expect("kill_sleeper: kill");

    let mut status = 0;
    let reaped = wait(Some(&mut status)).expect("kill_sleeper: wait");

    assert!(reaped == pid, "kill_sleeper: reaped the wrong child");
    assert!(status == -1, "kill_sleeper: child was not killed in sleep");

    println!("forktest: kill sleeper ok");
}

/// fork until the process table runs dry; the failing fork reports an
/// error, every child is reapable, and the table works again afterwards.
fn exhaust_table() {
    let mut children = 0;

    loop {
        match fork() {
            Ok(0) => {
                // hold the slot until the parent is done filling the table
                let _ = sleep(20);
                exit(0);
            }
            Ok(_) => children += 1,
            Err(_) => break,
        }
    }

    assert!(children > 0, "exhaust_table: first fork failed");

    while wait(None).is_ok() {}

    // the table must be usable again
    let pid = fork().expect("exhaust_table: fork after drain");
    if pid == 0 {
        exit(0);
    }
    wait(None).expect("exhaust_table: wait after drain");

    println!("forktest: table exhaustion ok ({} slots)", children);
}

/// An exiting parent hands its children to init; the grandparent only ever
/// reaps its own child.
fn orphan() {
    let pid = fork().expect("orphan: fork");

    if pid == 0 {
        // child: leave a grandchild behind and exit first
        let grandchild = fork().expect("orphan: fork grandchild");
        if grandchild == 0 {
            let _ = sleep(5);
            // by now our parent is gone and init will reap us
            exit(0);
        }
        exit(7);
    }

    let mut status = 0;
    let reaped = wait(Some(&mut status)).expect("orphan: wait");
    assert!(reaped == pid && status == 7, "orphan: wrong child reaped");

    // the grandchild is init's problem now, not ours
    assert!(
        wait(None) == Err(SysError::NoChildren),
        "orphan: grandchild still attached"
    );

    println!("forktest: orphan reparenting ok");
}
