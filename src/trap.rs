use crate::kernelvec::kernelvec;
use crate::kthread;
use crate::memlayout::{TRAMPOLINE, trapframe};
use crate::param::NKSTACK_PAGES;
use crate::proc::{self, CPU_TABLE, Channel, current_kthread};
use crate::riscv::{
    PGSIZE, interrupts,
    registers::{satp, scause, sepc, sstatus, stimecmp, stval, stvec, time, tp},
};
use crate::spinlock::SpinLock;
use crate::syscall::syscall;
use crate::trampoline::trampoline;

pub static TICKS: SpinLock<usize> = SpinLock::new(0, "time");

unsafe extern "C" {
    fn uservec();
    fn userret(trapframe: usize, page_table: usize) -> !;
}

/// Handles an interrupt, exception, or system call from user space.
///
/// # Safety
/// Called from `trampoline.rs`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrap() {
    unsafe {
        // make sure the trap came from user space
        assert!(
            (sstatus::read() & sstatus::SPP) == 0,
            "usertrap: not from user mode"
        );

        // send subsequent interrupts and exceptions to kerneltrap, since we
        // are in kernel mode now
        stvec::write(kernelvec as *const () as usize);

        let kt = current_kthread();
        let proc = kt.proc();
        let data = kt.data_mut();
        let trapframe = data.trapframe_mut();

        // save the user program counter in case this handler yields to
        // another core, and the new core returns to user space, clobbering
        // sepc.
        trapframe.epc = sepc::read();

        let scause = scause::Scause::from(scause::read());
        let mut timer = false;

        match scause.cause() {
            // system call
            scause::Trap::Exception(scause::Exception::EnvironmentCall) => {
                if proc.is_killed() || kt.is_killed() {
                    kthread::exit(-1);
                }

                // sepc points to the ecall instruction, but we want to
                // return to the next instruction
                trapframe.epc += 4;

                // an interrupt would clobber sepc, scause, and sstatus, so
                // enable only now that we are done with those registers
                interrupts::enable();

                syscall(trapframe);
            }

            // timer interrupt
            scause::Trap::Interrupt(scause::Interrupt::SupervisorTimer) => {
                clock_intr();
                timer = true;
            }

            // something else; the fault takes the whole process down
            _ => {
                let inner = proc.inner.lock();

                println!(
                    "usertrap: unexpected scause=0x{:X} pid={} tid={} sepc=0x{:X} stval=0x{:X}",
                    scause.bits(),
                    *inner.pid,
                    *kt.inner.lock().tid,
                    sepc::read(),
                    stval::read(),
                );

                drop(inner);
                proc.set_killed();
            }
        }

        // Observe cancellation before going anywhere near user state. Each
        // cancelled thread takes itself down; the last one out promotes to a
        // full process exit, so concurrently killed threads never contend
        // over the process teardown.
        if proc.is_killed() || kt.is_killed() {
            kthread::exit(-1);
        }

        if timer {
            proc::r#yield();
        }

        usertrapret();
    }
}

/// Returns to user space through the trampoline.
///
/// # Safety
/// The calling thread must be the current thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrapret() -> ! {
    let kt = current_kthread();
    let proc = kt.proc();

    // We're about to switch the destination of traps from kerneltrap() to
    // usertrap(), so turn off interrupts until we're back in user space,
    // where usertrap() is correct.
    interrupts::disable();

    // send syscalls, interrupts, and exceptions to uservec in trampoline.rs
    let trampoline_uservec =
        TRAMPOLINE + (uservec as *const () as usize - trampoline as *const () as usize);
    unsafe { stvec::write(trampoline_uservec) };

    // set up the trapframe values that uservec will need when this thread
    // next traps into the kernel
    // Safety: we are the current thread
    let data = unsafe { kt.data_mut() };
    let kernel_sp = (data.kstack + NKSTACK_PAGES * PGSIZE).as_usize();
    let tf = data.trapframe_mut();
    tf.kernel_satp = unsafe { satp::read() };
    tf.kernel_sp = kernel_sp;
    tf.kernel_trap = usertrap as *const () as usize;
    tf.kernel_hartid = unsafe { tp::read() };

    // set up the registers that trampoline.rs's sret will use

    // set Supervisor Previous Privilege mode to User
    let mut x = unsafe { sstatus::read() };
    x &= !sstatus::SPP; // clear SPP to 0 for user mode
    x |= sstatus::SPIE; // enable interrupts in user mode
    unsafe { sstatus::write(x) };

    // set the Supervisor Exception Program Counter to the saved user pc
    unsafe { sepc::write(tf.epc) };

    // tell trampoline.rs the user page table to switch to
    let user_satp = satp::make(proc.data().pagetable().as_pa().as_usize());

    // Jump to userret in the trampoline at the top of memory, handing it
    // this thread's trapframe slot address (it parks it in sscratch for the
    // next uservec) and the user page table.
    unsafe {
        let trampoline_userret =
            TRAMPOLINE + (userret as *const () as usize - trampoline as *const () as usize);
        let trampoline_userret: unsafe extern "C" fn(usize, usize) -> ! =
            core::mem::transmute(trampoline_userret);
        trampoline_userret(trapframe(kt.id), user_satp)
    }
}

/// Interrupts and exceptions from kernel code come here via `kernelvec`, on
/// whatever the current kernel stack is.
///
/// # Safety
/// Called from `kernelvec.rs`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kerneltrap() {
    unsafe {
        let saved_sepc = sepc::read();
        let saved_sstatus = sstatus::read();
        let scause = scause::Scause::from(scause::read());

        assert!(
            saved_sstatus & sstatus::SPP != 0,
            "kerneltrap: not from supervisor mode"
        );

        assert!(!interrupts::get(), "kerneltrap: interrupts enabled");

        match scause.cause() {
            scause::Trap::Interrupt(scause::Interrupt::SupervisorTimer) => {
                clock_intr();

                // a timer interrupt means this thread has had its slice;
                // give up the CPU unless we are in the scheduler itself
                if proc::current_kthread_opt().is_some() {
                    proc::r#yield();
                }
            }

            // exceptions in supervisor mode, and interrupts from unknown
            // sources, are fatal
            _ => {
                println!(
                    "scause=0x{:X} sepc=0x{:X} stval=0x{:X}",
                    scause.bits(),
                    saved_sepc,
                    stval::read()
                );
                panic!("kerneltrap");
            }
        }

        // yield() may have caused traps on other threads, so restore the
        // trap registers for kernelvec.rs's sret
        sepc::write(saved_sepc);
        sstatus::write(saved_sstatus);
    }
}

/// Handles clock interrupts. Hart 0 owns the tick count.
pub fn clock_intr() {
    let _lock = CPU_TABLE.lock_current();
    let hart = unsafe { CPU_TABLE.current_id() };

    if hart == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        drop(ticks);
        proc::wakeup(Channel::Ticks);
    }

    // Ask for the next timer interrupt. This also clears the interrupt
    // request. 1,000,000 cycles is about a tenth of a second in qemu.
    unsafe { stimecmp::write(time::read() + 1_000_000) };
}

/// Sets this hart up to take exceptions and traps while in the kernel.
///
/// # Safety
/// Must be called once per hart during initialization.
pub unsafe fn init_hart() {
    unsafe { stvec::write(kernelvec as *const () as usize) };
}
