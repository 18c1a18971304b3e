use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;

use alloc::boxed::Box;

use static_assertions::{const_assert, const_assert_eq};

use crate::error::KernelError;
use crate::memlayout::TRAPFRAME_SIZE;
use crate::param::{NKSTACK_PAGES, NKT};
use crate::proc::{
    self, Channel, Context, Proc, ProcInner, current_kthread, current_proc, fork_ret, sched,
};
use crate::riscv::PGSIZE;
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::vm::VA;

/// Per-thread data for the trap handling code in `trampoline.rs`.
///
/// Every kernel thread of a process owns one slot of the process's
/// [`TrapFrames`] page, which sits just under the trampoline page in the user
/// page table. `uservec` saves the user registers into the slot whose virtual
/// address `usertrapret()` left in sscratch, then initializes kernel
/// registers from the slot's `kernel_*` fields and jumps to `kernel_trap`.
/// The trapframe includes callee-saved user registers like s0-s11 because
/// the return-to-user path via `usertrapret()` doesn't return through the
/// entire kernel call stack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize, // kernel page table
    /*   8 */ pub kernel_sp: usize, // top of this thread's kernel stack
    /*  16 */ pub kernel_trap: usize, // usertrap()
    /*  24 */ pub epc: usize, // saved user program counter
    /*  32 */ pub kernel_hartid: usize, // saved kernel tp
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

// trampoline.rs and memlayout.rs hard-code the slot stride
const_assert_eq!(size_of::<TrapFrame>(), TRAPFRAME_SIZE);

/// One physical page holding the trapframe slot of every kernel thread of a
/// process. Mapped R|W at TRAPFRAME in the owner's user page table.
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct TrapFrames(pub [TrapFrame; NKT]);

// all thread slots must share the single mapped page
const_assert!(NKT * TRAPFRAME_SIZE <= PGSIZE);

impl TrapFrames {
    pub fn try_new_zeroed() -> Result<Box<Self>, KernelError> {
        let memory: Box<MaybeUninit<Self>> = try_log!(Box::try_new_zeroed());
        Ok(unsafe { memory.assume_init() })
    }
}

/// Wrapper around usize to represent thread IDs, unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tid(pub(crate) usize);

impl core::ops::Deref for Tid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The state of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KthreadState {
    #[default]
    Unused,
    Used,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

impl KthreadState {
    /// A live thread is one that still has a trip through the scheduler
    /// ahead of it.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            KthreadState::Used
                | KthreadState::Runnable
                | KthreadState::Running
                | KthreadState::Sleeping
        )
    }
}

/// Public fields of a kernel thread.
///
/// The thread lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct KthreadInner {
    /// Thread state
    pub state: KthreadState,
    /// If Some, sleeping on this channel
    pub channel: Option<Channel>,
    /// If true, has been killed
    pub killed: bool,
    /// Exit status to be returned to a joiner
    pub xstate: isize,
    /// Thread ID, unique within the owning process
    pub tid: Tid,
}

impl KthreadInner {
    const fn new() -> Self {
        Self {
            state: KthreadState::Unused,
            channel: None,
            killed: false,
            xstate: 0,
            tid: Tid(0),
        }
    }
}

/// Private fields of a kernel thread.
#[derive(Debug)]
pub struct KthreadData {
    /// Virtual address of this thread's kernel stack
    pub kstack: VA,
    /// This thread's slot in the owner's trapframe page
    pub trapframe: *mut TrapFrame,
    /// swtch() here to run the thread
    pub context: Context,
}

impl KthreadData {
    const fn new() -> Self {
        Self {
            kstack: VA::new(0),
            trapframe: ptr::null_mut(),
            context: Context::new(),
        }
    }

    /// Returns a reference to the trapframe.
    pub fn trapframe(&self) -> &TrapFrame {
        unsafe { &*self.trapframe }
    }

    /// Returns a mutable reference to the trapframe.
    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        unsafe { &mut *self.trapframe }
    }
}

unsafe impl Sync for KthreadData {}
unsafe impl Send for KthreadData {}

/// Kernel thread slot, one of NKT inline entries of a process slot.
#[derive(Debug)]
pub struct Kthread {
    /// Index within the owning process's thread table.
    pub id: usize,
    /// Index of the owning process slot in `PROC_TABLE`.
    pcb: usize,
    pub inner: SpinLock<KthreadInner>,
    data: UnsafeCell<KthreadData>,
}

unsafe impl Sync for Kthread {}

impl Kthread {
    pub(crate) const fn new(pcb: usize, id: usize) -> Self {
        Self {
            id,
            pcb,
            inner: SpinLock::new(KthreadInner::new(), "kthread"),
            data: UnsafeCell::new(KthreadData::new()),
        }
    }

    /// Returns the owning process slot.
    pub fn proc(&self) -> &'static Proc {
        proc::PROC_TABLE.get(self.pcb)
    }

    pub fn data(&self) -> &KthreadData {
        unsafe { &*self.data.get() }
    }

    /// Returns a mutable reference to the thread's data.
    ///
    /// # Safety
    /// The caller must ensure they have exclusive access to the thread. This
    /// is true if either
    ///     1. it's the current thread (most cases) or
    ///     2. the thread hasn't been made runnable yet (alloc, fork).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut KthreadData {
        unsafe { &mut *self.data.get() }
    }

    /// Returns true if this thread has been killed.
    ///
    /// Acquires and releases the thread lock.
    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }

    /// Returns the slot to Unused, consuming the held guard.
    pub fn free(&self, mut inner: SpinLockGuard<'_, KthreadInner>) {
        inner.tid = Tid(0);
        inner.channel = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = KthreadState::Unused;
    }
}

impl Proc {
    /// Searches this process's thread table for an Unused slot. If found,
    /// initializes the state required to run in the kernel and returns the
    /// slot with its lock held.
    ///
    /// Requires the process guard: tid assignment and slot membership only
    /// change under the process lock.
    pub fn alloc_kthread<'a>(
        &'a self,
        proc_inner: &mut SpinLockGuard<'_, ProcInner>,
    ) -> Result<(&'a Kthread, SpinLockGuard<'a, KthreadInner>), KernelError> {
        for kt in &self.kthreads {
            let mut inner = kt.inner.lock();
            if inner.state == KthreadState::Unused {
                inner.tid = Tid(proc_inner.next_tid);
                proc_inner.next_tid += 1;
                inner.state = KthreadState::Used;

                // Safety: the thread is not yet runnable, so we are the only
                // ones with access to it
                let data = unsafe { kt.data_mut() };

                // Safety: same for the process data; the trapframe page is
                // in place before any thread is allocated and never moves
                // while the process is in use.
                let trapframes = unsafe { self.data_mut() }
                    .trapframes
                    .as_mut()
                    .expect("alloc kthread: no trapframe page");
                data.trapframe = &mut trapframes.0[kt.id];

                // Set up a new context to start executing at fork_ret, which
                // returns to user space.
                data.context.zero();
                data.context.ra = fork_ret as *const () as usize;
                data.context.sp = (data.kstack + NKSTACK_PAGES * PGSIZE).as_usize();

                return Ok((kt, inner));
            }
        }

        Err(KernelError::OutOfKthread)
    }
}

/// Creates a new kernel thread in the calling process. The thread enters
/// user space at `start_fn` on the given user stack.
pub fn create(start_fn: VA, stack: VA, stack_size: usize) -> Result<Tid, KernelError> {
    let p = current_proc();

    let mut proc_inner = p.inner.lock();
    let (kt, mut inner) = try_log!(p.alloc_kthread(&mut proc_inner));

    // Safety: the thread is not yet runnable
    let trapframe = unsafe { kt.data_mut() }.trapframe_mut();
    trapframe.epc = start_fn.as_usize();
    trapframe.sp = (stack + stack_size).as_usize();

    inner.state = KthreadState::Runnable;

    Ok(inner.tid)
}

/// Returns the calling thread's id.
pub fn id() -> Tid {
    current_kthread().inner.lock().tid
}

/// Exits the calling kernel thread and does not return.
///
/// The last live thread of a process takes the whole process down with it,
/// exactly as if it had called `exit(status)`. Otherwise the thread remains
/// a zombie until a sibling joins it.
pub fn exit(status: isize) -> ! {
    let p = current_proc();
    let kt = current_kthread();

    let mut alive = 0;
    for t in &p.kthreads {
        let inner = t.inner.lock();
        if inner.state.is_live() {
            alive += 1;
        }
    }

    if alive == 1 {
        {
            let mut inner = kt.inner.lock();
            inner.xstate = status;
            inner.state = KthreadState::Zombie;
        }
        proc::exit(status);
    }

    // The process lock is the join monitor: joiners check-then-sleep under
    // it, so publishing the zombie state and waking them under the same lock
    // cannot lose a wakeup.
    let mut proc_inner = p.inner.lock();

    {
        let mut inner = kt.inner.lock();
        inner.xstate = status;
        inner.state = KthreadState::Zombie;
    }

    p.wakeup_threads(&mut proc_inner, Channel::Kthread(p.id, kt.id));

    // Keep our own lock across the switch; a joiner can only free this slot
    // once the scheduler releases it on the far side of swtch.
    let inner = kt.inner.lock();
    drop(proc_inner);

    // Safety: we are the current thread
    let context = unsafe { &mut kt.data_mut().context };
    sched(inner, context);

    unreachable!("zombie kthread exit");
}

/// Waits for the thread with the given tid to exit and reclaims its slot.
/// Copies the exit status to `addr` unless it is null.
pub fn join(tid: Tid, addr: VA) -> Result<(), KernelError> {
    let p = current_proc();
    let me = current_kthread();

    let mut proc_inner = p.inner.lock();

    // Locate the slot. Slot identity only changes under the process lock,
    // so the match stays the match while we wait.
    let mut found = None;
    for kt in &p.kthreads {
        let inner = kt.inner.lock();
        if inner.state != KthreadState::Unused && inner.tid == tid {
            found = Some(kt);
            break;
        }
    }

    let Some(kt) = found else {
        err!(KernelError::InvalidArgument);
    };

    // joining yourself would sleep on a channel only you could signal
    if ptr::eq(kt, me) {
        err!(KernelError::InvalidArgument);
    }

    loop {
        let inner = kt.inner.lock();

        match inner.state {
            KthreadState::Zombie => {
                if !addr.is_null() {
                    let bytes = inner.xstate.to_le_bytes();
                    try_log!(proc::either_copy_out(true, addr, &bytes));
                }

                kt.free(inner);
                return Ok(());
            }

            // reclaimed by an exiting sibling while we slept
            KthreadState::Unused => err!(KernelError::InvalidArgument),

            _ if inner.killed => {
                err!(KernelError::InvalidArgument);
            }

            _ => {
                drop(inner);
                proc_inner = proc::sleep(Channel::Kthread(p.id, kt.id), proc_inner);

                if me.is_killed() {
                    err!(KernelError::InvalidArgument);
                }
            }
        }
    }
}

/// Kills the thread with the given tid within the calling process.
///
/// The victim won't exit until it next tries to return to user space.
pub fn kill(tid: Tid) -> bool {
    let p = current_proc();
    let _proc_inner = p.inner.lock();

    for kt in &p.kthreads {
        let mut inner = kt.inner.lock();
        if inner.state != KthreadState::Unused && inner.tid == tid {
            inner.killed = true;

            if inner.state == KthreadState::Sleeping {
                // wake the thread from sleep() so it can observe the flag
                inner.state = KthreadState::Runnable;
            }

            return true;
        }
    }

    false
}

/// Takes down every other thread of `p` on behalf of `exit`: marks each live
/// sibling killed (waking sleepers), then joins each one as it reaches
/// Zombie through its own pass through the scheduler.
pub(crate) fn reap_siblings(p: &'static Proc, me: &Kthread) {
    for kt in &p.kthreads {
        if ptr::eq(kt, me) {
            continue;
        }

        let mut inner = kt.inner.lock();
        if inner.state.is_live() {
            inner.killed = true;
            if inner.state == KthreadState::Sleeping {
                inner.state = KthreadState::Runnable;
            }
        }
    }

    for kt in &p.kthreads {
        if ptr::eq(kt, me) {
            continue;
        }

        let mut proc_inner = p.inner.lock();
        loop {
            let inner = kt.inner.lock();
            match inner.state {
                KthreadState::Zombie => {
                    kt.free(inner);
                    break;
                }
                KthreadState::Unused => break,
                _ => {
                    drop(inner);
                    proc_inner = proc::sleep(Channel::Kthread(p.id, kt.id), proc_inner);
                }
            }
        }
    }
}
