use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, transmute};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::string::String;

use crate::error::KernelError;
use crate::file::File;
use crate::fs::{self, Inode, Path};
use crate::kthread::{Kthread, KthreadInner, KthreadState, TrapFrames};
use crate::log::Operation;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, kstack, kstack_index};
use crate::param::{NCPU, NKSTACK_PAGES, NKT, NOFILE, NPROC, ROOTDEV};
use crate::riscv::{PGSIZE, PTE_R, PTE_W, PTE_X, interrupts, registers::tp};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::swtch::swtch;
use crate::sync::OnceLock;
use crate::trampoline::trampoline;
use crate::trap::usertrapret;
use crate::vm::{Kvm, PA, Page, Uvm, VA};

pub static CPU_TABLE: CpuTable = CpuTable::new();
pub static PROC_TABLE: ProcTable = ProcTable::new();
pub static INIT_PROC: OnceLock<&Proc> = OnceLock::new();

/// Per-CPU state
pub struct Cpu {
    /// The kernel thread running on this CPU, or None.
    pub thread: Option<&'static Kthread>,
    /// swtch() here to enter scheduler().
    pub context: Context,
    /// Depth of interrupt-disable nesting.
    pub num_off: isize,
    /// Were interrupts enabled before the outermost disable?
    pub interrupts_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            thread: None,
            context: Context::new(),
            num_off: 0,
            interrupts_enabled: false,
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupts_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock
    }

    /// Unlocks this CPU by enabling interrupts if appropriate.
    pub fn unlock(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupts_enabled {
            interrupts::enable();
        }
    }
}

/// Table of CPUs
pub struct CpuTable([UnsafeCell<Cpu>; NCPU]);

unsafe impl Sync for CpuTable {}

impl CpuTable {
    const fn new() -> Self {
        Self([const { UnsafeCell::new(Cpu::new()) }; NCPU])
    }

    /// Returns the hart id of the current CPU.
    ///
    /// # Safety
    /// Must be called with interrupts disabled, to prevent a race with the
    /// thread being moved to a different CPU.
    #[inline]
    pub unsafe fn current_id(&self) -> usize {
        unsafe { tp::read() }
    }

    /// Returns a mutable reference to the current CPU's [`Cpu`] struct.
    ///
    /// # Safety
    /// Must be called with interrupts disabled, to prevent a race with the
    /// thread being moved to a different CPU.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn current(&self) -> &mut Cpu {
        unsafe {
            assert!(!interrupts::get(), "mycpu interrupts enabled");
            let id = self.current_id();
            &mut *self.0[id].get()
        }
    }

    /// Locks the current CPU by disabling interrupts.
    /// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
    pub fn lock_current(&self) -> InterruptLock {
        let old_state = interrupts::get();
        interrupts::disable();

        unsafe { self.current().lock(old_state) }
    }
}

/// A lock that releases one level of the CPU's interrupt-disable nesting
/// when dropped.
#[derive(Debug)]
pub struct InterruptLock;

impl Drop for InterruptLock {
    fn drop(&mut self) {
        // Safety: we are still holding the CPU lock
        unsafe { CPU_TABLE.current().unlock() }
    }
}

/// Returns a reference to the kernel thread running on this CPU.
pub fn current_kthread_opt() -> Option<&'static Kthread> {
    let _lock = CPU_TABLE.lock_current();

    let cpu = unsafe { CPU_TABLE.current() };
    cpu.thread
}

/// Returns a reference to the kernel thread running on this CPU.
/// Panics if called from the scheduler context.
pub fn current_kthread() -> &'static Kthread {
    current_kthread_opt().expect("no current kthread")
}

/// Returns a reference to this CPU's current process.
pub fn current_proc_opt() -> Option<&'static Proc> {
    current_kthread_opt().map(|kt| kt.proc())
}

/// Returns a reference to this CPU's current process.
/// Panics if called from the scheduler context.
pub fn current_proc() -> &'static Proc {
    current_proc_opt().expect("no current process")
}

/// Returns a shared reference to this CPU's current process and an exclusive
/// reference to its underlying [`ProcData`].
pub fn current_proc_and_data_mut() -> (&'static Proc, &'static mut ProcData) {
    let proc = current_proc();
    // Safety: we are a thread of the current process
    let data = unsafe { proc.data_mut() };
    (proc, data)
}

/// Saved registers for kernel context switches.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    pub fn zero(&mut self) {
        *self = Self::new();
    }
}

/// Wrapper around usize to represent process IDs.
/// It must be created using `Pid::alloc()` to ensure uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

/// Dedicated leaf lock for pid issuance; nothing else is acquired under it.
static NEXT_PID: SpinLock<usize> = SpinLock::new(1, "nextpid");

impl Pid {
    /// Allocates a new PID by incrementing the global counter.
    pub fn alloc() -> Self {
        let mut next = NEXT_PID.lock();
        let pid = Pid(*next);
        *next += 1;
        pid
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// for looking up a pid that arrived from user space
impl From<usize> for Pid {
    fn from(value: usize) -> Self {
        Pid(value)
    }
}

/// Channel type for `sleep`/`wakeup`. A rendezvous identifier; equality is
/// the only operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// A process slot; its threads in `wait()`, woken by exiting children.
    Proc(usize),
    /// A thread slot `(proc id, thread id)`; joiners, woken by the exiting
    /// thread.
    Kthread(usize, usize),
    /// System ticks
    Ticks,
    /// Filesystem operation log
    Log,
}

/// The state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Zombie,
}

/// Public fields of a process.
///
/// The process lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct ProcInner {
    /// Process state
    pub state: ProcState,
    /// If true, has been killed
    pub killed: bool,
    /// Exit status to be returned to parent's wait
    pub xstate: isize,
    /// Process ID
    pub pid: Pid,
    /// Next thread id to assign within this process
    pub next_tid: usize,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            killed: false,
            xstate: 0,
            pid: Pid(0),
            next_tid: 0,
        }
    }
}

/// Private fields of a process.
#[derive(Debug, Default)]
pub struct ProcData {
    /// Size of process memory (bytes)
    pub size: usize,
    /// User page table
    pub pagetable: Option<Uvm>,
    /// One page of trapframe slots, one per kernel thread
    pub trapframes: Option<Box<TrapFrames>>,
    /// Open files
    pub open_files: [Option<File>; NOFILE],
    /// Current directory
    pub cwd: Option<Inode>,
    /// Process name (debugging)
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            size: 0,
            pagetable: None,
            trapframes: None,
            open_files: [const { None }; NOFILE],
            cwd: None,
            name: String::new(),
        }
    }

    /// Returns a reference to the user page table.
    pub fn pagetable(&self) -> &Uvm {
        self.pagetable.as_ref().unwrap()
    }

    /// Returns a mutable reference to the user page table.
    pub fn pagetable_mut(&mut self) -> &mut Uvm {
        self.pagetable.as_mut().unwrap()
    }
}

unsafe impl Sync for ProcData {}
unsafe impl Send for ProcData {}

/// Process control block
#[derive(Debug)]
pub struct Proc {
    /// NOT `Pid`. Used for indexing into `PROC_TABLE` and for parent-child
    /// relationships.
    pub id: usize,
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
    /// This process's kernel threads, inline.
    pub kthreads: [Kthread; NKT],
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn new(id: usize) -> Self {
        let kthreads = {
            let mut array: [MaybeUninit<Kthread>; NKT] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NKT {
                array[i] = MaybeUninit::new(Kthread::new(id, i));
                i += 1;
            }

            unsafe { transmute::<[MaybeUninit<Kthread>; NKT], [Kthread; NKT]>(array) }
        };

        Self {
            id,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
            kthreads,
        }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// Returns a mutable reference to the process's data.
    ///
    /// # Safety
    /// The caller must ensure they have exclusive access to the `Proc`. This
    /// is true if either
    ///     1. it's the current process (most cases) or
    ///     2. none of the process's threads are runnable yet (fork, alloc).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// Reads the process state without taking the lock.
    ///
    /// # Safety
    /// The value may be stale the moment it is read. Only the scheduler and
    /// the debug dump use this; both tolerate staleness.
    pub unsafe fn state_lockless(&self) -> ProcState {
        unsafe { self.inner.get_mut_unchecked().state }
    }

    /// Returns true if this process is the init process.
    pub fn is_init(&self) -> bool {
        INIT_PROC.get().is_some_and(|init| ptr::eq(self, *init))
    }

    /// Returns true if this process has been killed.
    ///
    /// Acquires and releases the process lock.
    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }

    /// Marks this process and every live thread killed, waking sleeping
    /// threads so they can observe the flag on their next trap return.
    pub fn set_killed(&self) {
        let mut inner = self.inner.lock();
        self.kill_threads(&mut inner);
    }

    /// The flag-and-wake half of a kill, with the process guard held.
    fn kill_threads(&self, inner: &mut SpinLockGuard<'_, ProcInner>) {
        inner.killed = true;

        for kt in &self.kthreads {
            let mut kt_inner = kt.inner.lock();
            if kt_inner.state.is_live() {
                kt_inner.killed = true;

                if kt_inner.state == KthreadState::Sleeping {
                    // wake the thread from sleep()
                    kt_inner.state = KthreadState::Runnable;
                }
            }
        }
    }

    /// Create a user page table for this process, with no user memory, but
    /// with trampoline and trapframe pages.
    pub fn create_pagetable(&self) -> Result<Uvm, KernelError> {
        let mut uvm = try_log!(Uvm::try_new());

        // Map the trampoline code (for system call returns) at the highest
        // user virtual address. Only the supervisor uses it, on the way
        // to/from user space, so not PTE_U.
        if let Err(err) = log!(uvm.map_pages(
            VA::new(TRAMPOLINE),
            PA::new(trampoline as *const () as usize),
            PGSIZE,
            PTE_R | PTE_X,
        )) {
            uvm.free(0);
            return Err(err.into());
        }

        // Map the page of trapframe slots just below the trampoline page,
        // for trampoline.rs.
        let data = self.data();
        let trapframes = data.trapframes.as_ref().expect("pagetable: no trapframes");
        if let Err(err) = log!(uvm.map_pages(
            VA::new(TRAPFRAME),
            PA::new(trapframes.as_ref() as *const TrapFrames as usize),
            PGSIZE,
            PTE_R | PTE_W,
        )) {
            uvm.unmap(VA::new(TRAMPOLINE), 1, false);
            uvm.free(0);
            return Err(err.into());
        }

        Ok(uvm)
    }

    /// Free the process and the data hanging from it (including user pages),
    /// and every one of its thread slots regardless of state.
    ///
    /// The caller holds the process guard and no thread guard.
    pub fn free(&self, mut inner: SpinLockGuard<'_, ProcInner>) {
        // Safety: we are the only ones with access to this proc
        let data = unsafe { self.data_mut() };

        if let Some(trapframes) = data.trapframes.take() {
            drop(trapframes);
        }

        if let Some(uvm) = data.pagetable.take() {
            uvm.proc_free(data.size);
        }

        data.size = 0;
        data.name.clear();
        inner.pid = Pid(0);
        inner.killed = false;
        inner.xstate = 0;
        inner.next_tid = 0;
        inner.state = ProcState::Unused;

        for kt in &self.kthreads {
            let kt_inner = kt.inner.lock();
            kt.free(kt_inner);
        }
    }

    /// Makes every thread of this process sleeping on `channel` runnable,
    /// skipping the calling thread. The process guard proves the lock order.
    pub fn wakeup_threads(
        &self,
        _inner: &mut SpinLockGuard<'_, ProcInner>,
        channel: Channel,
    ) {
        let me = current_kthread_opt();

        for kt in &self.kthreads {
            if me.is_some_and(|m| ptr::eq(m, kt)) {
                continue;
            }

            let mut kt_inner = kt.inner.lock();
            if kt_inner.state == KthreadState::Sleeping && kt_inner.channel == Some(channel) {
                kt_inner.state = KthreadState::Runnable;
            }
        }
    }
}

/// Table of processes
pub struct ProcTable {
    table: [UnsafeCell<Proc>; NPROC],
    // Instead of a parent field on each process slot, all parent links live
    // in one array behind a single lock (xv6's wait_lock): it is acquired
    // before any process lock and makes reparenting atomic with respect to
    // exiting parents.
    pub parents: SpinLock<[Option<usize>; NPROC]>,
}

unsafe impl Sync for ProcTable {}

impl ProcTable {
    const fn new() -> Self {
        let table = {
            let mut array: [MaybeUninit<UnsafeCell<Proc>>; NPROC] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NPROC {
                array[i] = MaybeUninit::new(UnsafeCell::new(Proc::new(i)));
                i += 1;
            }

            unsafe {
                transmute::<[MaybeUninit<UnsafeCell<Proc>>; NPROC], [UnsafeCell<Proc>; NPROC]>(
                    array,
                )
            }
        };

        Self {
            table,
            parents: SpinLock::new([None; NPROC], "parents"),
        }
    }

    /// Returns a reference to the process at the given index.
    pub fn get(&self, index: usize) -> &'static Proc {
        // the table is static; the raw deref unties the borrow from &self
        unsafe { &*self.table[index].get() }
    }

    /// Returns an iterator over all processes.
    pub fn iter(&self) -> impl Iterator<Item = &'static Proc> {
        (0..NPROC).map(|i| self.get(i))
    }

    /// Allocates the kernel stacks and maps them into the kernel page table,
    /// one per (process, thread) slot, each followed by an unmapped guard
    /// page.
    ///
    /// # Safety
    /// Called once, while building the kernel page table.
    pub unsafe fn map_stacks(&self, kvm: &mut Kvm) {
        for p in 0..NPROC {
            for kt in 0..NKT {
                let base = VA::new(kstack(kstack_index(p, kt)));

                for page in 0..NKSTACK_PAGES {
                    let pa = Page::try_new_zeroed().expect("map_stacks: out of memory");
                    let pa = Box::into_raw(pa);
                    kvm.map(
                        base + page * PGSIZE,
                        PA::new(pa as usize),
                        PGSIZE,
                        PTE_R | PTE_W,
                    );
                }
            }
        }
    }

    /// Searches the process table for an Unused slot. If found, initializes
    /// the state required to run in the kernel — pid, the trapframe page,
    /// the user page table, and thread 0 — and returns the process with both
    /// the process guard and thread 0's guard held.
    pub fn alloc(
        &self,
    ) -> Result<
        (
            &'static Proc,
            SpinLockGuard<'static, ProcInner>,
            SpinLockGuard<'static, KthreadInner>,
        ),
        KernelError,
    > {
        for proc in self.iter() {
            let mut inner = proc.inner.lock();
            if inner.state == ProcState::Unused {
                inner.pid = Pid::alloc();
                inner.state = ProcState::Used;
                inner.next_tid = 1;

                // Safety: no thread of this proc is runnable yet
                let data = unsafe { proc.data_mut() };

                // Allocate the page of trapframe slots.
                match log!(TrapFrames::try_new_zeroed()) {
                    Ok(trapframes) => {
                        data.trapframes.replace(trapframes);
                    }
                    Err(err) => {
                        proc.free(inner);
                        return Err(err);
                    }
                }

                // Allocate an empty user page table.
                match log!(proc.create_pagetable()) {
                    Ok(uvm) => {
                        data.pagetable.replace(uvm);
                    }
                    Err(err) => {
                        proc.free(inner);
                        return Err(err);
                    }
                }

                // Thread 0 carries the first trip into user space.
                match log!(proc.alloc_kthread(&mut inner)) {
                    Ok((_kt, kt_inner)) => return Ok((proc, inner, kt_inner)),
                    Err(err) => {
                        proc.free(inner);
                        return Err(err);
                    }
                }
            }
        }

        Err(KernelError::OutOfProc)
    }

    /// Prints a process listing to the console, one line per process with
    /// the states of its threads.
    /// For debugging only; takes no locks to avoid wedging a stuck machine
    /// further.
    pub unsafe fn dump(&self) {
        println!();

        for proc in self.iter() {
            let inner = unsafe { proc.inner.get_mut_unchecked() };
            if inner.state == ProcState::Unused {
                continue;
            }

            print!("{} {:?} {}", *inner.pid, inner.state, proc.data().name);

            for kt in &proc.kthreads {
                let kt_inner = unsafe { kt.inner.get_mut_unchecked() };
                if kt_inner.state == KthreadState::Unused {
                    continue;
                }
                print!(" [{} {:?}]", *kt_inner.tid, kt_inner.state);
            }

            println!();
        }
    }
}

// a user program that calls exec("/init")
// assembled from user/initcode.S
// od -t xC initcode
static INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35,
    0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00,
    0x00, 0x00, 0xEF, 0xF0, 0x9F, 0xFF, 0x2F, 0x69, 0x6E, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Sets up the first user process.
pub fn user_init() {
    let (proc, _inner, mut kt_inner) = PROC_TABLE.alloc().expect("user init");
    INIT_PROC
        .initialize(|| Ok::<_, ()>(proc))
        .expect("init proc once");

    // Safety: during initialization we are the only ones with access
    let data = unsafe { proc.data_mut() };

    // allocate one user page and copy initcode's instructions and data into it
    data.pagetable_mut().first(&INITCODE).expect("user init: first page");
    data.size = PGSIZE;

    data.name.push_str("initcode");
    data.cwd = Some(Path::new("/").resolve().expect("root path to exist"));

    // the console backs file descriptors 0-2, inherited by every descendant
    if let Ok(mut console) = File::alloc_console() {
        data.open_files[1] = Some(console.dup());
        data.open_files[2] = Some(console.dup());
        data.open_files[0] = Some(console);
    }

    // prepare for the very first "return" from kernel to user
    let trapframe = unsafe { proc.kthreads[0].data_mut() }.trapframe_mut();
    trapframe.epc = 0; // user program counter
    trapframe.sp = PGSIZE; // user stack pointer

    kt_inner.state = KthreadState::Runnable;

    // both guards drop here
}

/// Grows or shrinks user memory by `n` bytes.
/// The new size is reflected in the process data and returned.
pub fn grow(n: isize) -> Result<usize, KernelError> {
    let (_proc, data) = current_proc_and_data_mut();

    let mut size = data.size;

    if n > 0 {
        size = try_log!(data.pagetable_mut().alloc(size, size + n as usize, PTE_W));
    } else if n < 0 {
        let shrink = (-n) as usize;
        if shrink > size {
            err!(KernelError::InvalidArgument);
        }

        size = data.pagetable_mut().dealloc(size, size - shrink);
    }

    data.size = size;
    Ok(size)
}

/// Creates a new process, copying the parent.
/// Sets up the child's thread 0 to return as if from the `fork()` system
/// call.
pub fn fork() -> Result<Pid, KernelError> {
    let p = current_proc();
    let kt = current_kthread();
    // Safety: we are a thread of the current process
    let data = unsafe { p.data_mut() };

    // allocate a process; holds the child's lock and its thread 0's lock
    let (np, mut np_inner, np_kt_inner) = try_log!(PROC_TABLE.alloc());
    // Safety: the child has no runnable threads yet
    let np_data = unsafe { np.data_mut() };

    // copy user memory from parent to child
    let size = data.size;
    if let Err(err) = log!(data.pagetable_mut().copy(np_data.pagetable_mut(), size)) {
        drop(np_kt_inner);
        np.free(np_inner);
        return Err(err.into());
    }
    np_data.size = size;
    np_inner.state = ProcState::Used;

    // copy the calling thread's saved user registers into the child's
    // thread 0; a0 holds the return value, 0 in the child
    let np_trapframe = unsafe { np.kthreads[0].data_mut() }.trapframe_mut();
    *np_trapframe = *kt.data().trapframe();
    np_trapframe.a0 = 0;

    // increment reference counts on open file descriptors
    for (i, file) in data.open_files.iter_mut().enumerate() {
        if let Some(file) = file.as_mut() {
            np_data.open_files[i] = Some(file.dup());
        }
    }
    np_data.cwd = data.cwd.as_ref().map(|cwd| cwd.dup());

    np_data.name = data.name.clone();

    let pid = np_inner.pid;

    // drop the child's locks before taking the parents lock
    drop(np_kt_inner);
    drop(np_inner);

    {
        let mut parents = PROC_TABLE.parents.lock();
        parents[np.id] = Some(p.id);
    }

    // re-acquire in order and let the child run
    let np_inner = np.inner.lock();
    let mut np_kt_inner = np.kthreads[0].inner.lock();
    np_kt_inner.state = KthreadState::Runnable;
    drop(np_kt_inner);
    drop(np_inner);

    Ok(pid)
}

/// Passes `original`'s abandoned children to init.
/// The caller holds the parents lock.
pub fn reparent(original: &Proc, parents: &mut SpinLockGuard<'_, [Option<usize>; NPROC]>) {
    let init = INIT_PROC.get().expect("reparent before init");

    for parent in parents.iter_mut() {
        if *parent == Some(original.id) {
            *parent = Some(init.id);
            wakeup(Channel::Proc(init.id));
        }
    }
}

/// Exits the current process and does not return.
///
/// Every other kernel thread of the process is taken down first; the
/// process then remains a zombie until its parent calls `wait`.
pub fn exit(status: isize) -> ! {
    let p = current_proc();
    let kt = current_kthread();

    assert!(!p.is_init(), "init exiting");

    // Safety: we are a thread of the current process
    let data = unsafe { p.data_mut() };

    // close all open files
    for file in &mut data.open_files {
        if let Some(mut file) = file.take() {
            file.close();
        }
    }

    {
        let _op = Operation::begin();
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }
    }

    // cancel and reap every other thread; each reaches Zombie through its
    // own pass through the scheduler
    crate::kthread::reap_siblings(p, kt);

    let mut parents = PROC_TABLE.parents.lock();

    // give any children to init
    reparent(p, &mut parents);

    // the parent might be sleeping in wait()
    let parent_id = parents[p.id].expect("exit: no parent");
    wakeup(Channel::Proc(parent_id));

    {
        let mut inner = p.inner.lock();
        inner.xstate = status;
        inner.state = ProcState::Zombie;
    }

    let mut kt_inner = kt.inner.lock();
    kt_inner.xstate = status;
    kt_inner.state = KthreadState::Zombie;

    // unlock the parents table; only our own thread lock crosses the switch
    drop(parents);

    // Safety: we are the current thread
    let context = unsafe { &mut kt.data_mut().context };
    sched(kt_inner, context);

    unreachable!("zombie exit");
}

/// Waits for a child process to exit and returns its pid, or None if there
/// are no children.
pub fn wait(addr: VA) -> Option<Pid> {
    let p = current_proc();
    let kt = current_kthread();

    // analogous to xv6's wait_lock
    let mut parents = PROC_TABLE.parents.lock();

    loop {
        let mut have_kids = false;

        // Scan the table looking for exited children.
        for pp in PROC_TABLE.iter() {
            if parents[pp.id] == Some(p.id) {
                // make sure the child isn't still in exit() or swtch()
                let inner = pp.inner.lock();

                have_kids = true;

                if inner.state == ProcState::Zombie {
                    let pid = inner.pid;

                    if !addr.is_null() {
                        let bytes = inner.xstate.to_le_bytes();
                        if log!(either_copy_out(true, addr, &bytes)).is_err() {
                            return None;
                        }
                    }

                    // clear the parent relationship
                    parents[pp.id] = None;

                    pp.free(inner);

                    return Some(pid);
                }
            }
        }

        // No point waiting if we don't have any children, or if we have been
        // cancelled in the meantime.
        if !have_kids || p.is_killed() || kt.is_killed() {
            return None;
        }

        // Wait for a child to exit.
        parents = sleep(Channel::Proc(p.id), parents);
    }
}

/// Per-CPU scheduler.
/// Each CPU calls `scheduler` after setting itself up.
/// Scheduler never returns. It loops, doing:
///     - choose a runnable kernel thread of a live process,
///     - swtch to start running it,
///     - eventually that thread transfers control back via swtch.
///
/// # Safety
/// Must be called with interrupts disabled, once per CPU.
pub unsafe fn scheduler() -> ! {
    // the cpu does not change for the lifetime of the scheduler
    let cpu = unsafe { CPU_TABLE.current() };

    cpu.thread.take();

    loop {
        // The most recent thread to run may have had interrupts turned off;
        // enable them to avoid a deadlock if every thread is waiting. Then
        // turn them off again to avoid a race between an interrupt and wfi.
        interrupts::enable();
        interrupts::disable();

        let mut found = false;

        for proc in PROC_TABLE.iter() {
            // Racy read, re-checked under the thread lock below. The order
            // forbids taking the process lock while a thread lock is held,
            // so the scheduler never takes the process lock at all.
            if unsafe { proc.state_lockless() } != ProcState::Used {
                continue;
            }

            for kt in &proc.kthreads {
                let mut inner = kt.inner.lock();

                if inner.state == KthreadState::Runnable
                    && unsafe { proc.state_lockless() } == ProcState::Used
                {
                    // Switch to the chosen thread. It is the thread's job to
                    // release its lock and then reacquire it before jumping
                    // back to us.
                    inner.state = KthreadState::Running;
                    cpu.thread.replace(kt);
                    unsafe { swtch(&mut cpu.context, &kt.data().context) };

                    // The thread is done running for now. It should have
                    // changed its state before coming back.
                    cpu.thread.take();
                    found = true;
                }
            }
        }

        if !found {
            // nothing to run; stop running on this core until an interrupt
            unsafe { asm!("wfi") };
        }
    }
}

/// Switch to the scheduler.
///
/// The caller must hold exactly its own thread lock (and nothing else) and
/// must have already changed the thread state away from Running.
///
/// Saves and restores `interrupts_enabled` because it is a property of this
/// kernel thread, not this CPU.
pub fn sched<'a>(
    inner: SpinLockGuard<'a, KthreadInner>,
    context: &mut Context,
) -> SpinLockGuard<'a, KthreadInner> {
    let cpu = unsafe { CPU_TABLE.current() };

    // exactly one lock held, so exactly one level of interrupt nesting
    assert_eq!(cpu.num_off, 1, "sched locks");
    // the thread must have left the Running state before switching away
    assert_ne!(inner.state, KthreadState::Running, "sched running");
    // verify the software check against the hardware
    assert!(!interrupts::get(), "sched interruptible");

    let interrupts_enabled = cpu.interrupts_enabled;
    unsafe { swtch(context, &cpu.context) };

    // reload the cpu; the thread may have been moved to a different one
    let cpu = unsafe { CPU_TABLE.current() };
    cpu.interrupts_enabled = interrupts_enabled;

    inner
}

/// Gives up the CPU for one scheduling round.
pub fn r#yield() {
    let kt = current_kthread();

    // the thread lock is held until after the trip through sched
    let mut inner = kt.inner.lock();
    inner.state = KthreadState::Runnable;

    // Safety: we are the current thread
    let context = unsafe { &mut kt.data_mut().context };
    sched(inner, context);
}

/// Entry point of every freshly scheduled kernel thread.
///
/// # Safety
/// Not called directly; it is the saved return address in a fresh context.
pub unsafe extern "C" fn fork_ret() {
    // This is atomic since multiple CPUs could schedule their first thread
    // simultaneously.
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding our thread lock from the scheduler.
    unsafe { current_kthread().inner.force_unlock() };

    if FIRST
        .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        // Filesystem initialization must run in the context of a regular
        // process (it may sleep), and thus cannot run from main().
        fs::init(ROOTDEV);
    }

    // return to user space, mimicking usertrap()'s return
    unsafe { usertrapret() };
}

/// Atomically releases a condition's lock and sleeps on a channel.
/// Reacquires the condition's lock when awakened.
pub fn sleep<T>(channel: Channel, condition_lock: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    // To make sure no wakeup is missed, acquire our thread lock before
    // releasing the condition lock: wakeup() must take the thread lock to
    // change our state, and it cannot do so until we are fully asleep.
    let condition_mutex;
    {
        let kt = current_kthread();
        let mut inner = kt.inner.lock();

        condition_mutex = SpinLock::unlock(condition_lock);

        // go to sleep
        inner.channel = Some(channel);
        inner.state = KthreadState::Sleeping;

        // Safety: we are the current thread
        let context = unsafe { &mut kt.data_mut().context };
        inner = sched(inner, context);
        // execution resumes here once some waker made us runnable again

        inner.channel = None;
    } // thread lock drops here

    // reacquire the original lock
    condition_mutex.lock()
}

/// Wakes up every kernel thread sleeping on `channel`.
/// Must be called without any process or thread lock of the caller held.
pub fn wakeup(channel: Channel) {
    // Do not unwrap the current thread here; there is none when this is
    // called from the scheduler's context (e.g. the timer path).
    let me = current_kthread_opt();

    for proc in PROC_TABLE.iter() {
        let _inner = proc.inner.lock();

        for kt in &proc.kthreads {
            // skip our own thread to avoid a self-deadlock
            if me.is_some_and(|m| ptr::eq(m, kt)) {
                continue;
            }

            let mut kt_inner = kt.inner.lock();
            if kt_inner.state == KthreadState::Sleeping && kt_inner.channel == Some(channel) {
                kt_inner.state = KthreadState::Runnable;
            }
        }
    }
}

/// Kills the process with the given pid: the process and every live thread
/// are flagged, and sleeping threads are made runnable so they can observe
/// the flag.
///
/// A victim thread won't exit until it tries to return to user space (see
/// `usertrap()` in trap.rs).
pub fn kill(pid: Pid) -> bool {
    for proc in PROC_TABLE.iter() {
        let mut inner = proc.inner.lock();
        if inner.state != ProcState::Unused && inner.pid == pid {
            proc.kill_threads(&mut inner);
            return true;
        }
    }

    false
}

/// Copies to either a user address in the current process's page table, or
/// a kernel address.
pub fn either_copy_out(user_dst: bool, dst: VA, src: &[u8]) -> Result<(), KernelError> {
    if user_dst {
        let (_proc, data) = current_proc_and_data_mut();
        log!(data.pagetable_mut().copy_out(dst, src)).map_err(|e| e.into())
    } else {
        unsafe {
            core::ptr::copy(src.as_ptr(), dst.as_usize() as *mut u8, src.len());
        }
        Ok(())
    }
}

/// Copies from either a user address in the current process's page table, or
/// a kernel address.
pub fn either_copy_in(dst: &mut [u8], user_src: bool, src: VA) -> Result<(), KernelError> {
    if user_src {
        let (_proc, data) = current_proc_and_data_mut();
        log!(data.pagetable_mut().copy_in(dst, src)).map_err(|e| e.into())
    } else {
        unsafe {
            core::ptr::copy(src.as_usize() as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

/// Initializes the process table: gives every thread slot its fixed kernel
/// stack address.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    for proc in PROC_TABLE.iter() {
        for kt in &proc.kthreads {
            // Safety: boot-time, single-threaded
            unsafe { kt.data_mut() }.kstack = VA::new(kstack(kstack_index(proc.id, kt.id)));
        }
    }

    println!("proc init");
}
