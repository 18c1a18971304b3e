pub mod raw {
    use core::arch::asm;

    use kernel::abi::Syscall;

    #[inline(always)]
    fn syscall0(syscall: Syscall) -> usize {
        let ret: usize;
        unsafe {
            asm!(
                "ecall",
                in("a7") syscall as usize,
                lateout("a0") ret,
            );
        }
        ret
    }

    #[inline(always)]
    fn syscall1(syscall: Syscall, a0: usize) -> usize {
        let ret: usize;
        unsafe {
            asm!(
                "ecall",
                in("a7") syscall as usize,
                inlateout("a0") a0 => ret,
            );
        }
        ret
    }

    #[inline(always)]
    fn syscall2(syscall: Syscall, a0: usize, a1: usize) -> usize {
        let ret: usize;
        unsafe {
            asm!(
                "ecall",
                in("a7") syscall as usize,
                inlateout("a0") a0 => ret,
                in("a1") a1,
            );
        }
        ret
    }

    #[inline(always)]
    fn syscall3(syscall: Syscall, a0: usize, a1: usize, a2: usize) -> usize {
        let ret: usize;
        unsafe {
            asm!(
                "ecall",
                in("a7") syscall as usize,
                inlateout("a0") a0 => ret,
                in("a1") a1,
                in("a2") a2,
            );
        }
        ret
    }

    pub fn fork() -> usize {
        syscall0(Syscall::Fork)
    }

    pub fn exit(code: usize) -> ! {
        syscall1(Syscall::Exit, code);
        unreachable!();
    }

    pub fn wait(status: *mut isize) -> usize {
        syscall1(Syscall::Wait, status as usize)
    }

    pub fn kill(pid: usize) -> usize {
        syscall1(Syscall::Kill, pid)
    }

    pub fn exec(path: *const u8, argv: *const *const u8) -> usize {
        syscall2(Syscall::Exec, path as usize, argv as usize)
    }

    pub fn getpid() -> usize {
        syscall0(Syscall::Getpid)
    }

    pub fn sbrk(n: usize) -> usize {
        syscall1(Syscall::Sbrk, n)
    }

    pub fn sleep(ticks: usize) -> usize {
        syscall1(Syscall::Sleep, ticks)
    }

    pub fn uptime() -> usize {
        syscall0(Syscall::Uptime)
    }

    pub fn write(fd: usize, buf: *const u8, len: usize) -> usize {
        syscall3(Syscall::Write, fd, buf as usize, len)
    }

    pub fn kthread_create(start_fn: usize, stack: usize, stack_size: usize) -> usize {
        syscall3(Syscall::KthreadCreate, start_fn, stack, stack_size)
    }

    pub fn kthread_id() -> usize {
        syscall0(Syscall::KthreadId)
    }

    pub fn kthread_exit(status: usize) -> ! {
        syscall1(Syscall::KthreadExit, status);
        unreachable!();
    }

    pub fn kthread_join(tid: usize, status: *mut isize) -> usize {
        syscall2(Syscall::KthreadJoin, tid, status as usize)
    }

    pub fn kthread_kill(tid: usize) -> usize {
        syscall1(Syscall::KthreadKill, tid)
    }
}

use core::ptr;

use kernel::abi::{MAXARG, MAXPATH, SysError};

/// Decodes the kernel's return register: negative values carry an error
/// code.
fn decode(ret: usize) -> Result<usize, SysError> {
    let value = ret as isize;
    if value < 0 {
        Err(SysError::from_code((-value) as u16))
    } else {
        Ok(ret)
    }
}

/// Creates a child process; returns its pid in the parent and 0 in the
/// child.
pub fn fork() -> Result<usize, SysError> {
    decode(raw::fork())
}

/// Exits the current process with the given status. Does not return.
pub fn exit(status: isize) -> ! {
    raw::exit(status as usize)
}

/// Waits for a child to exit; returns its pid and, optionally, its exit
/// status.
pub fn wait(status: Option<&mut isize>) -> Result<usize, SysError> {
    let addr = status.map_or(ptr::null_mut(), |status| status as *mut isize);
    decode(raw::wait(addr))
}

/// Kills the process with the given pid.
pub fn kill(pid: usize) -> Result<(), SysError> {
    decode(raw::kill(pid)).map(|_| ())
}

/// Replaces this process's image with the named program.
/// Only returns on failure.
pub fn exec(path: &str, argv: &[&str]) -> Result<usize, SysError> {
    // the kernel expects nul-terminated strings; stage them in fixed
    // buffers on our stack
    const ARG_LEN: usize = 64;

    if path.len() >= MAXPATH || argv.len() > MAXARG {
        return Err(SysError::InvalidArgument);
    }

    let mut path_buf = [0u8; MAXPATH];
    path_buf[..path.len()].copy_from_slice(path.as_bytes());

    let mut arg_bufs = [[0u8; ARG_LEN]; MAXARG];
    let mut arg_ptrs = [ptr::null::<u8>(); MAXARG + 1];

    for (i, arg) in argv.iter().enumerate() {
        if arg.len() >= ARG_LEN {
            return Err(SysError::InvalidArgument);
        }
        arg_bufs[i][..arg.len()].copy_from_slice(arg.as_bytes());
        arg_ptrs[i] = arg_bufs[i].as_ptr();
    }

    decode(raw::exec(path_buf.as_ptr(), arg_ptrs.as_ptr()))
}

/// Returns the current process id.
pub fn getpid() -> usize {
    raw::getpid()
}

/// Grows (or shrinks) the process's memory by `n` bytes; returns the old
/// break.
pub fn sbrk(n: isize) -> Result<usize, SysError> {
    decode(raw::sbrk(n as usize))
}

/// Sleeps for the given number of clock ticks.
pub fn sleep(ticks: usize) -> Result<(), SysError> {
    decode(raw::sleep(ticks)).map(|_| ())
}

/// Returns the number of clock ticks since boot.
pub fn uptime() -> usize {
    raw::uptime()
}

/// Writes the buffer to a file descriptor; returns how much was written.
pub fn write(fd: usize, buf: &[u8]) -> usize {
    match decode(raw::write(fd, buf.as_ptr(), buf.len())) {
        Ok(len) => len,
        Err(_) => 0,
    }
}

/// Creates a kernel thread entering `start_fn` on the given stack; returns
/// its tid.
pub fn kthread_create(start_fn: extern "C" fn() -> !, stack: &mut [u8]) -> Result<usize, SysError> {
    decode(raw::kthread_create(
        start_fn as usize,
        stack.as_mut_ptr() as usize,
        stack.len(),
    ))
}

/// Returns the calling thread's id.
pub fn kthread_id() -> usize {
    raw::kthread_id()
}

/// Exits the calling thread with the given status. Does not return.
pub fn kthread_exit(status: isize) -> ! {
    raw::kthread_exit(status as usize)
}

/// Waits for the thread with the given tid to exit; optionally receives its
/// exit status.
pub fn kthread_join(tid: usize, status: Option<&mut isize>) -> Result<(), SysError> {
    let addr = status.map_or(ptr::null_mut(), |status| status as *mut isize);
    decode(raw::kthread_join(tid, addr)).map(|_| ())
}

/// Kills the thread with the given tid within this process.
pub fn kthread_kill(tid: usize) -> Result<(), SysError> {
    decode(raw::kthread_kill(tid)).map(|_| ())
}
