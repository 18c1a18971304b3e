use crate::kthread::{self, Tid};
use crate::proc::{self, Channel, Pid, current_kthread, current_proc};
use crate::syscall::{SysError, SyscallArgs};
use crate::trap::TICKS;

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let status = args.get_int(0);
    proc::exit(status);
}

pub fn sys_getpid(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.proc().inner.lock().pid;
    Ok(*pid)
}

pub fn sys_fork(_args: &SyscallArgs) -> Result<usize, SysError> {
    match log!(proc::fork()) {
        Ok(pid) => Ok(*pid),
        Err(err) => Err(err.into()),
    }
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, SysError> {
    let addr = args.get_addr(0);
    match proc::wait(addr) {
        Some(pid) => Ok(*pid),
        None => Err(SysError::NoChildren),
    }
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, SysError> {
    let n = args.get_int(0);
    let addr = args.proc().data().size;

    match log!(proc::grow(n)) {
        Ok(_) => Ok(addr),
        Err(err) => Err(err.into()),
    }
}

pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, SysError> {
    let duration = args.get_int(0).max(0) as usize;

    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;

    while *ticks - ticks0 < duration {
        if current_proc().is_killed() || current_kthread().is_killed() {
            return Err(SysError::Interrupted);
        }

        ticks = proc::sleep(Channel::Ticks, ticks);
    }

    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_int(0);
    if pid < 0 {
        err!(SysError::InvalidArgument);
    }

    if proc::kill(Pid::from(pid as usize)) {
        Ok(0)
    } else {
        Err(SysError::NoProcess)
    }
}

pub fn sys_uptime(_args: &SyscallArgs) -> Result<usize, SysError> {
    let ticks = *TICKS.lock();
    Ok(ticks)
}

pub fn sys_kthread_create(args: &SyscallArgs) -> Result<usize, SysError> {
    let start_fn = args.get_addr(0);
    let stack = args.get_addr(1);
    let stack_size = args.get_raw(2);

    match log!(kthread::create(start_fn, stack, stack_size)) {
        Ok(tid) => Ok(*tid),
        Err(err) => Err(err.into()),
    }
}

pub fn sys_kthread_id(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(*kthread::id())
}

pub fn sys_kthread_exit(args: &SyscallArgs) -> ! {
    let status = args.get_int(0);
    kthread::exit(status);
}

pub fn sys_kthread_join(args: &SyscallArgs) -> Result<usize, SysError> {
    let tid = args.get_raw(0);
    let addr = args.get_addr(1);

    match kthread::join(Tid(tid), addr) {
        Ok(()) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

pub fn sys_kthread_kill(args: &SyscallArgs) -> Result<usize, SysError> {
    let tid = args.get_raw(0);

    if kthread::kill(Tid(tid)) {
        Ok(0)
    } else {
        Err(SysError::NoProcess)
    }
}
