use core::fmt::Display;

use alloc::string::String;

use crate::error::KernelError;
use crate::fs::FsError;
use crate::kthread::TrapFrame;
use crate::param::NOFILE;
use crate::proc::{Proc, current_proc, current_proc_and_data_mut};
use crate::sysfile::*;
use crate::sysproc::*;
use crate::vm::VA;

/// Syscall error codes using POSIX-standard numeric values.
///
/// The kernel encodes `-(error_code as isize)` in the return register (`a0`).
/// User space decodes negative values back into `SysError` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SysError {
    NotPermitted = 1,
    NoEntry = 2,
    NoProcess = 3,
    Interrupted = 4,
    IoError = 5,
    InvalidExecutable = 8,
    BadDescriptor = 9,
    NoChildren = 10,
    ResourceUnavailable = 11,
    OutOfMemory = 12,
    BadAddress = 14,
    InvalidArgument = 22,
    NameTooLong = 36,
    NotImplemented = 38,
}

impl SysError {
    /// Returns the error code for this error.
    pub fn as_code(self) -> u16 {
        self as u16
    }

    /// Decodes an error code into a `SysError` variant.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::NotPermitted,
            2 => Self::NoEntry,
            3 => Self::NoProcess,
            4 => Self::Interrupted,
            5 => Self::IoError,
            8 => Self::InvalidExecutable,
            9 => Self::BadDescriptor,
            10 => Self::NoChildren,
            11 => Self::ResourceUnavailable,
            12 => Self::OutOfMemory,
            14 => Self::BadAddress,
            36 => Self::NameTooLong,
            38 => Self::NotImplemented,
            _ => Self::InvalidArgument,
        }
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SysError::NotPermitted => write!(f, "operation not permitted"),
            SysError::NoEntry => write!(f, "no such file or directory"),
            SysError::NoProcess => write!(f, "no such process"),
            SysError::Interrupted => write!(f, "interrupted"),
            SysError::IoError => write!(f, "input/output error"),
            SysError::InvalidExecutable => write!(f, "exec format error"),
            SysError::BadDescriptor => write!(f, "bad file descriptor"),
            SysError::NoChildren => write!(f, "no child processes"),
            SysError::ResourceUnavailable => write!(f, "resource temporarily unavailable"),
            SysError::OutOfMemory => write!(f, "cannot allocate memory"),
            SysError::BadAddress => write!(f, "bad address"),
            SysError::InvalidArgument => write!(f, "invalid argument"),
            SysError::NameTooLong => write!(f, "file name too long"),
            SysError::NotImplemented => write!(f, "function not implemented"),
        }
    }
}

impl From<FsError> for SysError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Resolve => SysError::NoEntry,
            FsError::Type => SysError::InvalidArgument,
            FsError::OutOfFile => SysError::ResourceUnavailable,
        }
    }
}

impl From<KernelError> for SysError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Alloc => SysError::OutOfMemory,
            KernelError::InvalidArgument => SysError::InvalidArgument,
            KernelError::OutOfProc | KernelError::OutOfKthread => SysError::ResourceUnavailable,
            KernelError::Vm(_) => SysError::BadAddress,
            KernelError::Fs(e) => e.into(),
            KernelError::Exec(_) => SysError::InvalidExecutable,
            KernelError::Syscall(e) => e,
        }
    }
}

/// Wrapper for extracting typed syscall arguments from the trapframe.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &Proc {
        self.proc
    }

    /// Returns the argument at the given index as a usize.
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.a0,
            1 => self.trapframe.a1,
            2 => self.trapframe.a2,
            3 => self.trapframe.a3,
            4 => self.trapframe.a4,
            5 => self.trapframe.a5,
            _ => panic!("invalid syscall argument index {}", index),
        }
    }

    /// Returns the argument at the given index as an isize.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns the argument at the given index as a virtual address.
    ///
    /// Does not check for legality, since `copy_in`/`copy_out` will do that.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// Fetch the nth word-sized system call argument as a file descriptor,
    /// checked to be open in the current process.
    pub fn get_fd(&self, index: usize) -> Result<usize, SysError> {
        let fd: usize = try_log!(
            self.get_int(index)
                .try_into()
                .or(Err(SysError::BadDescriptor))
        );

        if fd >= NOFILE || current_proc().data().open_files[fd].is_none() {
            err!(SysError::BadDescriptor);
        }

        Ok(fd)
    }

    /// Fetches a nul-terminated string from user space.
    pub fn fetch_string(&self, addr: VA, max: usize) -> Result<String, SysError> {
        let (_proc, data) = current_proc_and_data_mut();

        let mut result = String::with_capacity(max);

        let mut buf = [0u8; 1];
        for i in 0..max {
            try_log!(
                data.pagetable_mut()
                    .copy_in(&mut buf, VA::from(addr.as_usize() + i))
                    .map_err(|_| SysError::BadAddress)
            );

            if buf[0] == 0 {
                return Ok(result);
            }

            result.push(buf[0] as char);
        }

        err!(SysError::NameTooLong);
    }

    /// Fetches a word from user space.
    pub fn fetch_usize(&self, addr: VA) -> Result<usize, SysError> {
        let (_proc, data) = current_proc_and_data_mut();

        let mut buf = [0u8; size_of::<usize>()];
        try_log!(
            data.pagetable_mut()
                .copy_in(&mut buf, addr)
                .map_err(|_| SysError::BadAddress)
        );

        Ok(usize::from_le_bytes(buf))
    }
}

/// System call numbers.
/// The numbers initcode bakes in (exec, exit) are xv6's; the kthread calls
/// extend the table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    Exec = 7,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Write = 16,
    KthreadCreate = 22,
    KthreadId = 23,
    KthreadExit = 24,
    KthreadJoin = 25,
    KthreadKill = 26,
}

impl TryFrom<usize> for Syscall {
    type Error = SysError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            6 => Ok(Syscall::Kill),
            7 => Ok(Syscall::Exec),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            16 => Ok(Syscall::Write),
            22 => Ok(Syscall::KthreadCreate),
            23 => Ok(Syscall::KthreadId),
            24 => Ok(Syscall::KthreadExit),
            25 => Ok(Syscall::KthreadJoin),
            26 => Ok(Syscall::KthreadKill),
            _ => Err(SysError::NotImplemented),
        }
    }
}

/// Handle a system call.
///
/// # Safety
/// Called from `usertrap` in trap.rs.
pub unsafe fn syscall(trapframe: &mut TrapFrame) {
    let proc = current_proc();
    let args = SyscallArgs::new(trapframe, proc);

    let result = match Syscall::try_from(trapframe.a7) {
        Ok(syscall) => match syscall {
            Syscall::Fork => sys_fork(&args),
            Syscall::Exit => sys_exit(&args),
            Syscall::Wait => sys_wait(&args),
            Syscall::Kill => sys_kill(&args),
            Syscall::Exec => sys_exec(&args),
            Syscall::Getpid => sys_getpid(&args),
            Syscall::Sbrk => sys_sbrk(&args),
            Syscall::Sleep => sys_sleep(&args),
            Syscall::Uptime => sys_uptime(&args),
            Syscall::Write => sys_write(&args),
            Syscall::KthreadCreate => sys_kthread_create(&args),
            Syscall::KthreadId => sys_kthread_id(&args),
            Syscall::KthreadExit => sys_kthread_exit(&args),
            Syscall::KthreadJoin => sys_kthread_join(&args),
            Syscall::KthreadKill => sys_kthread_kill(&args),
        },
        Err(e) => Err(e),
    };

    trapframe.a0 = match log!(result) {
        Ok(v) => v,
        Err(error) => {
            #[cfg(debug_assertions)]
            println!(
                "! syscall error ({}) from proc {} ({})",
                error,
                *proc.inner.lock().pid,
                proc.data().name,
            );
            (-(error.as_code() as isize)) as usize
        }
    };
}
