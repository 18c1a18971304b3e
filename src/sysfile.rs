use alloc::string::String;
use alloc::vec::Vec;

use crate::exec::exec;
use crate::fs::Path;
use crate::param::{MAXARG, MAXPATH};
use crate::proc::current_proc;
use crate::syscall::{SysError, SyscallArgs};
use crate::vm::VA;

pub fn sys_write(args: &SyscallArgs) -> Result<usize, SysError> {
    let fd = args.get_fd(0)?;
    let addr = args.get_addr(1);
    let len = args.get_raw(2);

    // re-resolve; an exiting sibling thread may close the table under us
    match current_proc().data().open_files[fd].as_ref() {
        Some(file) => file.write(true, addr, len),
        None => err!(SysError::BadDescriptor),
    }
}

pub fn sys_exec(args: &SyscallArgs) -> Result<usize, SysError> {
    let path = args.fetch_string(args.get_addr(0), MAXPATH)?;
    let argv_addr = args.get_addr(1);

    let mut argv: Vec<String> = Vec::new();

    loop {
        if argv.len() > MAXARG {
            err!(SysError::InvalidArgument);
        }

        let pointer = args.fetch_usize(VA::from(
            argv_addr.as_usize() + argv.len() * size_of::<usize>(),
        ))?;

        if pointer == 0 {
            break;
        }

        argv.push(args.fetch_string(VA::from(pointer), MAXPATH)?);
    }

    let argv: Vec<&str> = argv.iter().map(|arg| arg.as_str()).collect();

    match log!(exec(&Path::new(&path), &argv)) {
        Ok(argc) => Ok(argc),
        Err(err) => Err(err.into()),
    }
}
