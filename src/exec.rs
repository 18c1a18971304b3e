use core::fmt::Display;

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::fs::{InodeType, Path};
use crate::log::Operation;
use crate::param::{MAXARG, USERSTACK};
use crate::proc::{current_kthread, current_proc};
use crate::riscv::{PGSIZE, PTE_W, PTE_X, pg_round_up};
use crate::vm::VA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// the path does not name a loadable image
    Image,
    /// more than MAXARG arguments
    TooManyArgs,
    /// the arguments overflow the user stack
    Stack,
}

impl Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::Image => write!(f, "not an executable image"),
            ExecError::TooManyArgs => write!(f, "too many arguments"),
            ExecError::Stack => write!(f, "arguments overflow the stack"),
        }
    }
}

/// Replaces the calling process's user memory with the named boot image and
/// resets the calling thread to enter it at address 0.
///
/// Boot images are flat binaries linked at 0; the stack sits above the image
/// behind an inaccessible guard page, holding the argument strings, and
/// `main(argc, argv)` receives its arguments in a0/a1 through the syscall
/// return path. Returns argc.
pub fn exec(path: &Path<'_>, argv: &[&str]) -> Result<usize, KernelError> {
    let image = {
        let _op = Operation::begin();

        let inode = try_log!(path.resolve());
        if inode.r#type() != InodeType::File {
            inode.put();
            err!(ExecError::Image);
        }

        let image = try_log!(inode.data());
        inode.put();
        image
    };

    let proc = current_proc();
    let kt = current_kthread();

    // a fresh page table, with only the trampoline and trapframes mapped
    let mut uvm = try_log!(proc.create_pagetable());

    // load the image at address 0
    let mut size = match log!(uvm.alloc(0, image.len(), PTE_W | PTE_X)) {
        Ok(size) => size,
        Err(err) => {
            uvm.proc_free(0);
            return Err(err.into());
        }
    };

    if let Err(err) = log!(uvm.copy_out(VA::new(0), image)) {
        uvm.proc_free(size);
        return Err(err.into());
    }

    // Allocate the user stack just above the image, below an inaccessible
    // guard page that catches stack overflows.
    size = pg_round_up(size);
    let stack_top = match log!(uvm.alloc(size, size + (USERSTACK + 1) * PGSIZE, PTE_W)) {
        Ok(new_size) => new_size,
        Err(err) => {
            uvm.proc_free(size);
            return Err(err.into());
        }
    };
    let size = stack_top;
    uvm.clear(VA::new(stack_top - (USERSTACK + 1) * PGSIZE));
    let stack_base = stack_top - USERSTACK * PGSIZE;

    if argv.len() > MAXARG {
        uvm.proc_free(size);
        err!(ExecError::TooManyArgs);
    }

    // push the argument strings, recording their addresses
    let mut sp = stack_top;
    let mut ustack = [0usize; MAXARG + 1];

    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1; // nul terminator
        sp -= sp % 16; // riscv requires 16-byte stack alignment

        if sp < stack_base {
            uvm.proc_free(size);
            err!(ExecError::Stack);
        }

        let mut bytes = Vec::with_capacity(arg.len() + 1);
        bytes.extend_from_slice(arg.as_bytes());
        bytes.push(0);

        if let Err(err) = log!(uvm.copy_out(VA::new(sp), &bytes)) {
            uvm.proc_free(size);
            return Err(err.into());
        }

        ustack[i] = sp;
    }
    ustack[argv.len()] = 0;

    // push the argv[] array of pointers
    sp -= (argv.len() + 1) * size_of::<usize>();
    sp -= sp % 16;

    if sp < stack_base {
        uvm.proc_free(size);
        err!(ExecError::Stack);
    }

    let mut table = Vec::with_capacity((argv.len() + 1) * size_of::<usize>());
    for pointer in ustack.iter().take(argv.len() + 1) {
        table.extend_from_slice(&pointer.to_le_bytes());
    }

    if let Err(err) = log!(uvm.copy_out(VA::new(sp), &table)) {
        uvm.proc_free(size);
        return Err(err.into());
    }

    // commit to the new image
    // Safety: we are a thread of the current process
    let data = unsafe { proc.data_mut() };
    let old_size = data.size;
    let old = data.pagetable.replace(uvm).expect("exec: no page table");
    data.size = size;
    data.name.clear();
    data.name.push_str(path.file_name());

    // Safety: we are the current thread
    let trapframe = unsafe { kt.data_mut() }.trapframe_mut();
    trapframe.epc = 0; // flat images are entered at their load address
    trapframe.sp = sp;
    trapframe.a1 = sp; // argv

    old.proc_free(old_size);

    Ok(argv.len()) // argc, ends up in a0
}
