// Physical memory layout
//
// qemu -machine virt is set up like this, based on qemu's hw/riscv/virt.c:
//
// 00001000 -- boot ROM, provided by qemu
// 02000000 -- CLINT
// 0C000000 -- PLIC
// 10000000 -- uart0
// 80000000 -- boot ROM jumps here in machine mode; -kernel loads the kernel here
// unused RAM after 80000000.
//
// the kernel uses physical memory thus:
// 80000000 -- entry.rs, then kernel text and data
// end -- start of kernel page allocation area
// PHYSTOP -- end of RAM used by the kernel

use crate::param::{NKSTACK_PAGES, NKT};
use crate::riscv::{MAXVA, PGSIZE};

pub const UART0: usize = 0x1000_0000;

pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// Map the trampoline page to the highest address, in both user and kernel space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// The page just below the trampoline holds the trapframes of every kernel
/// thread of the process, one slot per thread.
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Size of one trapframe slot. kthread.rs asserts that this matches the real
/// struct and that NKT slots fit in the page.
pub const TRAPFRAME_SIZE: usize = 288;

/// Virtual address of thread slot `i`'s trapframe within the trapframe page.
pub const fn trapframe(i: usize) -> usize {
    TRAPFRAME + i * TRAPFRAME_SIZE
}

/// Kernel virtual address of kernel stack `n`, counted over every
/// (process, thread) pair as `proc_index * NKT + thread_index`.
/// Each stack is NKSTACK_PAGES pages followed by an unmapped guard page.
pub const fn kstack(n: usize) -> usize {
    TRAMPOLINE - PGSIZE - (n + 1) * (NKSTACK_PAGES + 1) * PGSIZE
}

/// Stack slot index for thread `kt` of process `p`.
pub const fn kstack_index(p: usize, kt: usize) -> usize {
    p * NKT + kt
}
