/// maximum number of CPUs
pub const NCPU: usize = 8;
/// maximum number of processes
pub const NPROC: usize = 64;
/// kernel threads per process
pub const NKT: usize = 8;
/// open files per process
pub const NOFILE: usize = 16;
/// open files per system
pub const NFILE: usize = 100;
/// device number of the boot image root
pub const ROOTDEV: u32 = 1;
/// max exec arguments
pub const MAXARG: usize = 32;
/// max filesystem operations in flight at once
pub const MAXOPS: usize = 10;
/// maximum file path name
pub const MAXPATH: usize = 128;
/// kernel stack pages per thread (debug needs more stack to dump)
#[cfg(debug_assertions)]
pub const NKSTACK_PAGES: usize = 8;
#[cfg(not(debug_assertions))]
pub const NKSTACK_PAGES: usize = 1;
/// user stack pages
pub const USERSTACK: usize = 1;
