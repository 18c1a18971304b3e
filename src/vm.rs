use core::cmp::min;
use core::fmt::Display;
use core::mem::MaybeUninit;
use core::ops::{Add, Deref, DerefMut};

use alloc::boxed::Box;

use crate::memlayout::{KERNBASE, PHYSTOP, TRAMPOLINE, TRAPFRAME, UART0};
use crate::proc::PROC_TABLE;
use crate::riscv::{
    MAXVA, PGSIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X, pa_to_pte, pg_round_down, pg_round_up,
    pte_flags, pte_to_pa, px,
    registers::{satp, vma},
};
use crate::sync::OnceLock;
use crate::trampoline::trampoline;

// kernel.ld sets this to the end of the kernel code
unsafe extern "C" {
    fn etext();
}

pub static KVM: OnceLock<Kvm> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Alloc,
    InvalidPage,
    InvalidAddress,
    InvalidPte,
}

impl From<core::alloc::AllocError> for VmError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::Alloc
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Alloc => write!(f, "alloc error"),
            VmError::InvalidPage => write!(f, "invalid page"),
            VmError::InvalidAddress => write!(f, "invalid address"),
            VmError::InvalidPte => write!(f, "invalid pte"),
        }
    }
}

/// Physical address
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PA(usize);

impl PA {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<usize> for PA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VA(usize);

impl VA {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for VA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Add<usize> for VA {
    type Output = VA;

    fn add(self, rhs: usize) -> Self::Output {
        VA(self.0 + rhs)
    }
}

/// One page of physical memory, used wherever a raw page is allocated
/// (user memory, kernel stacks).
#[repr(C, align(4096))]
pub struct Page(pub [u8; PGSIZE]);

impl Page {
    pub fn try_new_zeroed() -> Result<Box<Self>, VmError> {
        let page: Box<MaybeUninit<Self>> = Box::try_new_zeroed()?;
        Ok(unsafe { page.assume_init() })
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct PageTableEntry(usize);

impl PageTableEntry {
    /// Check if the PTE is valid.
    fn is_v(&self) -> bool {
        self.0 & PTE_V != 0
    }

    /// Check if the PTE is accessible by user mode instructions.
    fn is_u(&self) -> bool {
        self.0 & PTE_U != 0
    }

    /// Check if the PTE is writable.
    fn is_w(&self) -> bool {
        self.0 & PTE_W != 0
    }

    /// Check if the PTE is a leaf (pointing to a PA).
    fn is_leaf(&self) -> bool {
        // If the PTE is a leaf, it has at least one of the permission bits set.
        (self.0 & (PTE_X | PTE_W | PTE_R)) != 0
    }

    fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }
}

#[repr(C, align(4096))]
struct RawPageTable([PageTableEntry; 512]);

impl RawPageTable {
    fn try_new() -> Result<*mut Self, VmError> {
        let memory: Box<MaybeUninit<RawPageTable>> = Box::try_new_zeroed()?;
        let memory = unsafe { memory.assume_init() };
        Ok(Box::into_raw(memory))
    }
}

impl Deref for RawPageTable {
    type Target = [PageTableEntry; 512];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RawPageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A pointer to an Sv39 page table page.
#[derive(Debug)]
pub struct PageTable {
    ptr: *mut RawPageTable,
}

impl PageTable {
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self {
            ptr: RawPageTable::try_new()?,
        })
    }

    fn from_pa(pa: PA) -> Self {
        Self {
            ptr: pa.as_usize() as *mut RawPageTable,
        }
    }

    pub fn as_pa(&self) -> PA {
        PA(self.ptr as usize)
    }

    /// Returns the PTE for virtual address `va`, walking down the three
    /// levels and optionally allocating the intermediate page-table pages.
    fn walk(&mut self, va: VA, alloc: bool) -> Result<&mut PageTableEntry, VmError> {
        assert!(va.as_usize() < MAXVA, "walk");

        let mut pagetable = self.ptr;

        unsafe {
            for level in (1..=2).rev() {
                let pte = (*pagetable)
                    .get_mut(px(level, va.as_usize()))
                    .expect("walk: valid pagetable");

                if pte.is_v() {
                    pagetable = pte.as_pa().as_usize() as *mut RawPageTable;
                } else {
                    if !alloc {
                        return Err(VmError::InvalidPage);
                    }

                    pagetable = RawPageTable::try_new()?;
                    pte.0 = pa_to_pte(pagetable as usize) | PTE_V;
                }
            }

            Ok((*pagetable).get_mut(px(0, va.as_usize())).unwrap())
        }
    }

    /// Look up a virtual address and return the physical address.
    /// Can only be used to look up user pages.
    fn walk_addr(&mut self, va: VA) -> Result<PA, VmError> {
        if va.as_usize() >= MAXVA {
            return Err(VmError::InvalidAddress);
        }

        let pte = self.walk(va, false)?;

        if !pte.is_v() || !pte.is_u() {
            return Err(VmError::InvalidPte);
        }

        Ok(pte.as_pa())
    }

    /// Create PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`. `va` and `size` must be
    /// page-aligned.
    pub fn map_pages(&mut self, va: VA, pa: PA, size: usize, perm: usize) -> Result<(), VmError> {
        assert_eq!(va.as_usize() % PGSIZE, 0, "map_pages: va not aligned");
        assert_eq!(size % PGSIZE, 0, "map_pages: size not aligned");
        assert_ne!(size, 0, "map_pages: size");

        let last = va.as_usize() + size - PGSIZE;
        let mut va = va;
        let mut pa = pa.as_usize();

        loop {
            let pte = self.walk(va, true)?;
            assert!(!pte.is_v(), "map_pages: remap");

            pte.0 = pa_to_pte(pa) | perm | PTE_V;

            if va.as_usize() == last {
                break;
            }

            va = va + PGSIZE;
            pa += PGSIZE;
        }

        Ok(())
    }

    /// Recursively free page-table pages.
    /// All leaf mappings must already have been removed.
    fn free_walk(self) {
        let pagetable = unsafe { &mut *self.ptr };

        for pte in pagetable.iter_mut() {
            if pte.is_v() {
                if pte.is_leaf() {
                    panic!("free_walk: leaf");
                }

                // this PTE points to a lower-level page table
                let child = PageTable::from_pa(pte.as_pa());
                child.free_walk();
                *pte = PageTableEntry(0);
            }
        }

        let _pt = unsafe { Box::from_raw(self.ptr) };
    }
}

/// Kernel page table
#[derive(Debug)]
pub struct Kvm(PageTable);

// Safety: built once at boot, then only read through the satp register.
unsafe impl Sync for Kvm {}
unsafe impl Send for Kvm {}

impl Kvm {
    fn new() -> Result<Self, VmError> {
        Ok(Self(PageTable::try_new()?))
    }

    pub fn map(&mut self, va: VA, pa: PA, size: usize, perm: usize) {
        if self.0.map_pages(va, pa, size, perm).is_err() {
            panic!("kvmmap");
        }
    }

    /// Builds the direct-mapped kernel page table.
    unsafe fn make(&mut self) {
        // uart registers
        self.map(VA(UART0), PA(UART0), PGSIZE, PTE_R | PTE_W);

        // kernel text executable and read-only
        self.map(
            VA(KERNBASE),
            PA(KERNBASE),
            (etext as *const () as usize) - KERNBASE,
            PTE_R | PTE_X,
        );

        // kernel data and the physical RAM
        self.map(
            VA(etext as *const () as usize),
            PA(etext as *const () as usize),
            PHYSTOP - (etext as *const () as usize),
            PTE_R | PTE_W,
        );

        // trampoline for trap entry/exit, mapped to the highest virtual
        // address in the kernel
        self.map(
            VA(TRAMPOLINE),
            PA(trampoline as *const () as usize),
            PGSIZE,
            PTE_R | PTE_X,
        );

        // one kernel stack per (process, thread) slot, each below a guard page
        unsafe { PROC_TABLE.map_stacks(self) };
    }
}

/// User page table
#[derive(Debug)]
pub struct Uvm(PageTable);

impl Uvm {
    /// Create an empty user page table.
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self(PageTable::try_new()?))
    }

    /// Remove npages of mappings starting from `va`.
    /// `va` must be page-aligned and the mappings must exist.
    /// Optionally, free the physical memory.
    pub fn unmap(&mut self, va: VA, npages: usize, free: bool) {
        assert_eq!(va.as_usize() % PGSIZE, 0, "uvm unmap: not aligned");

        for i in (va.as_usize()..va.as_usize() + npages * PGSIZE).step_by(PGSIZE) {
            match self.0.walk(VA(i), false) {
                Err(_) => panic!("uvm unmap: walk"),
                Ok(pte) if !pte.is_v() => panic!("uvm unmap: not mapped"),
                Ok(pte) if !pte.is_leaf() => panic!("uvm unmap: not a leaf"),
                Ok(pte) => {
                    if free {
                        let pa = pte.as_pa();
                        let _page = unsafe { Box::from_raw(pa.as_usize() as *mut Page) };
                    }
                    *pte = PageTableEntry(0);
                }
            }
        }
    }

    /// Load the initial program image into address 0 of the page table,
    /// for the very first process. `bytes` must fit on one page.
    pub fn first(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        assert!(bytes.len() < PGSIZE, "first: more than a page");

        let mem = Page::try_new_zeroed()?;
        let mem = Box::into_raw(mem);

        self.0.map_pages(
            VA(0),
            PA(mem as usize),
            PGSIZE,
            PTE_R | PTE_W | PTE_X | PTE_U,
        )?;

        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), mem as *mut u8, bytes.len());
        }

        Ok(())
    }

    /// Allocate PTEs and physical memory to grow the process from `old_size`
    /// to `new_size`, which need not be page-aligned.
    /// Returns the new process size.
    pub fn alloc(&mut self, old_size: usize, new_size: usize, xperm: usize) -> Result<usize, VmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        let old_size = pg_round_up(old_size);
        for i in (old_size..new_size).step_by(PGSIZE) {
            let mem = match Page::try_new_zeroed() {
                Ok(mem) => mem,
                Err(err) => {
                    self.dealloc(i, old_size);
                    return Err(err);
                }
            };

            let mem = Box::into_raw(mem);

            if let Err(err) =
                self.0
                    .map_pages(VA(i), PA(mem as usize), PGSIZE, PTE_R | PTE_U | xperm)
            {
                let _page = unsafe { Box::from_raw(mem) };
                self.dealloc(i, old_size);
                return Err(err);
            }
        }

        Ok(new_size)
    }

    /// Deallocate user pages to bring the process size from `old_size` to
    /// `new_size`. Neither needs to be page-aligned. Returns the new size.
    pub fn dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let original_new_size = new_size;
        let old_size = pg_round_up(old_size);
        let new_size = pg_round_up(new_size);

        if new_size < old_size {
            let npages = (old_size - new_size) / PGSIZE;
            self.unmap(VA(new_size), npages, true);
        }

        original_new_size
    }

    /// Mark a mapping as inaccessible to user mode.
    /// Used by exec for the stack guard page.
    pub fn clear(&mut self, va: VA) {
        let pte = self.0.walk(va, false).expect("uvm clear");
        pte.0 &= !PTE_U;
    }

    /// Copy this page table's memory into `target`, for fork.
    /// Copies both the page table and the physical memory.
    pub fn copy(&mut self, target: &mut Uvm, size: usize) -> Result<(), VmError> {
        for i in (0..size).step_by(PGSIZE) {
            let pte = self.0.walk(VA(i), false).expect("uvm copy: walk");
            assert!(pte.is_v(), "uvm copy: page not present");

            let pa = pte.as_pa();
            let flags = pte_flags(pte.0);

            let mem = match Page::try_new_zeroed() {
                Ok(mem) => mem,
                Err(err) => {
                    target.unmap(VA(0), i / PGSIZE, true);
                    return Err(err);
                }
            };

            let mem = Box::into_raw(mem);

            unsafe {
                core::ptr::copy_nonoverlapping(pa.as_usize() as *const u8, mem as *mut u8, PGSIZE);
            }

            if let Err(err) = target.0.map_pages(VA(i), PA(mem as usize), PGSIZE, flags) {
                let _page = unsafe { Box::from_raw(mem) };
                target.unmap(VA(0), i / PGSIZE, true);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Free user memory pages, then free page-table pages.
    pub fn free(mut self, size: usize) {
        if size > 0 {
            self.unmap(VA(0), pg_round_up(size) / PGSIZE, true);
        }
        self.0.free_walk();
    }

    /// Free a process's page table, and free the physical memory it refers to.
    /// Unmaps the trampoline and trapframe pages without freeing them.
    pub fn proc_free(mut self, size: usize) {
        self.unmap(VA(TRAMPOLINE), 1, false);
        self.unmap(VA(TRAPFRAME), 1, false);
        self.free(size);
    }

    /// Copy from kernel to user.
    /// Copies bytes from `src` to virtual address `dstva` in this page table.
    pub fn copy_out(&mut self, dstva: VA, mut src: &[u8]) -> Result<(), VmError> {
        let mut dstva = dstva.as_usize();

        while !src.is_empty() {
            let va0 = pg_round_down(dstva);

            if va0 >= MAXVA {
                return Err(VmError::InvalidAddress);
            }

            let pte = self.0.walk(VA(va0), false)?;

            if !pte.is_v() || !pte.is_u() || !pte.is_w() {
                return Err(VmError::InvalidPte);
            }

            let pa0 = pte.as_pa();
            let n = min(PGSIZE - (dstva - va0), src.len());

            unsafe {
                let src_ptr = src[..n].as_ptr();
                let dst_ptr = (pa0.as_usize() + (dstva - va0)) as *mut u8;
                core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, n);
            }

            src = &src[n..];
            dstva = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copy from user to kernel.
    /// Copies bytes from virtual address `srcva` in this page table to `dst`.
    pub fn copy_in(&mut self, mut dst: &mut [u8], srcva: VA) -> Result<(), VmError> {
        let mut srcva = srcva.as_usize();

        while !dst.is_empty() {
            let va0 = pg_round_down(srcva);
            let pa0 = self.0.walk_addr(VA(va0))?;

            let n = min(PGSIZE - (srcva - va0), dst.len());

            unsafe {
                let src_ptr = (pa0.as_usize() + (srcva - va0)) as *const u8;
                core::ptr::copy_nonoverlapping(src_ptr, dst.as_mut_ptr(), n);
            }

            dst = &mut dst[n..];
            srcva = va0 + PGSIZE;
        }

        Ok(())
    }

    pub fn as_pa(&self) -> PA {
        self.0.as_pa()
    }
}

impl Deref for Uvm {
    type Target = PageTable;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Uvm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Initialize the kernel page table.
pub fn init() {
    KVM.initialize(|| {
        let mut kvm = Kvm::new()?;
        // Safety: boot-time, single-threaded
        unsafe { kvm.make() };
        Ok::<_, VmError>(kvm)
    })
    .expect("kvm init");
}

/// Switch the hardware page table register to the kernel's page table and
/// enable paging.
pub fn init_hart() {
    unsafe {
        // wait for any previous writes to the page table memory to finish
        vma::sfence();

        satp::write(satp::make(KVM.get().expect("kvm to be init").0.as_pa().as_usize()));

        // flush stale entries from the TLB
        vma::sfence();
    }
}
