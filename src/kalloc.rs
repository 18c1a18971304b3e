use core::alloc::{GlobalAlloc, Layout};

use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

use crate::memlayout::PHYSTOP;
use crate::spinlock::SpinLock;

unsafe extern "C" {
    /// First address after kernel, defined by kernel.ld.
    static end: [u8; 0];
}

/// Kernel memory allocator
#[global_allocator]
static KMEM: Kmem = Kmem(SpinLock::new(None, "kmem"));

struct Kmem(SpinLock<Option<BuddyAlloc>>);

/// # Safety
/// Even though `BuddyAlloc` is not thread safe, `Kmem` is thread safe because
/// it is guarded by a `SpinLock`.
unsafe impl Sync for Kmem {}

unsafe impl GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .as_mut()
            .expect("kmem to be init")
            .malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().as_mut().expect("kmem to be init").free(ptr);
    }
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel memory allocation failed: {:?}", layout);
}

/// Hands the physical memory between the end of the kernel image and PHYSTOP
/// to the allocator.
///
/// # Safety
/// Must be called exactly once, before the first allocation.
pub unsafe fn init() {
    let heap_start = unsafe { end.as_ptr() };
    let heap_size = PHYSTOP - heap_start as usize;

    let mut kmem = KMEM.0.lock();
    assert!(kmem.is_none(), "kalloc double init");

    // Safety: the region [end, PHYSTOP) is unused RAM.
    kmem.replace(unsafe {
        BuddyAlloc::new(BuddyAllocParam::new(heap_start, heap_size, 4096))
    });
}
