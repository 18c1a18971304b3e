use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{CPU_TABLE, Cpu, InterruptLock};

/// A non-sleeping mutual exclusion lock that owns its data.
///
/// Locked when the CPU pointer is not null. Interrupts are disabled on this
/// CPU for as long as any guard is alive (see [`InterruptLock`]).
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

// Safety: UnsafeCell is not Sync but it can only be consumed with a guard
// or an exclusive reference. So SpinLock is safe to sync, if the inner type T is.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

// Safety: UnsafeCell inside SpinLock is not Sync but only one thread can hold
// this guard. So SpinLockGuard is safe to sync as long as the inner type T is.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if this CPU holds the lock.
    ///
    /// # Safety
    /// Must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { CPU_TABLE.current() as *mut Cpu }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let _intr_lock = CPU_TABLE.lock_current();

        unsafe {
            assert!(!self.holding(), "acquire {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        CPU_TABLE.current(),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Releases the lock by consuming its guard and returns a reference to the
    /// lock itself, so the caller can re-acquire it later (see `proc::sleep`).
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Releases a lock held by a guard that lives on another stack.
    ///
    /// A freshly scheduled thread starts in `fork_ret` while the scheduler's
    /// guard for its thread lock is still live on the scheduler's stack; this
    /// is the one way to release it from the thread's side.
    ///
    /// # Safety
    /// The caller must be on the CPU that holds the lock, and the original
    /// guard must never be used again before the lock is re-acquired.
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding(), "force unlock {}", self.name);
            self.cpu.store(ptr::null_mut(), Ordering::Release);
            CPU_TABLE.current().unlock();
        }
    }

    /// Mutable access without taking the lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

// Dropping the guard releases the lock on the data and then, through
// `_intr_lock`, pops one level of the interrupt-disable nesting.
impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: the guard still owns an interrupt lock, so holding is safe to call
        unsafe {
            assert!(self.lock.holding(), "release {}", self.lock.name);
        }

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
