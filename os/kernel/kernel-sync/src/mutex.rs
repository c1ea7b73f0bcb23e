use crate::IrqGuard;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-set spin lock owning its value.
///
/// The kernel is single-core, so contention only happens when an interrupt
/// handler tries to take a lock the interrupted code already holds. Use
/// [`SpinMutex::lock_irq`] for state that handlers may touch.
pub struct SpinMutex<T> {
    held: AtomicBool,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            cell: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinMutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.held.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinMutexGuard { m: self })
        }
    }

    /// Masks interrupts, then takes the lock.
    ///
    /// The lock is released before the interrupt state is restored.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }

    /// Runs `f` with the lock held and interrupts masked.
    #[inline]
    pub fn with_lock_irq<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock_irq();
        f(&mut g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

pub struct SpinMutexGuard<'a, T> {
    m: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.m.held.store(false, Ordering::Release);
    }
}

/// Lock guard that also keeps interrupts masked.
///
/// Field order matters: the lock guard drops first, then the interrupt state
/// is restored.
pub struct IrqMutexGuard<'a, T> {
    guard: SpinMutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
