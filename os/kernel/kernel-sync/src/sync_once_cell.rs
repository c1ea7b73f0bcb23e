use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A cell written at most once, then shared read-only.
///
/// Used for kernel-wide state that is built during boot and frozen in shape
/// afterwards.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if already initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only published after the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Stores `value` unless the cell is already set or being set.
    ///
    /// # Errors
    /// Returns the value back if the cell was not empty.
    pub fn set(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        Ok(self.publish(value))
    }

    /// Initialize at most once and return `&T`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return self.publish(init());
        }

        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // SAFETY: READY
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Like [`get_or_init`](Self::get_or_init) for fallible initializers.
    ///
    /// A failed initializer leaves the cell empty.
    ///
    /// # Errors
    /// Propagates the initializer's error.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        if let Some(v) = self.get() {
            return Ok(v);
        }

        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return match init() {
                Ok(v) => Ok(self.publish(v)),
                Err(e) => {
                    self.state.store(UNINIT, Ordering::Release);
                    Err(e)
                }
            };
        }

        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // SAFETY: READY
        Ok(unsafe { (*self.value.get()).assume_init_ref() })
    }

    /// Write the value and mark the cell READY. Caller holds INITING.
    fn publish(&self, value: T) -> &T {
        let v = unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        v
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means initialized; we have exclusive access.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
