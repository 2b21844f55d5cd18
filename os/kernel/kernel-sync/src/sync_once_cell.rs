use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;

/// A write-once cell that can be shared between CPUs.
///
/// The value is immutable once published. Racing initializers are
/// serialized: exactly one runs, the others spin until it finishes.
///
/// With [`SyncOnceCell::get_or_try_init`] a failing initializer leaves the
/// cell empty again, so the next caller retries.
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
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if already initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Initialize at most once and return `&T`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        match self.get_or_try_init(|| Ok::<T, core::convert::Infallible>(init())) {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    /// Initialize at most once with a fallible initializer.
    ///
    /// On `Err` nothing is cached and the error is handed back to the caller
    /// that ran the initializer.
    ///
    /// # Errors
    /// Whatever `init` returns.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        let mut init = Some(init);
        loop {
            if let Some(v) = self.get() {
                return Ok(v);
            }

            if self
                .state
                .compare_exchange(EMPTY, RUNNING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // A call returns as soon as its initializer ran, so `init`
                // is still present whenever this exchange succeeds.
                let Some(f) = init.take() else {
                    self.state.store(EMPTY, Ordering::Release);
                    continue;
                };
                return match f() {
                    Ok(v) => {
                        unsafe {
                            (*self.value.get()).write(v);
                        }
                        self.state.store(READY, Ordering::Release);
                        // SAFETY: just written and published.
                        Ok(unsafe { (*self.value.get()).assume_init_ref() })
                    }
                    Err(e) => {
                        self.state.store(EMPTY, Ordering::Release);
                        Err(e)
                    }
                };
            }

            while self.state.load(Ordering::Acquire) == RUNNING {
                spin_loop();
            }
        }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means the value is initialized and owned by us.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
