use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// A spin-based one-shot cell for lazily initialized globals.
///
/// The first caller of [`get_or_init`](Self::get_or_init) to win the CAS runs
/// the initializer; everyone else spins until the value is published. After
/// that, [`get`](Self::get) is a single Acquire load.
///
/// The initializer must not panic: a panicking initializer leaves the cell in
/// the busy state forever and all later callers spin.
///
/// # Examples
///
/// ```
/// use kernel_sync::SyncOnceCell;
///
/// static CELL: SyncOnceCell<u32> = SyncOnceCell::new();
///
/// assert_eq!(*CELL.get_or_init(|| 7), 7);
/// assert_eq!(CELL.get(), Some(&7));
/// ```
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns the value if it has been published.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // Safety: READY is only stored after the value is written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Initializes the cell at most once and returns the value.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let v = init();
            unsafe {
                (*self.value.get()).write(v);
            }
            // Publish the write before flipping to READY.
            self.state.store(READY, Ordering::Release);
        } else {
            while self.state.load(Ordering::Acquire) != READY {
                spin_loop();
            }
        }
        // Safety: READY observed (or just stored by us).
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the value is written exactly once and only shared after READY.
unsafe impl<T: Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
