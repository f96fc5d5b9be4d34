//! Shared-state helpers
//!
//! [`SwapCell`] publishes immutable tables that the RX hot path reads without
//! ever seeing a half-built value: writers clone the current table, modify the
//! clone and swap the pointer in one step.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-lock an RwLock, recovering the data if a writer panicked
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock an RwLock, recovering the data if a writer panicked
pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Copy-modify-publish cell holding an immutable snapshot
#[derive(Debug)]
pub struct SwapCell<T> {
    current: RwLock<Arc<T>>,
    /// Serializes writers so concurrent updates are not lost
    writer: Mutex<()>,
}

impl<T: Clone> SwapCell<T> {
    /// Create a cell publishing `value`
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot; the read lock is held only for the pointer copy
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&read(&self.current))
    }

    /// Clone the current value, apply `f`, publish the result
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _writer = lock(&self.writer);
        let mut next = (*self.load()).clone();
        let result = f(&mut next);
        *write(&self.current) = Arc::new(next);
        result
    }

    /// Like [`update`](Self::update), but publishes only when `f` succeeds
    pub fn try_update<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E> {
        let _writer = lock(&self.writer);
        let mut next = (*self.load()).clone();
        let result = f(&mut next)?;
        *write(&self.current) = Arc::new(next);
        Ok(result)
    }
}

impl<T: Clone + Default> Default for SwapCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
