//! Poison-tolerant locking helper shared by the engine internals.

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the inner data if a previous holder panicked.
///
/// The engine's critical sections only flip small state flags, so a poisoned
/// guard still holds a consistent value and can be reused.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
