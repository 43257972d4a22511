//! Lock helpers shared by the coarse-grained registries.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Every guarded structure is left consistent between statements, so a
/// panic in an unrelated handler must not wedge the orchestrator.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
