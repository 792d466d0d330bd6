use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock acquisition that absorbs poisoning.
///
/// Daemon threads here hold locks only for short metadata updates; a
/// panic while holding one leaves the data in a state the next reader
/// can still work with, so recovery beats propagating the poison.
pub(crate) trait MutexExt<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
