use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex that only guards short synchronous sections. A panic while holding one of
///  these locks leaves plain data behind, so poisoning is ignored.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
