//! Lock poisoning recovery for the in-process cache
//!
//! Cache contents are disposable: credentials are re-read from the store and
//! counters only bound bursts. A poisoned guard is recovered and logged.

use std::sync::{Mutex, MutexGuard};
use tracing::error;

/// Acquire a Mutex lock, recovering from poisoning if necessary.
///
/// # Arguments
/// * `mutex` - The Mutex to lock
/// * `context` - A description of what the lock protects (for logging)
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "Mutex poisoned for '{}' - recovering with potentially stale data",
                context
            );
            poisoned.into_inner()
        }
    }
}
