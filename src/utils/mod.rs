// Utility functions

use chrono::Utc;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Wait on a condition variable with a timeout, recovering from poisoning.
///
/// Returns the guard and whether the wait timed out.
pub fn wait_timeout_recover<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, bool) {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, result)) => (guard, result.timed_out()),
        Err(poisoned) => {
            log::warn!("Mutex was poisoned while waiting, recovering");
            let (guard, result) = poisoned.into_inner();
            (guard, result.timed_out())
        }
    }
}

/// Wait on a condition variable without a timeout, recovering from poisoning.
pub fn wait_recover<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match condvar.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned while waiting, recovering");
            poisoned.into_inner()
        }
    }
}

/// Generate a unique ID using timestamp and random string.
pub fn generate_id() -> String {
    let now = Utc::now().timestamp_millis();
    format!("{}-{}", now, rand_string(8))
}

/// Generate a random alphanumeric string of specified length.
fn rand_string(len: usize) -> String {
    use rand::Rng;
    use std::iter;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    iter::repeat_with(|| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .take(len)
        .collect()
}
