use std::sync::{Mutex, MutexGuard, PoisonError};

/// checks that two things are the same and returns false if not
#[macro_export]
macro_rules! same {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return false;
        }
    };
}

/// Lock a mutex even if a panicking thread poisoned it
///
/// None of our guarded state can be left half updated so a poisoned lock is still usable.
///
/// # Arguments
///
/// * `mutex` - The mutex to lock
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parse a run id from a node or pod label
///
/// # Arguments
///
/// * `raw` - The raw run id to parse
pub fn parse_run_id(raw: &str) -> Result<u64, crate::Error> {
    raw.trim().parse::<u64>().map_err(|err| {
        crate::Error::new(format!("Failed to parse run id {raw}: {err}"))
    })
}
