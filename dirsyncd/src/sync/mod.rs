use std::sync::{Mutex, MutexGuard};

pub mod agent;
pub mod hasher;
pub mod local_watcher;
pub mod paths;
pub mod queue;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
