//! Synchronization primitives used across the crate.
//!
//! With the `portable-atomic` feature every atomic is routed through
//! `portable-atomic`, which lets targets without native CAS (e.g. some
//! RISC-V and Cortex-M0 parts) build the crate on top of a critical section.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(feature = "portable-atomic")]
pub(crate) use portable_atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

#[cfg(not(feature = "portable-atomic"))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// Lock a mutex, ignoring poisoning. A user callback that panicked while a
/// guard was held must not wedge the delivery or timer threads.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
