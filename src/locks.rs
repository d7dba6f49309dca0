// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! A panic inside one transfer callback must not take the whole manager down
//! with it. When a lock is poisoned we log the event and keep going with the
//! data as the panicking thread left it; for the task table that is at worst
//! one stale record, which the next persisted mutation overwrites.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "offline_vault::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition. Recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "offline_vault::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition. Recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Lock a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "offline_vault::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}
