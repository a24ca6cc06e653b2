// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer-preferring reader/writer lock.
//!
//! Any number of readers may hold the lock together. As soon as a writer
//! starts waiting, new readers queue behind it; readers already inside drain
//! first, then the writer runs alone. The lock is not reentrant: taking it
//! twice from the same operation deadlocks.
//!
//! Built on `parking_lot::{Mutex, Condvar}` the same way the wake notifier
//! in the engine is, with the bookkeeping kept under one small mutex.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer_active: bool,
    writers_waiting: usize,
}

/// Multi-reader/single-writer lock that gives waiting writers priority.
pub struct SharedLock<T> {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through the guards below. A read guard
// exists only while no writer is active, and a write guard only while no
// reader or other writer holds the lock; `state` serialises those checks.
unsafe impl<T: Send> Send for SharedLock<T> {}
unsafe impl<T: Send + Sync> Sync for SharedLock<T> {}

impl<T> SharedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire shared access, waiting behind any active or queued writer.
    pub fn read(&self) -> SharedReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.writer_active || state.writers_waiting > 0 {
            self.readers_cv.wait(&mut state);
        }
        state.readers += 1;
        SharedReadGuard { lock: self }
    }

    /// Shared access without blocking; fails while a writer is active or waiting.
    pub fn try_read(&self) -> Option<SharedReadGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.writer_active || state.writers_waiting > 0 {
            return None;
        }
        state.readers += 1;
        Some(SharedReadGuard { lock: self })
    }

    /// Acquire exclusive access.
    pub fn write(&self) -> SharedWriteGuard<'_, T> {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer_active || state.readers > 0 {
            self.writers_cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer_active = true;
        SharedWriteGuard { lock: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Number of writers currently queued.
    pub fn waiting_writers(&self) -> usize {
        self.state.lock().writers_waiting
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 && state.writers_waiting > 0 {
            self.writers_cv.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer_active = false;
        if state.writers_waiting > 0 {
            self.writers_cv.notify_one();
        }
        self.readers_cv.notify_all();
    }
}

impl<T: Default> Default for SharedLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SharedLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedLock")
            .field("readers", &state.readers)
            .field("writer_active", &state.writer_active)
            .field("writers_waiting", &state.writers_waiting)
            .finish_non_exhaustive()
    }
}

/// Shared access; released on drop.
pub struct SharedReadGuard<'a, T> {
    lock: &'a SharedLock<T>,
}

impl<T> Deref for SharedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers > 0 and no writer is active while this guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for SharedReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access; released on drop.
pub struct SharedWriteGuard<'a, T> {
    lock: &'a SharedLock<T>,
}

impl<T> Deref for SharedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the only holder of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SharedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the only holder of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SharedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
