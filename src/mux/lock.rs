//! Lock wrappers enforcing the session-before-connection lock order.
//!
//! A thread may take the connection lock while holding a session lock, never
//! the reverse. Each [`ConnectionLock`] guard bumps a thread-local depth
//! counter; [`SessionLock::lock`] asserts the counter is zero in debug builds.
//!
//! Poisoned mutexes are recovered rather than propagated: state behind these
//! locks is only mutated through short, non-panicking critical sections.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

thread_local! {
    static CONNECTION_LOCK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether the current thread holds any connection lock.
pub fn connection_lock_held() -> bool {
    CONNECTION_LOCK_DEPTH.with(|depth| depth.get() > 0)
}

#[derive(Debug, Default)]
pub struct ConnectionLock<T> {
    inner: Mutex<T>,
}

impl<T> ConnectionLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> ConnectionGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        CONNECTION_LOCK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ConnectionGuard { guard }
    }
}

pub struct ConnectionGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for ConnectionGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ConnectionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ConnectionGuard<'_, T> {
    fn drop(&mut self) {
        CONNECTION_LOCK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[derive(Debug, Default)]
pub struct SessionLock<T> {
    inner: Mutex<T>,
}

impl<T> SessionLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        debug_assert!(
            !connection_lock_held(),
            "session lock acquired while holding the connection lock"
        );
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
