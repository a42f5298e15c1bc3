// Copyright (c) Contributors to the redirfs project.
// SPDX-License-Identifier: Apache-2.0

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use thiserror::Error;

#[cfg(test)]
#[path = "./lock_test.rs"]
mod lock_test;

/// The kind of access requested from a [`ReentrantRwLock`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// What an acquisition actually holds, which is not always what was
/// requested: a read on a thread that already writes holds the write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Held {
    Shared,
    Exclusive,
}

/// A many-reader, single-writer lock that the owning thread may
/// acquire again, in the same or a weaker mode, without blocking.
///
/// Upgrading is not supported: a thread that holds only read access
/// and then asks for write access waits for itself forever.
#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_depth: usize,
    readers: HashMap<ThreadId, usize>,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // the state is never left inconsistent while the mutex is held
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the calling thread holds the lock in the given mode.
    ///
    /// Every call must be paired with one [`Self::release`] of the
    /// returned value, on the same thread.
    pub(crate) fn acquire(&self, mode: AccessMode) -> Held {
        let me = thread::current().id();
        let mut state = self.state();
        loop {
            if state.writer == Some(me) {
                state.write_depth += 1;
                return Held::Exclusive;
            }
            match mode {
                AccessMode::Read if state.writer.is_none() => {
                    *state.readers.entry(me).or_default() += 1;
                    return Held::Shared;
                }
                AccessMode::Write if state.writer.is_none() && state.readers.is_empty() => {
                    state.writer = Some(me);
                    state.write_depth = 1;
                    return Held::Exclusive;
                }
                _ => {}
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn release(&self, held: Held) {
        let me = thread::current().id();
        let mut state = self.state();
        let unlocked = match held {
            Held::Exclusive => {
                debug_assert_eq!(state.writer, Some(me), "released a write lock from another thread");
                state.write_depth = state.write_depth.saturating_sub(1);
                if state.write_depth == 0 {
                    state.writer = None;
                }
                state.writer.is_none()
            }
            Held::Shared => match state.readers.get_mut(&me) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    state.readers.remove(&me);
                    state.readers.is_empty()
                }
                None => {
                    debug_assert!(false, "released a read lock that this thread does not hold");
                    false
                }
            },
        };
        drop(state);
        if unlocked {
            self.released.notify_all();
        }
    }

    /// Acquire shared access for the lifetime of the returned guard
    pub fn read(&self) -> LockGuard<'_> {
        LockGuard::new(self, AccessMode::Read)
    }

    /// Acquire exclusive access for the lifetime of the returned guard
    pub fn write(&self) -> LockGuard<'_> {
        LockGuard::new(self, AccessMode::Write)
    }

    /// True if any thread currently holds write access
    pub fn is_write_locked(&self) -> bool {
        self.state().writer.is_some()
    }

    /// The number of threads currently holding read access
    pub fn reader_count(&self) -> usize {
        self.state().readers.len()
    }
}

/// Scoped ownership of a [`ReentrantRwLock`].
///
/// The guard must be dropped on the thread that created it.
#[must_use]
pub struct LockGuard<'a> {
    lock: &'a ReentrantRwLock,
    held: Held,
    _not_send: PhantomData<*const ()>,
}

impl<'a> LockGuard<'a> {
    fn new(lock: &'a ReentrantRwLock, mode: AccessMode) -> Self {
        let held = lock.acquire(mode);
        Self {
            lock,
            held,
            _not_send: PhantomData,
        }
    }

    /// True if this guard (or an outer one on this thread) holds write access
    pub fn is_exclusive(&self) -> bool {
        self.held == Held::Exclusive
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.held);
    }
}

/// A misuse of the guarded state that cannot be recovered from.
///
/// These are raised as panics, and so are caught and logged by the
/// call guard of any hook that causes one.
#[derive(Debug, Error)]
pub enum LockUsageError {
    #[error("{0} is already mutably borrowed on this thread")]
    AlreadyMutablyBorrowed(&'static str),
    #[error("{0} is already borrowed on this thread")]
    AlreadyBorrowed(&'static str),
}

const EXCLUSIVE: usize = usize::MAX;

/// A field of the hook context that can be borrowed by the holders
/// of the context lock.
///
/// The context lock decides which threads may touch the value at all;
/// this cell only tracks borrows, so that two guards held by the same
/// thread can never hand out a mutable and a shared reference together.
pub(crate) struct ScopedCell<T> {
    name: &'static str,
    borrows: AtomicUsize,
    value: UnsafeCell<T>,
}

// Safety: shared borrows from many threads need T: Sync, and a mutable
// borrow can move values in or out from any thread, which needs T: Send.
// The borrow counter is atomic, so concurrent borrows never race.
unsafe impl<T: Send + Sync> Sync for ScopedCell<T> {}

impl<T> ScopedCell<T> {
    pub(crate) fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            borrows: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Borrow the value, panicking if it is currently mutably borrowed
    pub(crate) fn borrow(&self) -> CellRef<'_, T> {
        let mut current = self.borrows.load(Ordering::Relaxed);
        loop {
            if current >= EXCLUSIVE - 1 {
                panic!("{}", LockUsageError::AlreadyMutablyBorrowed(self.name));
            }
            match self.borrows.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return CellRef { cell: self },
                Err(actual) => current = actual,
            }
        }
    }

    /// Mutably borrow the value, panicking if it is borrowed at all
    pub(crate) fn borrow_mut(&self) -> CellRefMut<'_, T> {
        if let Err(current) =
            self.borrows
                .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
        {
            if current == EXCLUSIVE {
                panic!("{}", LockUsageError::AlreadyMutablyBorrowed(self.name));
            }
            panic!("{}", LockUsageError::AlreadyBorrowed(self.name));
        }
        CellRefMut { cell: self }
    }
}

/// A shared borrow of a [`ScopedCell`]
pub struct CellRef<'a, T> {
    cell: &'a ScopedCell<T>,
}

impl<T> Deref for CellRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the borrow counter guarantees no mutable borrow exists
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> Drop for CellRef<'_, T> {
    fn drop(&mut self) {
        self.cell.borrows.fetch_sub(1, Ordering::Release);
    }
}

/// A mutable borrow of a [`ScopedCell`]
pub struct CellRefMut<'a, T> {
    cell: &'a ScopedCell<T>,
}

impl<T> Deref for CellRefMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the borrow counter guarantees this is the only borrow
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for CellRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the borrow counter guarantees this is the only borrow
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for CellRefMut<'_, T> {
    fn drop(&mut self) {
        self.cell.borrows.store(0, Ordering::Release);
    }
}
