// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative mutexes and condition variables for simulated threads. These
//! structures are pure bookkeeping: acquiring a contended mutex or waiting
//! on a condition blocks the simulated thread through the glue layer, never
//! an OS thread.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::thread::ThreadId,
};
use ::std::{
    collections::VecDeque,
    fmt,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to a mutex in the partition's registry. Slots are reused after a
/// destroy, so a stale handle may name a younger mutex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MutexId(usize);

/// Handle to a condition variable in the partition's registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConditionId(usize);

/// A mutex among simulated threads. Ownership passes directly from the
/// releasing thread to the first waiter, so a woken waiter holds the lock
/// without re-checking.
pub struct SimMutex {
    owner: Option<ThreadId>,
    waiters: VecDeque<ThreadId>,
}

/// A condition variable among simulated threads.
pub struct SimCondition {
    waiters: VecDeque<ThreadId>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SimMutex {
    pub fn new() -> Self {
        Self {
            owner: None,
            waiters: VecDeque::new(),
        }
    }

    /// Acquires the mutex if it is free. Returns false when `thread` must
    /// queue and block instead.
    pub fn try_acquire(&mut self, thread: ThreadId) -> bool {
        match self.owner {
            None => {
                self.owner = Some(thread);
                true
            },
            Some(_) => false,
        }
    }

    pub fn enqueue_waiter(&mut self, thread: ThreadId) {
        self.waiters.push_back(thread);
    }

    /// Releases the mutex held by `thread`, handing ownership to the first
    /// waiter. The returned thread already owns the mutex and only needs to
    /// be woken.
    pub fn release(&mut self, thread: ThreadId) -> Result<Option<ThreadId>, Fail> {
        if self.owner != Some(thread) {
            let cause: String = format!("thread {} released a mutex it does not hold", thread);
            error!("release(): {}", cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        self.owner = self.waiters.pop_front();
        Ok(self.owner)
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn holder(&self) -> Option<ThreadId> {
        self.owner
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

impl SimCondition {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub fn enqueue_waiter(&mut self, thread: ThreadId) {
        self.waiters.push_back(thread);
    }

    /// Picks the longest-waiting thread to wake, if any.
    pub fn signal(&mut self) -> Option<ThreadId> {
        self.waiters.pop_front()
    }

    /// Removes and returns every waiter, in arrival order.
    pub fn broadcast(&mut self) -> Vec<ThreadId> {
        self.waiters.drain(..).collect()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SimMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for SimCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl From<usize> for MutexId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl From<MutexId> for usize {
    fn from(id: MutexId) -> Self {
        id.0
    }
}

impl From<usize> for ConditionId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl From<ConditionId> for usize {
    fn from(id: ConditionId) -> Self {
        id.0
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
