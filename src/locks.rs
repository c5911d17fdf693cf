// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Per-node locks
//!
//! [`NodeKeyLocks`] hands out one reentrant read/write lock per [`NodeKey`]. Locks are created
//! lazily the first time a key is locked and are never removed: they are cheap, and the set of
//! keys a loaded program uses only grows. To keep that growth bounded in a long-running service,
//! a registry belongs to a loaded program (see
//! [`ProgramTree::locks`](crate::ProgramTree::locks)) and goes away with it.
//!
//! Locking is advisory. Nothing stops a caller from mutating a node without holding its lock;
//! [`NodeKeyLocks::is_write_lock_held`] exists so that code can assert its preconditions.
//!
//! Acquisition blocks the calling thread and cannot be cancelled. The locks are reentrant: a thread
//! holding the write lock may take the write lock again, or read locks, without deadlocking itself,
//! and must release each acquisition. Upgrading a read lock to a write lock is not supported and
//! blocks until every reader (including the caller) is gone.
use crate::key::NodeKey;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, ThreadId},
};

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    readers: HashMap<ThreadId, usize>,
}

impl LockState {
    fn can_read(&self, me: ThreadId) -> bool {
        self.writer.is_none_or(|w| w == me)
    }

    fn can_write(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(w) => w == me,
            None => self.readers.is_empty(),
        }
    }
}

/// A reentrant read/write lock whose ownership is tracked per thread.
#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.can_read(me) {
            self.changed.wait(&mut state);
        }
        *state.readers.entry(me).or_insert(0) += 1;
    }

    /// # Panics
    ///
    /// If the calling thread holds no read lock.
    pub fn read_unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.readers.get_mut(&me) {
            Some(holds) if *holds > 1 => *holds -= 1,
            Some(_) => {
                state.readers.remove(&me);
                self.changed.notify_all();
            }
            None => panic!("read_unlock by a thread that holds no read lock"),
        }
    }

    pub fn write_lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.can_write(me) {
            self.changed.wait(&mut state);
        }
        state.writer = Some(me);
        state.write_holds += 1;
    }

    /// # Panics
    ///
    /// If the calling thread does not hold the write lock.
    pub fn write_unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(
            state.writer,
            Some(me),
            "write_unlock by a thread that does not hold the write lock"
        );
        state.write_holds -= 1;
        if state.write_holds == 0 {
            state.writer = None;
            self.changed.notify_all();
        }
    }

    /// Returns true iff the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Number of read acquisitions currently held, across all threads.
    pub fn read_holds(&self) -> usize {
        self.state.lock().readers.values().sum()
    }
}

/// Registry of per-key locks.
#[derive(Debug, Default)]
pub struct NodeKeyLocks {
    locks: Mutex<HashMap<NodeKey, Arc<ReentrantRwLock>, ahash::RandomState>>,
}

impl NodeKeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `key`, creating it if this is the first time `key` is seen.
    ///
    /// The registry mutex is only held for the lookup, never while waiting for the node lock.
    fn lock_for(&self, key: NodeKey) -> Arc<ReentrantRwLock> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key).or_insert_with(|| {
            tracing::trace!(?key, "creating node lock");
            Arc::default()
        }))
    }

    pub fn read_lock(&self, key: NodeKey) {
        tracing::trace!(?key, "read lock");
        self.lock_for(key).read_lock();
    }

    pub fn read_unlock(&self, key: NodeKey) {
        tracing::trace!(?key, "read unlock");
        self.lock_for(key).read_unlock();
    }

    pub fn write_lock(&self, key: NodeKey) {
        tracing::trace!(?key, "write lock");
        self.lock_for(key).write_lock();
    }

    pub fn write_unlock(&self, key: NodeKey) {
        tracing::trace!(?key, "write unlock");
        self.lock_for(key).write_unlock();
    }

    /// Returns true iff the calling thread holds the write lock for `key`. Never blocks on the
    /// node lock itself.
    pub fn is_write_lock_held(&self, key: NodeKey) -> bool {
        let lock = self.locks.lock().get(&key).cloned();
        lock.is_some_and(|l| l.is_write_locked_by_current_thread())
    }

    /// Acquires a read lock released when the guard drops.
    pub fn read(&self, key: NodeKey) -> ReadGuard {
        let lock = self.lock_for(key);
        lock.read_lock();
        ReadGuard { lock }
    }

    /// Acquires the write lock, released when the guard drops.
    pub fn write(&self, key: NodeKey) -> WriteGuard {
        let lock = self.lock_for(key);
        lock.write_lock();
        WriteGuard { lock }
    }

    /// Number of keys that have ever been locked.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases a read lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard {
    lock: Arc<ReentrantRwLock>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Releases a write lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    lock: Arc<ReentrantRwLock>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
