//! Re-entrant runtime locks and post-unlock work.
//!
//! The property tree lock and every execution-context lock are
//! [`ReentrantLock`]s. A thread may take a lock it already holds, which is
//! what lets a subscriber callback mutate the tree it was notified from, or
//! a resource destructor call back into the context being unloaded.
//!
//! Work that must not run while the current thread holds any runtime lock
//! is queued with [`defer`]. It runs on the same thread, in queue order, as
//! soon as that thread releases its last runtime lock.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

type Deferred = Box<dyn FnOnce()>;

thread_local! {
    /// Number of runtime lock acquisitions (nested ones included) held by this thread.
    static HELD: Cell<usize> = const { Cell::new(0) };
    static DEFERRED: RefCell<Vec<Deferred>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// A mutual-exclusion lock that the owning thread may re-acquire.
#[derive(Debug)]
pub struct ReentrantLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            owner: Mutex::new(Owner {
                thread: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until the lock is free or already owned by this thread.
    pub fn lock(&self) -> ReentrantGuard<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    break;
                }
                Some(holder) if holder == me => {
                    owner.depth += 1;
                    break;
                }
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        drop(owner);
        self.acquired()
    }

    /// Take the lock only if no other thread owns it.
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_>> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match owner.thread {
            None => {
                owner.thread = Some(me);
                owner.depth = 1;
            }
            Some(holder) if holder == me => owner.depth += 1,
            Some(_) => return None,
        }
        drop(owner);
        Some(self.acquired())
    }

    /// Whether the calling thread currently owns this lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        owner.thread == Some(thread::current().id())
    }

    fn acquired(&self) -> ReentrantGuard<'_> {
        HELD.with(|held| held.set(held.get() + 1));
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn unlock(&self) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
    }
}

/// Holds a [`ReentrantLock`] until dropped. Must be dropped on the thread
/// that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for ReentrantGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantGuard").finish_non_exhaustive()
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
        let last = HELD.with(|held| {
            let remaining = held.get() - 1;
            held.set(remaining);
            remaining == 0
        });
        if last {
            run_deferred();
        }
    }
}

/// Whether the calling thread holds any runtime lock.
pub fn holds_runtime_lock() -> bool {
    HELD.with(|held| held.get() > 0)
}

/// Run `work` once the calling thread holds no runtime lock.
///
/// Runs immediately when no lock is held.
pub fn defer(work: impl FnOnce() + 'static) {
    if holds_runtime_lock() {
        DEFERRED.with(|queue| queue.borrow_mut().push(Box::new(work)));
    } else {
        work();
    }
}

fn run_deferred() {
    loop {
        let batch = DEFERRED.with(|queue| std::mem::take(&mut *queue.borrow_mut()));
        if batch.is_empty() {
            return;
        }
        for work in batch {
            work();
        }
    }
}
