// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kernel object model.
//!
//! Every waitable entity is a [`KObject`]: a common header (handle and pin
//! reference counts, FIFO waiter list) plus an [`ObjectBody`] carrying the
//! kind-specific state. Objects live in an [`ObjectArena`] and are addressed
//! by [`ObjectId`]; wait blocks refer to them by id, never by pointer.

use std::collections::VecDeque;

use ksync_common::{KernelError, KernelResult, ObjectKind, ThreadId};

use crate::timer::TimerId;

/// Index of an object in the [`ObjectArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference from an object's waiter list to one wait block of a waiting
/// thread: `slot` indexes the thread's wait set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRef {
    pub thread: ThreadId,
    pub slot: usize,
}

/// Kernel event: manual-reset or auto-reset signalable flag.
#[derive(Debug, Clone)]
pub struct KEvent {
    pub manual_reset: bool,
    pub signaled: bool,
}

impl KEvent {
    pub fn new(manual_reset: bool, initial_state: bool) -> Self {
        Self {
            manual_reset,
            signaled: initial_state,
        }
    }

    pub fn set(&mut self) {
        self.signaled = true;
    }

    pub fn reset(&mut self) {
        self.signaled = false;
    }
}

/// Counting semaphore; signaled while `count > 0`.
#[derive(Debug, Clone)]
pub struct KSemaphore {
    pub count: u32,
}

impl KSemaphore {
    pub fn new(initial_count: u32) -> Self {
        Self {
            count: initial_count,
        }
    }

    /// Add `count` units, returning the previous count.
    pub fn release(&mut self, count: u32) -> u32 {
        let prev = self.count;
        self.count = self.count.saturating_add(count);
        prev
    }

    /// Replace the count, returning the previous count.
    pub fn set(&mut self, count: u32) -> u32 {
        std::mem::replace(&mut self.count, count)
    }
}

/// Recursive, ownership-aware mutex.
///
/// `recursion > 0` implies `owner.is_some()`.
#[derive(Debug, Clone, Default)]
pub struct KMutex {
    pub owner: Option<ThreadId>,
    pub recursion: u32,
}

impl KMutex {
    pub fn new(owner: Option<ThreadId>) -> Self {
        Self {
            owner,
            recursion: u32::from(owner.is_some()),
        }
    }

    /// Drop one level of ownership held by `tid`.
    ///
    /// Returns `true` when the mutex became free.
    pub fn release(&mut self, tid: ThreadId) -> KernelResult<bool> {
        if self.owner != Some(tid) {
            return Err(KernelError::NotOwner);
        }
        self.recursion -= 1;
        if self.recursion == 0 {
            self.owner = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Waitable timer: signaled once its timer list entry has expired.
#[derive(Debug, Clone)]
pub struct KTimer {
    pub timer: TimerId,
    pub expired: bool,
}

/// Thread object: signaled once the thread has terminated.
#[derive(Debug, Clone)]
pub struct KThreadObject {
    pub tid: ThreadId,
    pub terminated: bool,
}

/// Kind-specific object state.
#[derive(Debug, Clone)]
pub enum ObjectBody {
    Thread(KThreadObject),
    Event(KEvent),
    Timer(KTimer),
    Mutex(KMutex),
    Semaphore(KSemaphore),
}

/// A kernel object: common header plus kind-specific body.
#[derive(Debug, Clone)]
pub struct KObject {
    pub body: ObjectBody,
    /// Open handles referring to this object.
    pub handle_refs: u32,
    /// Internal references keeping the object's storage alive after its
    /// last handle is closed (a live thread pins its own thread object).
    pub pins: u32,
    /// Set once `handle_refs` dropped to zero and the object was torn down.
    pub closed: bool,
    /// Wait blocks currently blocked on this object, in arrival order.
    pub waiters: VecDeque<WaitRef>,
}

impl KObject {
    pub fn new(body: ObjectBody) -> Self {
        Self {
            body,
            handle_refs: 0,
            pins: 0,
            closed: false,
            waiters: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self.body {
            ObjectBody::Thread(_) => ObjectKind::Thread,
            ObjectBody::Event(_) => ObjectKind::Event,
            ObjectBody::Timer(_) => ObjectKind::Timer,
            ObjectBody::Mutex(_) => ObjectKind::Mutex,
            ObjectBody::Semaphore(_) => ObjectKind::Semaphore,
        }
    }

    /// Generic signaled state, as reported to observers.
    pub fn is_signaled(&self) -> bool {
        match &self.body {
            ObjectBody::Thread(t) => t.terminated,
            ObjectBody::Event(e) => e.signaled,
            ObjectBody::Timer(t) => t.expired,
            ObjectBody::Mutex(m) => m.owner.is_none(),
            ObjectBody::Semaphore(s) => s.count > 0,
        }
    }

    /// Whether a wait by `tid` would be satisfied right now. A mutex is
    /// also available to its current owner (recursive acquire).
    pub fn is_signaled_for(&self, tid: ThreadId) -> bool {
        match &self.body {
            ObjectBody::Mutex(m) => m.owner.is_none() || m.owner == Some(tid),
            _ => self.is_signaled(),
        }
    }

    /// Consume one unit of signaled state on behalf of `tid`.
    ///
    /// Callers check [`is_signaled_for`](Self::is_signaled_for) first.
    pub fn acquire(&mut self, tid: ThreadId) {
        match &mut self.body {
            ObjectBody::Event(e) => {
                if !e.manual_reset {
                    e.signaled = false;
                }
            }
            ObjectBody::Semaphore(s) => {
                debug_assert!(s.count > 0);
                s.count = s.count.saturating_sub(1);
            }
            ObjectBody::Mutex(m) => {
                if m.owner == Some(tid) {
                    m.recursion += 1;
                } else {
                    m.owner = Some(tid);
                    m.recursion = 1;
                }
            }
            ObjectBody::Thread(_) | ObjectBody::Timer(_) => {}
        }
    }

    /// Remove every waiter reference belonging to `tid`.
    pub fn unlink_thread(&mut self, tid: ThreadId) {
        self.waiters.retain(|w| w.thread != tid);
    }

    /// Whether the arena slot may be reclaimed.
    pub fn is_reclaimable(&self) -> bool {
        self.closed && self.handle_refs == 0 && self.pins == 0 && self.waiters.is_empty()
    }
}

/// Arena of kernel objects with slot reuse.
#[derive(Debug, Default)]
pub struct ObjectArena {
    slots: Vec<Option<KObject>>,
    free: Vec<u32>,
    live: usize,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: KObject) -> ObjectId {
        self.insert_with(|_| object)
    }

    /// Insert an object whose construction needs its own id.
    pub fn insert_with(&mut self, build: impl FnOnce(ObjectId) -> KObject) -> ObjectId {
        let id = match self.free.last() {
            Some(&index) => ObjectId(index),
            None => ObjectId(self.slots.len() as u32),
        };
        let object = build(id);
        if id.index() < self.slots.len() {
            self.free.pop();
            self.slots[id.index()] = Some(object);
        } else {
            self.slots.push(Some(object));
        }
        self.live += 1;
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&KObject> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut KObject> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<KObject> {
        let object = self.slots.get_mut(id.index())?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        Some(object)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
