// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Expiry-ordered timer list.
//!
//! Entries live in an arena and are chained into a doubly linked list by
//! index, sorted by expiry tick (ties keep arming order). A timer is in the
//! list if and only if it is active, so the tick handler only ever looks at
//! the head. Insertion is a linear scan from the tail, which is cheap for
//! the short lists a kernel of this size runs.

use std::fmt;
use std::sync::Arc;

use ksync_common::{time_before_eq, ThreadId, Tick};

use crate::objects::ObjectId;

/// Timer expiry callback. Runs outside the kernel's exclusion region.
pub type TimerCallback = Arc<dyn Fn(Tick) + Send + Sync>;

/// Stable reference to a timer list entry. Stale ids (entry released and
/// reused) are rejected through the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

/// What happens when a timer expires.
#[derive(Clone)]
pub enum TimerAction {
    /// Time out the wait of this thread.
    WakeWaiter(ThreadId),
    /// Signal a waitable timer object.
    SignalObject(ObjectId),
    /// Run a registered callback.
    Callback(TimerCallback),
}

impl fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WakeWaiter(tid) => f.debug_tuple("WakeWaiter").field(tid).finish(),
            Self::SignalObject(id) => f.debug_tuple("SignalObject").field(id).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

#[derive(Debug)]
struct TimerEntry {
    generation: u32,
    expires: Tick,
    active: bool,
    prev: Option<u32>,
    next: Option<u32>,
    /// `None` while the slot is free.
    action: Option<TimerAction>,
}

/// The kernel's single sorted list of active timers.
#[derive(Debug, Default)]
pub struct TimerList {
    entries: Vec<TimerEntry>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    active: usize,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an inactive timer with the given expiry action.
    pub fn allocate(&mut self, action: TimerAction) -> TimerId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.action = Some(action);
            entry.expires = 0;
            TimerId {
                index,
                generation: entry.generation,
            }
        } else {
            self.entries.push(TimerEntry {
                generation: 0,
                expires: 0,
                active: false,
                prev: None,
                next: None,
                action: Some(action),
            });
            TimerId {
                index: (self.entries.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// Arm the timer to expire at `expires`, re-inserting it if it is
    /// already active. Returns `false` for a stale id.
    pub fn add(&mut self, id: TimerId, expires: Tick) -> bool {
        if !self.is_valid(id) {
            return false;
        }
        if self.entries[id.index as usize].active {
            self.unlink(id.index);
        }
        self.entries[id.index as usize].expires = expires;
        self.insert(id.index);
        true
    }

    /// Move an active timer to a new expiry. No-op on an inactive timer.
    pub fn modify(&mut self, id: TimerId, expires: Tick) -> bool {
        if !self.is_active(id) {
            return false;
        }
        self.unlink(id.index);
        self.entries[id.index as usize].expires = expires;
        self.insert(id.index);
        true
    }

    /// Deactivate a timer. Idempotent; returns whether it was active.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if !self.is_active(id) {
            return false;
        }
        self.unlink(id.index);
        true
    }

    /// Cancel the timer and free its entry.
    pub fn release(&mut self, id: TimerId) {
        if !self.is_valid(id) {
            return;
        }
        self.cancel(id);
        let entry = &mut self.entries[id.index as usize];
        entry.action = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    /// Pop every timer whose expiry is at or before `now`, in expiry order.
    /// Each popped timer is inactive afterwards and fires exactly once.
    pub fn tick(&mut self, now: Tick) -> Vec<(TimerId, TimerAction)> {
        let mut fired = Vec::new();
        while let Some(index) = self.head {
            let entry = &self.entries[index as usize];
            if !time_before_eq(entry.expires, now) {
                break;
            }
            let id = TimerId {
                index,
                generation: entry.generation,
            };
            self.unlink(index);
            if let Some(action) = self.entries[index as usize].action.clone() {
                fired.push((id, action));
            }
        }
        fired
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.is_valid(id) && self.entries[id.index as usize].active
    }

    /// Expiry of the list head, i.e. the next tick at which anything fires.
    pub fn next_expiry(&self) -> Option<Tick> {
        self.head.map(|i| self.entries[i as usize].expires)
    }

    /// Number of active timers.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    fn is_valid(&self, id: TimerId) -> bool {
        self.entries
            .get(id.index as usize)
            .is_some_and(|e| e.generation == id.generation && e.action.is_some())
    }

    fn insert(&mut self, index: u32) {
        let expires = self.entries[index as usize].expires;

        // Find the last entry that expires at or before us, scanning from the
        // tail since new deadlines are usually the latest ones.
        let mut after = self.tail;
        while let Some(i) = after {
            if time_before_eq(self.entries[i as usize].expires, expires) {
                break;
            }
            after = self.entries[i as usize].prev;
        }

        let next = match after {
            Some(i) => self.entries[i as usize].next,
            None => self.head,
        };

        {
            let entry = &mut self.entries[index as usize];
            entry.prev = after;
            entry.next = next;
            entry.active = true;
        }
        match after {
            Some(i) => self.entries[i as usize].next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(i) => self.entries[i as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.active += 1;
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.active);
            entry.active = false;
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => self.entries[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.active -= 1;
    }
}
