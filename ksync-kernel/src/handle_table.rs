// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;

use bitflags::bitflags;
use ksync_common::{Handle, KernelError, KernelResult, ObjectKind, MAX_HANDLE_SLOTS};

use crate::objects::ObjectId;

bitflags! {
    /// Per-handle attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandleFlags: u8 {
        /// Handle cannot be closed until unprotected.
        const PROTECTED = 1;
    }
}

/// What a live handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    pub object: ObjectId,
    pub kind: ObjectKind,
    pub flags: HandleFlags,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u16,
    entry: Option<HandleEntry>,
}

/// Handle table: maps Handle -> object.
///
/// Freed slots are reused oldest-first and their generation is bumped, so
/// a closed handle value does not name a different object later on.
pub struct HandleTable {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    capacity: usize,
    used: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            capacity: capacity.min(MAX_HANDLE_SLOTS),
            used: 0,
        }
    }

    /// Add an object and return its handle.
    pub fn add(&mut self, object: ObjectId, kind: ObjectKind) -> KernelResult<Handle> {
        let slot = match self.free.pop_front() {
            Some(slot) => slot,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
            None => return Err(KernelError::OutOfHandles),
        };

        let entry = &mut self.slots[slot];
        entry.entry = Some(HandleEntry {
            object,
            kind,
            flags: HandleFlags::empty(),
        });
        self.used += 1;
        Ok(Handle::new(slot, entry.generation))
    }

    /// Look up a handle.
    pub fn get(&self, handle: Handle) -> KernelResult<&HandleEntry> {
        let slot = handle.slot().ok_or(KernelError::InvalidHandle)?;
        self.slots
            .get(slot)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.entry.as_ref())
            .ok_or(KernelError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: Handle) -> KernelResult<&mut HandleEntry> {
        let slot = handle.slot().ok_or(KernelError::InvalidHandle)?;
        self.slots
            .get_mut(slot)
            .filter(|s| s.generation == handle.generation())
            .and_then(|s| s.entry.as_mut())
            .ok_or(KernelError::InvalidHandle)
    }

    /// Type-checked lookup. Reference counts are left alone.
    pub fn lock(&self, handle: Handle, expected: ObjectKind) -> KernelResult<ObjectId> {
        let entry = self.get(handle)?;
        if entry.kind != expected {
            return Err(KernelError::WrongType {
                expected,
                found: entry.kind,
            });
        }
        Ok(entry.object)
    }

    /// Remove a handle, returning what it referred to.
    pub fn close(&mut self, handle: Handle) -> KernelResult<HandleEntry> {
        let entry = *self.get(handle)?;
        if entry.flags.contains(HandleFlags::PROTECTED) {
            return Err(KernelError::AccessDenied);
        }

        let slot = handle.slot().ok_or(KernelError::InvalidHandle)?;
        let s = &mut self.slots[slot];
        s.entry = None;
        s.generation = s.generation.wrapping_add(1);
        self.free.push_back(slot);
        self.used -= 1;
        Ok(entry)
    }

    /// Set or clear the protection flag.
    pub fn set_protected(&mut self, handle: Handle, protected: bool) -> KernelResult<()> {
        let entry = self.get_mut(handle)?;
        entry.flags.set(HandleFlags::PROTECTED, protected);
        Ok(())
    }

    /// Live handles in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &HandleEntry)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.entry
                .as_ref()
                .map(|entry| (Handle::new(i, s.generation), entry))
        })
    }

    /// Number of active handles.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
