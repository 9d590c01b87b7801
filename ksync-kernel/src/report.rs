// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Handle table dump.

use std::fmt;

use ksync_common::{Handle, ObjectKind};

/// One live handle and the state of the object behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub handle: Handle,
    pub kind: ObjectKind,
    pub signaled: bool,
    pub protected: bool,
    pub handle_refs: u32,
    pub pins: u32,
    pub waiters: usize,
}

/// Snapshot of the handle table, in slot order.
#[derive(Debug, Clone, Default)]
pub struct HandleReport {
    pub entries: Vec<HandleInfo>,
}

impl HandleReport {
    /// Number of handles referring to objects of `kind`.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}

const KINDS: [ObjectKind; 5] = [
    ObjectKind::Thread,
    ObjectKind::Event,
    ObjectKind::Timer,
    ObjectKind::Mutex,
    ObjectKind::Semaphore,
];

impl fmt::Display for HandleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<10} {:<6} {:>3} {:>4} {:>4} {:>4} {:>4}",
            "HANDLE", "KIND", "SIG", "PROT", "REFS", "PINS", "WAIT"
        )?;
        for e in &self.entries {
            writeln!(
                f,
                "{:<10} {:<6} {:>3} {:>4} {:>4} {:>4} {:>4}",
                e.handle.to_string(),
                e.kind.name(),
                if e.signaled { "y" } else { "n" },
                if e.protected { "y" } else { "n" },
                e.handle_refs,
                e.pins,
                e.waiters
            )?;
        }
        write!(f, "{} handles:", self.entries.len())?;
        for kind in KINDS {
            write!(f, " {} {}", kind.name(), self.count(kind))?;
        }
        writeln!(f)
    }
}
