// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

/// Absolute time in timer ticks since the kernel core was created.
pub type Tick = u64;

/// Kernel thread ID.
pub type ThreadId = u64;

/// Number of bits of a handle value used for the slot index.
pub const HANDLE_INDEX_BITS: u32 = 16;

/// Mask selecting the slot part of a handle value.
pub const HANDLE_INDEX_MASK: u32 = (1 << HANDLE_INDEX_BITS) - 1;

/// Upper bound on handle table slots imposed by the handle encoding.
pub const MAX_HANDLE_SLOTS: usize = HANDLE_INDEX_MASK as usize;

/// Kernel object handle.
///
/// The low 16 bits hold `slot + 1`, the high 16 bits the slot generation.
/// Zero is never a valid handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl Handle {
    pub const INVALID: Self = Self(0);

    #[inline]
    pub const fn new(slot: usize, generation: u16) -> Self {
        Self(((generation as u32) << HANDLE_INDEX_BITS) | ((slot as u32 + 1) & HANDLE_INDEX_MASK))
    }

    /// Slot index in the handle table, or `None` for the invalid handle.
    #[inline]
    pub const fn slot(self) -> Option<usize> {
        let low = self.0 & HANDLE_INDEX_MASK;
        if low == 0 {
            None
        } else {
            Some(low as usize - 1)
        }
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        (self.0 >> HANDLE_INDEX_BITS) as u16
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & HANDLE_INDEX_MASK != 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(0x{:08X})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel object type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Thread,
    Event,
    Timer,
    Mutex,
    Semaphore,
}

impl ObjectKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Thread => "THREAD",
            Self::Event => "EVENT",
            Self::Timer => "TIMER",
            Self::Mutex => "MUTEX",
            Self::Semaphore => "SEM",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until signaled.
    Infinite,
    /// Block for at most this many ticks. Zero polls without blocking.
    Ticks(u64),
}

impl Timeout {
    /// Poll: never block.
    pub const POLL: Self = Self::Ticks(0);

    #[inline]
    pub const fn is_poll(self) -> bool {
        matches!(self, Self::Ticks(0))
    }

    /// Absolute deadline for a wait starting at `now`, `None` when infinite.
    #[inline]
    pub fn deadline(self, now: Tick) -> Option<Tick> {
        match self {
            Self::Infinite => None,
            Self::Ticks(n) => Some(now.saturating_add(n)),
        }
    }
}

/// Check whether tick `a` is at or before tick `b`.
#[inline]
pub const fn time_before_eq(a: Tick, b: Tick) -> bool {
    a <= b
}
