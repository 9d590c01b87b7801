// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Recursive critical section with an atomic fast path.
//!
//! `lock_count` is -1 while free and counts contenders beyond the owner
//! otherwise. Only contended enters and leaves go through the kernel, via
//! an auto-reset event whose FIFO waiter list gives first-come service.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ksync_common::{Handle, KernelError, KernelResult, ThreadId, Timeout};
use log::warn;

use crate::kernel::KernelCore;
use crate::thread::ThreadState;

const NO_OWNER: u64 = 0;

pub struct CriticalSection {
    kernel: Arc<KernelCore>,
    lock_count: AtomicI32,
    owner: AtomicU64,
    recursion: AtomicU32,
    event: Handle,
}

impl CriticalSection {
    pub fn new(kernel: Arc<KernelCore>) -> KernelResult<Self> {
        let event = kernel.create_event(false, false)?;
        Ok(Self {
            kernel,
            lock_count: AtomicI32::new(-1),
            owner: AtomicU64::new(NO_OWNER),
            recursion: AtomicU32::new(0),
            event,
        })
    }

    /// Enter, blocking while another thread holds the section.
    pub fn enter(&self, tid: ThreadId) -> KernelResult<()> {
        if self.owner.load(Ordering::Acquire) == tid {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        // A contender must be able to wait before it joins the count, or a
        // leave could signal the event for nobody.
        match self.kernel.thread_state(tid) {
            Some(ThreadState::Running) => {}
            Some(_) => return Err(KernelError::InvalidState),
            None => return Err(KernelError::InvalidThread(tid)),
        }
        if self.lock_count.fetch_add(1, Ordering::AcqRel) >= 0 {
            if let Err(e) = self.kernel.wait_one(tid, self.event, Timeout::Infinite) {
                self.lock_count.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        self.take(tid);
        Ok(())
    }

    /// Enter only if that needs no wait.
    pub fn try_enter(&self, tid: ThreadId) -> bool {
        if self.owner.load(Ordering::Acquire) == tid {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self
            .lock_count
            .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.take(tid);
        true
    }

    /// Leave one level. The last leave hands the section to the oldest
    /// blocked contender, if any.
    pub fn leave(&self, tid: ThreadId) -> KernelResult<()> {
        if self.owner.load(Ordering::Acquire) != tid {
            warn!("thread {} left a critical section it does not own", tid);
            return Err(KernelError::NotOwner);
        }
        if self.recursion.fetch_sub(1, Ordering::Relaxed) > 1 {
            return Ok(());
        }
        self.owner.store(NO_OWNER, Ordering::Release);
        // Pre-decrement value >= 1: someone else is in line.
        if self.lock_count.fetch_sub(1, Ordering::AcqRel) >= 1 {
            self.kernel.set_event(self.event)?;
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            tid => Some(tid),
        }
    }

    /// Nesting depth of the current owner, 0 when free.
    pub fn recursion(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }

    fn take(&self, tid: ThreadId) {
        self.recursion.store(1, Ordering::Relaxed);
        self.owner.store(tid, Ordering::Release);
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let _ = self.kernel.close_handle(self.event);
    }
}
