// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded FIFO message queue built on two kernel semaphores.
//!
//! `spaces` counts free slots and `items` filled ones. The ring itself sits
//! behind its own lock, so any number of producers and consumers may share
//! a queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use ksync_common::{Handle, KernelError, KernelResult, ThreadId, Timeout};
use parking_lot::Mutex;
use thiserror::Error;

use crate::kernel::KernelCore;
use crate::wait::WaitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue wait timed out")]
    Timeout,
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Failed enqueue; hands the message back to the caller.
pub struct EnqueueError<T> {
    pub error: QueueError,
    pub item: T,
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enqueue failed: {}", self.error)
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

pub struct MessageQueue<T> {
    kernel: Arc<KernelCore>,
    spaces: Handle,
    items: Handle,
    ring: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> MessageQueue<T> {
    pub fn new(kernel: Arc<KernelCore>, capacity: usize) -> KernelResult<Self> {
        let slots = u32::try_from(capacity).map_err(|_| KernelError::InvalidArgument)?;
        if slots == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let spaces = kernel.create_semaphore(slots)?;
        let items = match kernel.create_semaphore(0) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = kernel.close_handle(spaces);
                return Err(e);
            }
        };
        Ok(Self {
            kernel,
            spaces,
            items,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    /// Append `item`, waiting up to `timeout` for a free slot.
    pub fn enqueue(&self, tid: ThreadId, item: T, timeout: Timeout) -> Result<(), EnqueueError<T>> {
        let error = match self.kernel.wait_one(tid, self.spaces, timeout) {
            Ok(WaitStatus::Satisfied(_)) => None,
            Ok(WaitStatus::TimedOut) => Some(QueueError::Timeout),
            Err(e) => Some(QueueError::Kernel(e)),
        };
        if let Some(error) = error {
            return Err(EnqueueError { error, item });
        }

        // A consumer released by `items` takes the ring lock next, so it
        // only ever sees the ring after the push.
        let mut ring = self.ring.lock();
        if let Err(e) = self.kernel.release_semaphore(self.items, 1) {
            return Err(EnqueueError {
                error: e.into(),
                item,
            });
        }
        ring.push_back(item);
        Ok(())
    }

    /// Remove the oldest message, waiting up to `timeout` for one.
    pub fn dequeue(&self, tid: ThreadId, timeout: Timeout) -> Result<T, QueueError> {
        match self.kernel.wait_one(tid, self.items, timeout)? {
            WaitStatus::Satisfied(_) => {}
            WaitStatus::TimedOut => return Err(QueueError::Timeout),
        }
        let item = self
            .ring
            .lock()
            .pop_front()
            .ok_or(KernelError::InvalidState)?;
        self.kernel.release_semaphore(self.spaces, 1)?;
        Ok(item)
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for MessageQueue<T> {
    fn drop(&mut self) {
        let _ = self.kernel.close_handle(self.spaces);
        let _ = self.kernel.close_handle(self.items);
    }
}
