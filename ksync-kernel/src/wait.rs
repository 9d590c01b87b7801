// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wait/notify engine.
//!
//! A waiting thread owns a [`WaitSet`] with one [`WaitBlock`] per object;
//! each object's FIFO waiter list holds [`WaitRef`]s back into that set.
//! Every transition below runs inside the kernel's exclusion region, and a
//! wait set is always fully unlinked before its thread is marked ready.

use ksync_common::{KernelError, KernelResult, ThreadId, Timeout};
use log::trace;

use crate::kernel::KernelState;
use crate::objects::{ObjectBody, ObjectId, WaitRef};
use crate::thread::{ThreadState, WaitBlock, WaitMode, WaitOutcome, WaitSet};
use crate::timer::{TimerAction, TimerId};

/// Normal outcome of a wait. Destruction of a waited-on object is reported
/// as [`KernelError::ObjectDestroyed`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The wait was satisfied; for ANY waits the index of the object that
    /// satisfied it, 0 otherwise.
    Satisfied(usize),
    TimedOut,
}

impl WaitStatus {
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Satisfied(_))
    }
}

impl KernelState {
    /// Start a wait by `tid` on `objects`.
    ///
    /// Returns `Some(status)` when the wait completed without blocking (fast
    /// path or poll), or `None` once the thread is linked and `Waiting`.
    pub(crate) fn begin_wait(
        &mut self,
        tid: ThreadId,
        objects: &[ObjectId],
        mode: WaitMode,
        timeout: Timeout,
    ) -> KernelResult<Option<WaitStatus>> {
        let thread = self
            .threads
            .get(&tid)
            .ok_or(KernelError::InvalidThread(tid))?;
        if matches!(
            thread.state,
            ThreadState::Waiting | ThreadState::Terminated | ThreadState::Initialized
        ) {
            return Err(KernelError::InvalidState);
        }
        if objects.iter().any(|id| self.objects.get(*id).is_none()) {
            return Err(KernelError::InvalidHandle);
        }

        if let Some(status) = self.try_acquire(tid, objects, mode) {
            trace!("thread {} wait satisfied immediately: {:?}", tid, status);
            return Ok(Some(status));
        }
        if timeout.is_poll() {
            return Ok(Some(WaitStatus::TimedOut));
        }

        let mut blocks = Vec::with_capacity(objects.len());
        for (key, &id) in objects.iter().enumerate() {
            let Some(obj) = self.objects.get_mut(id) else {
                continue;
            };
            // ALL waits take what is available now; the rest is acquired
            // object by object as it gets signaled.
            let taken = mode == WaitMode::All && obj.is_signaled_for(tid);
            if taken {
                obj.acquire(tid);
            } else {
                obj.waiters.push_back(WaitRef {
                    thread: tid,
                    slot: key,
                });
            }
            blocks.push(WaitBlock {
                object: id,
                key,
                linked: !taken,
                satisfied: taken,
            });
        }

        let timer = timeout.deadline(self.now).map(|deadline| {
            let id = self.timers.allocate(TimerAction::WakeWaiter(tid));
            self.timers.add(id, deadline);
            id
        });

        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.begin_wait(WaitSet {
                mode,
                blocks,
                timer,
            });
        }
        trace!(
            "thread {} waiting on {} object(s), mode {:?}, timeout {:?}",
            tid,
            objects.len(),
            mode,
            timeout
        );
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.thread_waiting(tid);
        }
        Ok(None)
    }

    /// Fast path: satisfy the wait from current object state, or do nothing.
    fn try_acquire(
        &mut self,
        tid: ThreadId,
        objects: &[ObjectId],
        mode: WaitMode,
    ) -> Option<WaitStatus> {
        match mode {
            WaitMode::Any => {
                let index = objects.iter().position(|id| {
                    self.objects
                        .get(*id)
                        .is_some_and(|o| o.is_signaled_for(tid))
                })?;
                self.objects.get_mut(objects[index])?.acquire(tid);
                Some(WaitStatus::Satisfied(index))
            }
            WaitMode::All => {
                if objects.is_empty() {
                    return None;
                }
                let ready = objects.iter().all(|id| {
                    self.objects
                        .get(*id)
                        .is_some_and(|o| o.is_signaled_for(tid))
                });
                if !ready {
                    return None;
                }
                for id in objects {
                    if let Some(obj) = self.objects.get_mut(*id) {
                        obj.acquire(tid);
                    }
                }
                Some(WaitStatus::Satisfied(0))
            }
        }
    }

    /// Collect the outcome of a finished wait and mark the thread running.
    pub(crate) fn finish_wait(&mut self, tid: ThreadId) -> KernelResult<WaitStatus> {
        let thread = self
            .threads
            .get_mut(&tid)
            .ok_or(KernelError::InvalidThread(tid))?;
        thread.state = ThreadState::Running;
        match thread.wait_result.take() {
            Some(WaitOutcome::Satisfied(index)) => Ok(WaitStatus::Satisfied(index)),
            Some(WaitOutcome::TimedOut) => Ok(WaitStatus::TimedOut),
            Some(WaitOutcome::Destroyed) => Err(KernelError::ObjectDestroyed),
            None => Err(KernelError::InvalidState),
        }
    }

    /// End the wait of `tid`: unlink every block from its object, drop the
    /// private timer, record `outcome`, and mark the thread ready.
    pub(crate) fn complete_wait(&mut self, tid: ThreadId, outcome: WaitOutcome) {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return;
        };
        if !thread.is_waiting() {
            return;
        }
        let set = thread.wake(outcome);
        let parker = thread.parker.clone();

        if let Some(set) = set {
            for block in set.blocks.iter().filter(|b| b.linked) {
                if let Some(obj) = self.objects.get_mut(block.object) {
                    obj.unlink_thread(tid);
                }
            }
            if let Some(timer) = set.timer {
                self.timers.release(timer);
            }
        }

        trace!("thread {} ready: {:?}", tid, outcome);
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.thread_ready(tid);
        }
        parker.notify_one();
    }

    /// Mode and key of the wait block `wr` names, if it is still linked to
    /// `object`.
    fn linked_block(&self, wr: WaitRef, object: ObjectId) -> Option<(WaitMode, usize)> {
        let set = self.threads.get(&wr.thread)?.wait.as_ref()?;
        let block = set.blocks.get(wr.slot)?;
        (block.linked && block.object == object).then_some((set.mode, block.key))
    }

    /// Release waiters of `object` in FIFO order for as long as the object
    /// stays signaled for the next eligible waiter. Each released waiter
    /// consumes the object according to its kind.
    pub(crate) fn wake_waiters(&mut self, object: ObjectId) {
        let snapshot: Vec<WaitRef> = match self.objects.get(object) {
            Some(obj) => obj.waiters.iter().copied().collect(),
            None => return,
        };

        for wr in snapshot {
            let Some((mode, key)) = self.linked_block(wr, object) else {
                continue;
            };
            let Some(obj) = self.objects.get_mut(object) else {
                return;
            };
            if !obj.is_signaled_for(wr.thread) {
                continue;
            }
            obj.acquire(wr.thread);
            trace!("object {:?} released thread {}", object, wr.thread);

            match mode {
                WaitMode::Any => self.complete_wait(wr.thread, WaitOutcome::Satisfied(key)),
                WaitMode::All => {
                    obj.waiters.retain(|w| *w != wr);
                    let done = self
                        .threads
                        .get_mut(&wr.thread)
                        .and_then(|t| t.wait.as_mut())
                        .map(|set| {
                            let block = &mut set.blocks[wr.slot];
                            block.linked = false;
                            block.satisfied = true;
                            set.all_satisfied()
                        })
                        .unwrap_or(false);
                    if done {
                        self.complete_wait(wr.thread, WaitOutcome::Satisfied(0));
                    }
                }
            }
        }
    }

    /// Wake every waiter of `object` with `ObjectDestroyed`.
    pub(crate) fn force_wake_all(&mut self, object: ObjectId) {
        let snapshot: Vec<WaitRef> = match self.objects.get(object) {
            Some(obj) => obj.waiters.iter().copied().collect(),
            None => return,
        };
        for wr in snapshot {
            self.complete_wait(wr.thread, WaitOutcome::Destroyed);
        }
    }

    /// Timeout of a private wait timer.
    pub(crate) fn expire_wait(&mut self, tid: ThreadId, timer: TimerId) {
        let armed = self
            .threads
            .get(&tid)
            .and_then(|t| t.wait.as_ref())
            .is_some_and(|set| set.timer == Some(timer));
        if armed {
            self.complete_wait(tid, WaitOutcome::TimedOut);
        }
    }

    /// Expiry of a waitable timer object: it stays signaled until re-armed.
    pub(crate) fn expire_timer_object(&mut self, object: ObjectId) {
        if let Some(obj) = self.objects.get_mut(object) {
            if let ObjectBody::Timer(t) = &mut obj.body {
                t.expired = true;
                self.wake_waiters(object);
            }
        }
    }
}
