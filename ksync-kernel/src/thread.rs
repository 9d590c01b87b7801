// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use ksync_common::ThreadId;
use parking_lot::Condvar;

use crate::objects::ObjectId;
use crate::timer::TimerId;

/// Thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is created but not yet started.
    Initialized,
    /// Thread's wait has ended; it resumes once it is not suspended.
    Ready,
    /// Thread is executing.
    Running,
    /// Thread is blocked in a wait.
    Waiting,
    /// Thread has exited.
    Terminated,
}

/// Multi-object wait discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Wake once every object has been acquired.
    All,
    /// Wake on the first object that signals.
    Any,
}

/// How a wait ended, as recorded by whoever woke the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied(usize),
    TimedOut,
    Destroyed,
}

/// One thread-to-object link for the duration of a wait.
#[derive(Debug, Clone)]
pub struct WaitBlock {
    pub object: ObjectId,
    /// Position of the object in the caller's list.
    pub key: usize,
    /// Still present in the object's waiter list.
    pub linked: bool,
    /// Object already acquired (ALL waits).
    pub satisfied: bool,
}

/// The wait blocks of one wait call plus its private timeout timer.
#[derive(Debug, Clone)]
pub struct WaitSet {
    pub mode: WaitMode,
    pub blocks: Vec<WaitBlock>,
    pub timer: Option<TimerId>,
}

impl WaitSet {
    pub fn all_satisfied(&self) -> bool {
        self.blocks.iter().all(|b| b.satisfied)
    }
}

/// Kernel thread as seen by the object core.
pub struct KThread {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    /// Independent of the wait state: a suspended thread whose wait ended
    /// stays parked until the count returns to zero.
    pub suspend_count: u32,
    /// The thread's own waitable object.
    pub object: ObjectId,
    /// Outstanding wait, present only while `Waiting`.
    pub wait: Option<WaitSet>,
    pub wait_result: Option<WaitOutcome>,
    pub exit_code: Option<i32>,
    /// Thread-local storage values, indexed by TLS slot.
    pub tls: Vec<usize>,
    /// Parks the host thread driving this kernel thread.
    pub parker: Arc<Condvar>,
}

impl KThread {
    pub fn new(id: ThreadId, name: String, object: ObjectId, tls_slots: usize) -> Self {
        Self {
            id,
            name,
            state: ThreadState::Initialized,
            suspend_count: 0,
            object,
            wait: None,
            wait_result: None,
            exit_code: None,
            tls: vec![0; tls_slots],
            parker: Arc::new(Condvar::new()),
        }
    }

    pub fn start(&mut self) {
        self.state = ThreadState::Running;
    }

    /// Enter the waiting state with the given wait set.
    pub fn begin_wait(&mut self, set: WaitSet) {
        self.state = ThreadState::Waiting;
        self.wait = Some(set);
        self.wait_result = None;
    }

    /// End the wait with `outcome` and mark the thread ready.
    pub fn wake(&mut self, outcome: WaitOutcome) -> Option<WaitSet> {
        self.state = ThreadState::Ready;
        self.wait_result = Some(outcome);
        self.wait.take()
    }

    /// Whether the parked host thread may continue.
    pub fn may_resume(&self) -> bool {
        self.state != ThreadState::Waiting && self.suspend_count == 0
    }

    pub fn is_waiting(&self) -> bool {
        self.state == ThreadState::Waiting
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ThreadState::Terminated
    }
}

impl std::fmt::Debug for KThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("suspend_count", &self.suspend_count)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}
