// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use ksync_common::{
    time_before_eq, Handle, KernelConfig, KernelError, KernelResult, ObjectKind, ThreadId, Tick,
    Timeout,
};
use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::handle_table::{HandleFlags, HandleTable};
use crate::objects::{
    KEvent, KMutex, KObject, KSemaphore, KThreadObject, KTimer, ObjectArena, ObjectBody, ObjectId,
};
use crate::report::{HandleInfo, HandleReport};
use crate::scheduler::Dispatcher;
use crate::thread::{KThread, ThreadState, WaitMode};
use crate::timer::{TimerAction, TimerCallback, TimerId, TimerList};
use crate::tls::TlsAllocator;
use crate::wait::WaitStatus;

/// Everything guarded by the kernel lock.
pub(crate) struct KernelState {
    pub(crate) now: Tick,
    pub(crate) objects: ObjectArena,
    pub(crate) handles: HandleTable,
    pub(crate) threads: HashMap<ThreadId, KThread>,
    pub(crate) timers: TimerList,
    pub(crate) tls: TlsAllocator,
    pub(crate) dispatcher: Option<Arc<dyn Dispatcher>>,
    next_tid: ThreadId,
}

macro_rules! body_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        fn $name(&mut self, handle: Handle) -> KernelResult<(ObjectId, &mut $ty)> {
            let id = self.handles.lock(handle, ObjectKind::$variant)?;
            match &mut self.object_mut(id)?.body {
                ObjectBody::$variant(body) => Ok((id, body)),
                _ => Err(KernelError::InvalidState),
            }
        }
    };
}

impl KernelState {
    fn new(config: &KernelConfig, dispatcher: Option<Arc<dyn Dispatcher>>) -> Self {
        Self {
            now: 0,
            objects: ObjectArena::new(),
            handles: HandleTable::new(config.max_handles),
            threads: HashMap::new(),
            timers: TimerList::new(),
            tls: TlsAllocator::new(config.max_tls_slots),
            dispatcher,
            next_tid: 1,
        }
    }

    fn object_mut(&mut self, id: ObjectId) -> KernelResult<&mut KObject> {
        self.objects.get_mut(id).ok_or(KernelError::InvalidHandle)
    }

    fn thread_mut(&mut self, tid: ThreadId) -> KernelResult<&mut KThread> {
        self.threads
            .get_mut(&tid)
            .ok_or(KernelError::InvalidThread(tid))
    }

    body_accessor!(event_mut, Event, KEvent);
    body_accessor!(semaphore_mut, Semaphore, KSemaphore);
    body_accessor!(mutex_mut, Mutex, KMutex);
    body_accessor!(timer_object_mut, Timer, KTimer);

    /// Insert `object` and open the first handle to it.
    fn create_object(&mut self, object: KObject) -> KernelResult<(ObjectId, Handle)> {
        let kind = object.kind();
        let id = self.objects.insert(object);
        let handle = self.attach_handle(id, kind)?;
        Ok((id, handle))
    }

    /// Open the first handle to a freshly inserted object, discarding the
    /// object if the table is full.
    fn attach_handle(&mut self, id: ObjectId, kind: ObjectKind) -> KernelResult<Handle> {
        match self.handles.add(id, kind) {
            Ok(handle) => {
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.handle_refs = 1;
                }
                debug!("created {} object, handle {}", kind, handle);
                Ok(handle)
            }
            Err(e) => {
                if let Some(obj) = self.objects.remove(id) {
                    if let ObjectBody::Timer(t) = obj.body {
                        self.timers.release(t.timer);
                    }
                }
                warn!("cannot create {} object: {}", kind, e);
                Err(e)
            }
        }
    }

    /// Drop one handle reference; the last one finalizes the object.
    fn drop_handle_ref(&mut self, id: ObjectId) -> KernelResult<()> {
        let obj = self.object_mut(id)?;
        if obj.handle_refs == 0 {
            warn!("closing object {:?} with no open handles", id);
            return Err(KernelError::InvalidHandle);
        }
        obj.handle_refs -= 1;
        if obj.handle_refs > 0 {
            return Ok(());
        }

        obj.closed = true;
        let kind = obj.kind();
        let timer = match &obj.body {
            ObjectBody::Timer(t) => Some(t.timer),
            _ => None,
        };
        debug!("finalizing {} object {:?}", kind, id);

        self.force_wake_all(id);
        if let Some(timer) = timer {
            self.timers.release(timer);
        }
        self.reclaim(id);
        Ok(())
    }

    /// Free the arena slot once nothing refers to the object any more. A
    /// reclaimed thread object takes its thread record with it.
    pub(crate) fn reclaim(&mut self, id: ObjectId) {
        if !self.objects.get(id).is_some_and(KObject::is_reclaimable) {
            return;
        }
        if let Some(obj) = self.objects.remove(id) {
            if let ObjectBody::Thread(t) = obj.body {
                self.threads.remove(&t.tid);
                debug!("thread {} reaped", t.tid);
            }
        }
    }

    fn resolve(&self, handles: &[Handle]) -> KernelResult<Vec<ObjectId>> {
        handles
            .iter()
            .map(|&h| self.handles.get(h).map(|entry| entry.object))
            .collect()
    }
}

/// The kernel object core: handle table, objects, threads, timers and TLS,
/// all behind one lock.
///
/// Kernel threads are driven by host threads. Calls that may block take
/// the caller's [`ThreadId`] and park the calling host thread until the
/// wait completes; everything else returns without blocking.
pub struct KernelCore {
    state: Mutex<KernelState>,
    config: KernelConfig,
}

impl KernelCore {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            state: Mutex::new(KernelState::new(&config, None)),
            config,
        }
    }

    /// Create a kernel that reports Waiting/Ready transitions to `dispatcher`.
    pub fn with_dispatcher(config: KernelConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            state: Mutex::new(KernelState::new(&config, Some(dispatcher))),
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    /// Current tick.
    pub fn now(&self) -> Tick {
        self.state.lock().now
    }

    /// Advance time by one tick. Returns the number of timers fired.
    pub fn tick(&self) -> usize {
        self.advance(|now| now.saturating_add(1))
    }

    /// Advance time to `now` (never backwards) and fire every timer due.
    pub fn tick_to(&self, now: Tick) -> usize {
        self.advance(|current| current.max(now))
    }

    /// Waits and waitable timers are handled under the lock; registered
    /// callbacks run after it is released and may call back into the kernel.
    fn advance(&self, step: impl FnOnce(Tick) -> Tick) -> usize {
        let (now, fired, callbacks) = {
            let mut state = self.state.lock();
            state.now = step(state.now);
            let now = state.now;
            let due = state.timers.tick(now);
            let fired = due.len();
            let mut callbacks: Vec<TimerCallback> = Vec::new();
            for (id, action) in due {
                trace!("timer {:?} fired at tick {}: {:?}", id, now, action);
                match action {
                    TimerAction::WakeWaiter(tid) => state.expire_wait(tid, id),
                    TimerAction::SignalObject(object) => state.expire_timer_object(object),
                    TimerAction::Callback(callback) => callbacks.push(callback),
                }
            }
            if fired > 0 {
                trace!("tick {}: {} fired, {} still armed", now, fired, state.timers.len());
            }
            (now, fired, callbacks)
        };
        for callback in callbacks {
            callback(now);
        }
        fired
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Create a kernel thread in the `Initialized` state, together with its
    /// thread object and a handle to it.
    pub fn create_thread(&self, name: &str) -> KernelResult<(ThreadId, Handle)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tid = state.next_tid;
        let mut object = KObject::new(ObjectBody::Thread(KThreadObject {
            tid,
            terminated: false,
        }));
        // A live thread keeps its own object alive.
        object.pins = 1;
        let (id, handle) = state.create_object(object)?;
        state.next_tid += 1;
        state.threads.insert(
            tid,
            KThread::new(tid, name.to_string(), id, self.config.max_tls_slots),
        );
        debug!("thread {} ({}) created", tid, name);
        Ok((tid, handle))
    }

    pub fn start_thread(&self, tid: ThreadId) -> KernelResult<()> {
        let mut state = self.state.lock();
        let thread = state.thread_mut(tid)?;
        if thread.state != ThreadState::Initialized {
            return Err(KernelError::InvalidState);
        }
        thread.start();
        debug!("thread {} started", tid);
        Ok(())
    }

    /// Terminate a thread and signal its thread object. Only a thread that
    /// is not parked in a wait may exit; a woken but suspended thread is
    /// still parked.
    pub fn exit_thread(&self, tid: ThreadId, exit_code: i32) -> KernelResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let thread = state.thread_mut(tid)?;
        if !matches!(thread.state, ThreadState::Initialized | ThreadState::Running) {
            return Err(KernelError::InvalidState);
        }
        thread.state = ThreadState::Terminated;
        thread.exit_code = Some(exit_code);
        thread.tls.fill(0);
        let object = thread.object;
        debug!("thread {} exited with code {}", tid, exit_code);

        let obj = state.object_mut(object)?;
        if let ObjectBody::Thread(t) = &mut obj.body {
            t.terminated = true;
        }
        obj.pins = obj.pins.saturating_sub(1);
        state.wake_waiters(object);
        state.reclaim(object);
        Ok(())
    }

    /// Increment the suspend count, returning the previous value.
    pub fn suspend_thread(&self, tid: ThreadId) -> KernelResult<u32> {
        let mut state = self.state.lock();
        let thread = state.thread_mut(tid)?;
        if thread.is_terminated() {
            return Err(KernelError::InvalidState);
        }
        let prev = thread.suspend_count;
        thread.suspend_count = prev.checked_add(1).ok_or(KernelError::InvalidState)?;
        Ok(prev)
    }

    /// Decrement the suspend count, returning the previous value. A thread
    /// whose wait already ended resumes when the count reaches zero.
    pub fn resume_thread(&self, tid: ThreadId) -> KernelResult<u32> {
        let mut state = self.state.lock();
        let thread = state.thread_mut(tid)?;
        let prev = thread.suspend_count;
        if prev > 0 {
            thread.suspend_count -= 1;
            if thread.suspend_count == 0 {
                thread.parker.notify_one();
            }
        }
        Ok(prev)
    }

    /// State of a thread, or `None` once it has been reaped.
    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.state.lock().threads.get(&tid).map(|t| t.state)
    }

    pub fn suspend_count(&self, tid: ThreadId) -> Option<u32> {
        self.state.lock().threads.get(&tid).map(|t| t.suspend_count)
    }

    pub fn thread_exit_code(&self, tid: ThreadId) -> Option<i32> {
        self.state
            .lock()
            .threads
            .get(&tid)
            .and_then(|t| t.exit_code)
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Kind of the object a handle refers to.
    pub fn lookup(&self, handle: Handle) -> KernelResult<ObjectKind> {
        self.state.lock().handles.get(handle).map(|e| e.kind)
    }

    /// Close a handle. Closing the last handle to an object wakes all its
    /// waiters with [`KernelError::ObjectDestroyed`] and destroys it.
    pub fn close_handle(&self, handle: Handle) -> KernelResult<()> {
        let mut state = self.state.lock();
        let entry = match state.handles.close(handle) {
            Ok(entry) => entry,
            Err(KernelError::AccessDenied) => {
                warn!("refusing to close protected handle {}", handle);
                return Err(KernelError::AccessDenied);
            }
            Err(e) => return Err(e),
        };
        trace!("closed handle {} ({})", handle, entry.kind);
        state.drop_handle_ref(entry.object)
    }

    /// Open a second handle to the same object.
    pub fn duplicate_handle(&self, handle: Handle) -> KernelResult<Handle> {
        let mut state = self.state.lock();
        let entry = *state.handles.get(handle)?;
        let dup = state.handles.add(entry.object, entry.kind)?;
        state.object_mut(entry.object)?.handle_refs += 1;
        Ok(dup)
    }

    pub fn protect_handle(&self, handle: Handle) -> KernelResult<()> {
        self.state.lock().handles.set_protected(handle, true)
    }

    pub fn unprotect_handle(&self, handle: Handle) -> KernelResult<()> {
        self.state.lock().handles.set_protected(handle, false)
    }

    /// Pin the object behind `handle` so its storage outlives its handles.
    /// Closing the last handle still finalizes it.
    pub fn reference_object(&self, handle: Handle, kind: ObjectKind) -> KernelResult<ObjectId> {
        let mut state = self.state.lock();
        let id = state.handles.lock(handle, kind)?;
        state.object_mut(id)?.pins += 1;
        Ok(id)
    }

    /// Drop a pin taken with [`reference_object`](Self::reference_object).
    pub fn release_object(&self, id: ObjectId) -> KernelResult<()> {
        let mut state = self.state.lock();
        let obj = state.object_mut(id)?;
        if obj.pins == 0 {
            warn!("releasing unpinned object {:?}", id);
            return Err(KernelError::InvalidState);
        }
        obj.pins -= 1;
        state.reclaim(id);
        Ok(())
    }

    /// Number of open handles to the object behind `handle`.
    pub fn handle_refs(&self, handle: Handle) -> KernelResult<u32> {
        let mut state = self.state.lock();
        let id = state.handles.get(handle)?.object;
        Ok(state.object_mut(id)?.handle_refs)
    }

    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of objects still holding storage, including closed but
    /// pinned ones.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Snapshot of every live handle.
    pub fn handles_report(&self) -> HandleReport {
        let state = self.state.lock();
        let entries = state
            .handles
            .iter()
            .filter_map(|(handle, entry)| {
                let obj = state.objects.get(entry.object)?;
                Some(HandleInfo {
                    handle,
                    kind: entry.kind,
                    signaled: obj.is_signaled(),
                    protected: entry.flags.contains(HandleFlags::PROTECTED),
                    handle_refs: obj.handle_refs,
                    pins: obj.pins,
                    waiters: obj.waiters.len(),
                })
            })
            .collect();
        HandleReport { entries }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn create_event(&self, manual_reset: bool, initial_state: bool) -> KernelResult<Handle> {
        let object = KObject::new(ObjectBody::Event(KEvent::new(manual_reset, initial_state)));
        Ok(self.state.lock().create_object(object)?.1)
    }

    /// Signal the event and release eligible waiters: all of them for a
    /// manual-reset event, the first one for an auto-reset event.
    pub fn set_event(&self, handle: Handle) -> KernelResult<()> {
        let mut state = self.state.lock();
        let (id, event) = state.event_mut(handle)?;
        event.set();
        state.wake_waiters(id);
        Ok(())
    }

    pub fn reset_event(&self, handle: Handle) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.event_mut(handle)?.1.reset();
        Ok(())
    }

    /// Release whoever is waiting right now, then leave the event clear.
    pub fn pulse_event(&self, handle: Handle) -> KernelResult<()> {
        let mut state = self.state.lock();
        let (id, event) = state.event_mut(handle)?;
        event.set();
        state.wake_waiters(id);
        state.event_mut(handle)?.1.reset();
        Ok(())
    }

    pub fn event_is_set(&self, handle: Handle) -> KernelResult<bool> {
        let mut state = self.state.lock();
        Ok(state.event_mut(handle)?.1.signaled)
    }

    // ------------------------------------------------------------------
    // Semaphores
    // ------------------------------------------------------------------

    pub fn create_semaphore(&self, initial_count: u32) -> KernelResult<Handle> {
        let object = KObject::new(ObjectBody::Semaphore(KSemaphore::new(initial_count)));
        Ok(self.state.lock().create_object(object)?.1)
    }

    /// Add `count` units and wake waiters while units remain. Returns the
    /// previous count.
    pub fn release_semaphore(&self, handle: Handle, count: u32) -> KernelResult<u32> {
        let mut state = self.state.lock();
        let (id, sem) = state.semaphore_mut(handle)?;
        let prev = sem.release(count);
        state.wake_waiters(id);
        Ok(prev)
    }

    /// Replace the count, returning the previous one.
    pub fn set_semaphore(&self, handle: Handle, count: u32) -> KernelResult<u32> {
        let mut state = self.state.lock();
        let (id, sem) = state.semaphore_mut(handle)?;
        let prev = sem.set(count);
        state.wake_waiters(id);
        Ok(prev)
    }

    pub fn semaphore_count(&self, handle: Handle) -> KernelResult<u32> {
        let mut state = self.state.lock();
        Ok(state.semaphore_mut(handle)?.1.count)
    }

    // ------------------------------------------------------------------
    // Mutexes
    // ------------------------------------------------------------------

    /// Create a mutex, optionally already owned once by `owner`.
    pub fn create_mutex(&self, owner: Option<ThreadId>) -> KernelResult<Handle> {
        let mut state = self.state.lock();
        if let Some(tid) = owner {
            state.thread_mut(tid)?;
        }
        let object = KObject::new(ObjectBody::Mutex(KMutex::new(owner)));
        Ok(state.create_object(object)?.1)
    }

    /// Drop one level of ownership. The final release hands the mutex to
    /// the first eligible waiter.
    pub fn release_mutex(&self, tid: ThreadId, handle: Handle) -> KernelResult<()> {
        let mut state = self.state.lock();
        let (id, mutex) = state.mutex_mut(handle)?;
        match mutex.release(tid) {
            Ok(true) => {
                trace!("mutex {} released by thread {}", handle, tid);
                state.wake_waiters(id);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(
                    "thread {} released mutex {} owned by {:?}",
                    tid, handle, mutex.owner
                );
                Err(e)
            }
        }
    }

    /// Current owner and recursion depth.
    pub fn mutex_owner(&self, handle: Handle) -> KernelResult<Option<(ThreadId, u32)>> {
        let mut state = self.state.lock();
        let mutex = state.mutex_mut(handle)?.1;
        Ok(mutex.owner.map(|tid| (tid, mutex.recursion)))
    }

    // ------------------------------------------------------------------
    // Waitable timers
    // ------------------------------------------------------------------

    /// Create a timer object that becomes signaled at tick `expires`
    /// (immediately if that is not in the future).
    pub fn create_waitable_timer(&self, expires: Tick) -> KernelResult<Handle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let expired = time_before_eq(expires, state.now);
        let timers = &mut state.timers;
        let id = state.objects.insert_with(|id| {
            let timer = timers.allocate(TimerAction::SignalObject(id));
            if !expired {
                timers.add(timer, expires);
            }
            KObject::new(ObjectBody::Timer(KTimer { timer, expired }))
        });
        state.attach_handle(id, ObjectKind::Timer)
    }

    /// Re-arm a timer object. A future expiry clears the signal; a past one
    /// signals it now.
    pub fn modify_waitable_timer(&self, handle: Handle, expires: Tick) -> KernelResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = state.now;
        let (id, timer) = state.timer_object_mut(handle)?;
        let entry = timer.timer;
        if time_before_eq(expires, now) {
            let newly = !timer.expired;
            timer.expired = true;
            state.timers.cancel(entry);
            if newly {
                state.wake_waiters(id);
            }
        } else {
            timer.expired = false;
            state.timers.add(entry, expires);
        }
        Ok(())
    }

    /// Disarm a timer object without signaling it. Returns whether it was
    /// armed.
    pub fn cancel_waitable_timer(&self, handle: Handle) -> KernelResult<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state.timer_object_mut(handle)?.1.timer;
        Ok(state.timers.cancel(entry))
    }

    // ------------------------------------------------------------------
    // Callback timers
    // ------------------------------------------------------------------

    /// Register an inactive timer running `callback` on expiry.
    pub fn create_timer<F>(&self, callback: F) -> TimerId
    where
        F: Fn(Tick) + Send + Sync + 'static,
    {
        let callback: TimerCallback = Arc::new(callback);
        self.state
            .lock()
            .timers
            .allocate(TimerAction::Callback(callback))
    }

    /// Arm (or re-arm) a timer for tick `expires`.
    pub fn add_timer(&self, id: TimerId, expires: Tick) -> KernelResult<()> {
        if self.state.lock().timers.add(id, expires) {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// Move an armed timer. Returns `false` if it was not armed.
    pub fn modify_timer(&self, id: TimerId, expires: Tick) -> bool {
        self.state.lock().timers.modify(id, expires)
    }

    /// Disarm a timer. Returns whether it was armed.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.state.lock().timers.cancel(id)
    }

    /// Disarm and unregister a timer; `id` is stale afterwards.
    pub fn delete_timer(&self, id: TimerId) {
        self.state.lock().timers.release(id);
    }

    pub fn timer_active(&self, id: TimerId) -> bool {
        self.state.lock().timers.is_active(id)
    }

    pub fn next_timer_expiry(&self) -> Option<Tick> {
        self.state.lock().timers.next_expiry()
    }

    // ------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------

    /// Wait for one object.
    pub fn wait_one(
        &self,
        tid: ThreadId,
        handle: Handle,
        timeout: Timeout,
    ) -> KernelResult<WaitStatus> {
        self.wait_objects(tid, &[handle], WaitMode::Any, timeout)
    }

    /// Wait until any of `handles` is signaled. The returned index names
    /// the object that satisfied the wait; only that object is consumed.
    pub fn wait_any(
        &self,
        tid: ThreadId,
        handles: &[Handle],
        timeout: Timeout,
    ) -> KernelResult<WaitStatus> {
        self.check_wait_list(handles)?;
        self.wait_objects(tid, handles, WaitMode::Any, timeout)
    }

    /// Wait until every one of `handles` has been acquired.
    ///
    /// Objects are consumed one by one as they become available, not all at
    /// once: a timed-out or destroyed ALL wait may already have consumed
    /// some of them.
    pub fn wait_all(
        &self,
        tid: ThreadId,
        handles: &[Handle],
        timeout: Timeout,
    ) -> KernelResult<WaitStatus> {
        self.check_wait_list(handles)?;
        self.wait_objects(tid, handles, WaitMode::All, timeout)
    }

    /// Block the calling thread for `ticks` ticks.
    pub fn sleep(&self, tid: ThreadId, ticks: u64) -> KernelResult<()> {
        if ticks == 0 {
            return Ok(());
        }
        self.wait_objects(tid, &[], WaitMode::Any, Timeout::Ticks(ticks))
            .map(|_| ())
    }

    fn check_wait_list(&self, handles: &[Handle]) -> KernelResult<()> {
        if handles.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if handles.len() > self.config.max_wait_objects {
            return Err(KernelError::TooManyObjects {
                count: handles.len(),
                max: self.config.max_wait_objects,
            });
        }
        Ok(())
    }

    fn wait_objects(
        &self,
        tid: ThreadId,
        handles: &[Handle],
        mode: WaitMode,
        timeout: Timeout,
    ) -> KernelResult<WaitStatus> {
        let mut state = self.state.lock();
        let ids = state.resolve(handles)?;
        if mode == WaitMode::All {
            for (i, id) in ids.iter().enumerate() {
                if ids[..i].contains(id) {
                    return Err(KernelError::InvalidArgument);
                }
            }
        }
        match state.begin_wait(tid, &ids, mode, timeout)? {
            Some(status) => Ok(status),
            None => Self::park(&mut state, tid),
        }
    }

    /// Park the calling host thread until `tid` may run again.
    fn park(state: &mut MutexGuard<'_, KernelState>, tid: ThreadId) -> KernelResult<WaitStatus> {
        let parker = state
            .threads
            .get(&tid)
            .map(|t| t.parker.clone())
            .ok_or(KernelError::InvalidThread(tid))?;
        while state.threads.get(&tid).is_some_and(|t| !t.may_resume()) {
            parker.wait(state);
        }
        state.finish_wait(tid)
    }

    // ------------------------------------------------------------------
    // Thread-local storage
    // ------------------------------------------------------------------

    pub fn tls_alloc(&self) -> KernelResult<usize> {
        self.state.lock().tls.alloc()
    }

    /// Free a TLS slot; its value is cleared in every thread.
    pub fn tls_free(&self, index: usize) {
        let mut state = self.state.lock();
        if !state.tls.free(index) {
            return;
        }
        for thread in state.threads.values_mut() {
            if let Some(value) = thread.tls.get_mut(index) {
                *value = 0;
            }
        }
    }

    pub fn tls_get(&self, tid: ThreadId, index: usize) -> KernelResult<usize> {
        let mut state = self.state.lock();
        if !state.tls.is_allocated(index) {
            return Err(KernelError::InvalidArgument);
        }
        state
            .thread_mut(tid)?
            .tls
            .get(index)
            .copied()
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn tls_set(&self, tid: ThreadId, index: usize, value: usize) -> KernelResult<()> {
        let mut state = self.state.lock();
        if !state.tls.is_allocated(index) {
            return Err(KernelError::InvalidArgument);
        }
        let slot = state
            .thread_mut(tid)?
            .tls
            .get_mut(index)
            .ok_or(KernelError::InvalidArgument)?;
        *slot = value;
        Ok(())
    }
}

impl Default for KernelCore {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_logging, wait_until_blocked};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn kernel() -> KernelCore {
        init_logging();
        KernelCore::default()
    }

    fn running_thread(kernel: &KernelCore, name: &str) -> (ThreadId, Handle) {
        let (tid, handle) = kernel.create_thread(name).unwrap();
        kernel.start_thread(tid).unwrap();
        (tid, handle)
    }

    #[test]
    fn test_create_and_close() {
        let kernel = kernel();
        let ev = kernel.create_event(false, false).unwrap();
        assert_eq!(kernel.lookup(ev), Ok(ObjectKind::Event));
        assert_eq!(kernel.handle_count(), 1);
        assert_eq!(kernel.object_count(), 1);
        kernel.close_handle(ev).unwrap();
        assert_eq!(kernel.lookup(ev), Err(KernelError::InvalidHandle));
        assert_eq!(kernel.close_handle(ev), Err(KernelError::InvalidHandle));
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn test_wrong_type() {
        let kernel = kernel();
        let sem = kernel.create_semaphore(1).unwrap();
        assert_eq!(
            kernel.set_event(sem),
            Err(KernelError::WrongType {
                expected: ObjectKind::Event,
                found: ObjectKind::Semaphore,
            })
        );
        assert_eq!(kernel.semaphore_count(sem), Ok(1));
    }

    #[test]
    fn test_out_of_handles() {
        init_logging();
        let kernel = KernelCore::new(KernelConfig {
            max_handles: 2,
            ..KernelConfig::default()
        });
        kernel.create_event(false, false).unwrap();
        kernel.create_semaphore(0).unwrap();
        assert_eq!(
            kernel.create_mutex(None),
            Err(KernelError::OutOfHandles)
        );
        assert_eq!(kernel.object_count(), 2);
    }

    #[test]
    fn test_duplicate_keeps_object_alive() {
        let kernel = kernel();
        let ev = kernel.create_event(true, false).unwrap();
        let dup = kernel.duplicate_handle(ev).unwrap();
        assert_ne!(ev, dup);
        assert_eq!(kernel.handle_refs(ev), Ok(2));
        kernel.close_handle(ev).unwrap();
        kernel.set_event(dup).unwrap();
        assert_eq!(kernel.event_is_set(dup), Ok(true));
        kernel.close_handle(dup).unwrap();
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn test_protected_handle() {
        let kernel = kernel();
        let ev = kernel.create_event(false, false).unwrap();
        kernel.protect_handle(ev).unwrap();
        assert_eq!(kernel.close_handle(ev), Err(KernelError::AccessDenied));
        kernel.unprotect_handle(ev).unwrap();
        assert!(kernel.close_handle(ev).is_ok());
    }

    #[test]
    fn test_pinned_object_outlives_handle() {
        let kernel = kernel();
        let sem = kernel.create_semaphore(0).unwrap();
        let id = kernel
            .reference_object(sem, ObjectKind::Semaphore)
            .unwrap();
        kernel.close_handle(sem).unwrap();
        assert_eq!(kernel.handle_count(), 0);
        assert_eq!(kernel.object_count(), 1);
        kernel.release_object(id).unwrap();
        assert_eq!(kernel.object_count(), 0);
        assert_eq!(kernel.release_object(id), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_event_fast_paths() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let auto = kernel.create_event(false, true).unwrap();
        assert_eq!(
            kernel.wait_one(tid, auto, Timeout::POLL),
            Ok(WaitStatus::Satisfied(0))
        );
        assert_eq!(kernel.event_is_set(auto), Ok(false));
        assert_eq!(
            kernel.wait_one(tid, auto, Timeout::POLL),
            Ok(WaitStatus::TimedOut)
        );

        let manual = kernel.create_event(true, true).unwrap();
        for _ in 0..3 {
            assert!(kernel
                .wait_one(tid, manual, Timeout::POLL)
                .unwrap()
                .is_satisfied());
        }
        kernel.reset_event(manual).unwrap();
        assert_eq!(
            kernel.wait_one(tid, manual, Timeout::POLL),
            Ok(WaitStatus::TimedOut)
        );
    }

    #[test]
    fn test_pulse_without_waiters_leaves_event_clear() {
        let kernel = kernel();
        let ev = kernel.create_event(true, false).unwrap();
        kernel.pulse_event(ev).unwrap();
        assert_eq!(kernel.event_is_set(ev), Ok(false));
    }

    #[test]
    fn test_semaphore_counting() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let sem = kernel.create_semaphore(2).unwrap();
        assert!(kernel.wait_one(tid, sem, Timeout::POLL).unwrap().is_satisfied());
        assert!(kernel.wait_one(tid, sem, Timeout::POLL).unwrap().is_satisfied());
        assert_eq!(
            kernel.wait_one(tid, sem, Timeout::POLL),
            Ok(WaitStatus::TimedOut)
        );
        assert_eq!(kernel.release_semaphore(sem, 3), Ok(0));
        assert_eq!(kernel.set_semaphore(sem, 1), Ok(3));
        assert_eq!(kernel.semaphore_count(sem), Ok(1));
    }

    #[test]
    fn test_semaphore_never_over_grants() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let initial = 3;
        let sem = kernel.create_semaphore(initial).unwrap();
        let (mut released, mut granted) = (0u32, 0u32);
        let mut seed = 0x2545_f491_u32;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if (seed >> 16) % 3 == 0 {
                let n = (seed >> 8) % 3;
                kernel.release_semaphore(sem, n).unwrap();
                released += n;
            } else if kernel.wait_one(tid, sem, Timeout::POLL).unwrap().is_satisfied() {
                granted += 1;
            }
            assert!(granted <= released + initial);
            assert_eq!(kernel.semaphore_count(sem), Ok(released + initial - granted));
        }
    }

    #[test]
    fn test_mutex_recursion_and_ownership() {
        let kernel = kernel();
        let (a, _) = running_thread(&kernel, "a");
        let (b, _) = running_thread(&kernel, "b");
        let m = kernel.create_mutex(None).unwrap();

        for _ in 0..3 {
            assert!(kernel.wait_one(a, m, Timeout::POLL).unwrap().is_satisfied());
        }
        assert_eq!(kernel.mutex_owner(m), Ok(Some((a, 3))));
        assert_eq!(kernel.wait_one(b, m, Timeout::POLL), Ok(WaitStatus::TimedOut));

        assert_eq!(kernel.release_mutex(b, m), Err(KernelError::NotOwner));
        assert_eq!(kernel.mutex_owner(m), Ok(Some((a, 3))));

        kernel.release_mutex(a, m).unwrap();
        kernel.release_mutex(a, m).unwrap();
        assert_eq!(kernel.mutex_owner(m), Ok(Some((a, 1))));
        kernel.release_mutex(a, m).unwrap();
        assert_eq!(kernel.mutex_owner(m), Ok(None));
        assert_eq!(kernel.release_mutex(a, m), Err(KernelError::NotOwner));
    }

    #[test]
    fn test_create_mutex_owned() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "owner");
        let m = kernel.create_mutex(Some(tid)).unwrap();
        assert_eq!(kernel.mutex_owner(m), Ok(Some((tid, 1))));
        assert_eq!(
            kernel.create_mutex(Some(999)),
            Err(KernelError::InvalidThread(999))
        );
    }

    #[test]
    fn test_wait_list_validation() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let ev = kernel.create_event(true, true).unwrap();
        assert_eq!(
            kernel.wait_any(tid, &[], Timeout::POLL),
            Err(KernelError::InvalidArgument)
        );
        let many = vec![ev; kernel.config().max_wait_objects + 1];
        assert!(matches!(
            kernel.wait_any(tid, &many, Timeout::POLL),
            Err(KernelError::TooManyObjects { .. })
        ));
        assert_eq!(
            kernel.wait_all(tid, &[ev, ev], Timeout::POLL),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.wait_one(tid, Handle(0x7777), Timeout::POLL),
            Err(KernelError::InvalidHandle)
        );
    }

    #[test]
    fn test_wait_needs_started_thread() {
        let kernel = kernel();
        let (tid, _) = kernel.create_thread("idle").unwrap();
        let ev = kernel.create_event(true, true).unwrap();
        assert_eq!(
            kernel.wait_one(tid, ev, Timeout::POLL),
            Err(KernelError::InvalidState)
        );
        assert_eq!(
            kernel.wait_one(42, ev, Timeout::POLL),
            Err(KernelError::InvalidThread(42))
        );
        kernel.start_thread(tid).unwrap();
        assert_eq!(kernel.start_thread(tid), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_any_picks_first_signaled_in_order() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let a = kernel.create_event(false, false).unwrap();
        let b = kernel.create_event(false, true).unwrap();
        let c = kernel.create_event(false, true).unwrap();
        assert_eq!(
            kernel.wait_any(tid, &[a, b, c], Timeout::POLL),
            Ok(WaitStatus::Satisfied(1))
        );
        // Only the winner is consumed.
        assert_eq!(kernel.event_is_set(b), Ok(false));
        assert_eq!(kernel.event_is_set(c), Ok(true));
    }

    #[test]
    fn test_all_poll_does_not_consume_partially() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let a = kernel.create_event(false, true).unwrap();
        let sem = kernel.create_semaphore(0).unwrap();
        assert_eq!(
            kernel.wait_all(tid, &[a, sem], Timeout::POLL),
            Ok(WaitStatus::TimedOut)
        );
        assert_eq!(kernel.event_is_set(a), Ok(true));

        kernel.release_semaphore(sem, 1).unwrap();
        assert_eq!(
            kernel.wait_all(tid, &[a, sem], Timeout::POLL),
            Ok(WaitStatus::Satisfied(0))
        );
        assert_eq!(kernel.event_is_set(a), Ok(false));
        assert_eq!(kernel.semaphore_count(sem), Ok(0));
    }

    #[test]
    fn test_thread_object_signals_on_exit() {
        let kernel = kernel();
        let (main, _) = running_thread(&kernel, "main");
        let (worker, wh) = running_thread(&kernel, "worker");
        assert_eq!(kernel.lookup(wh), Ok(ObjectKind::Thread));
        assert_eq!(
            kernel.wait_one(main, wh, Timeout::POLL),
            Ok(WaitStatus::TimedOut)
        );
        kernel.exit_thread(worker, 7).unwrap();
        assert_eq!(kernel.thread_state(worker), Some(ThreadState::Terminated));
        assert_eq!(kernel.thread_exit_code(worker), Some(7));
        // Thread objects stay signaled.
        for _ in 0..2 {
            assert!(kernel.wait_one(main, wh, Timeout::POLL).unwrap().is_satisfied());
        }
        assert_eq!(kernel.exit_thread(worker, 0), Err(KernelError::InvalidState));

        kernel.close_handle(wh).unwrap();
        assert_eq!(kernel.thread_state(worker), None);
    }

    #[test]
    fn test_thread_outlives_closed_handle() {
        let kernel = kernel();
        let (tid, handle) = running_thread(&kernel, "detached");
        kernel.close_handle(handle).unwrap();
        assert_eq!(kernel.thread_state(tid), Some(ThreadState::Running));
        kernel.exit_thread(tid, 0).unwrap();
        assert_eq!(kernel.thread_state(tid), None);
        assert_eq!(kernel.object_count(), 0);
    }

    #[test]
    fn test_exit_refused_while_parked() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "w");
        let ev = kernel.create_event(false, false).unwrap();
        std::thread::scope(|s| {
            let join = s.spawn(|| kernel.wait_one(tid, ev, Timeout::Infinite));
            wait_until_blocked(&kernel, tid);
            assert_eq!(kernel.exit_thread(tid, 9), Err(KernelError::InvalidState));

            kernel.suspend_thread(tid).unwrap();
            kernel.set_event(ev).unwrap();
            assert_eq!(kernel.thread_state(tid), Some(ThreadState::Ready));
            assert_eq!(kernel.exit_thread(tid, 9), Err(KernelError::InvalidState));
            assert_eq!(kernel.thread_exit_code(tid), None);

            kernel.resume_thread(tid).unwrap();
            assert_eq!(join.join().unwrap(), Ok(WaitStatus::Satisfied(0)));
        });
        assert_eq!(kernel.thread_state(tid), Some(ThreadState::Running));
        kernel.exit_thread(tid, 9).unwrap();
        assert_eq!(kernel.thread_state(tid), Some(ThreadState::Terminated));
        assert_eq!(kernel.thread_exit_code(tid), Some(9));
    }

    #[test]
    fn test_suspend_counts() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "t");
        assert_eq!(kernel.suspend_thread(tid), Ok(0));
        assert_eq!(kernel.suspend_thread(tid), Ok(1));
        assert_eq!(kernel.resume_thread(tid), Ok(2));
        assert_eq!(kernel.resume_thread(tid), Ok(1));
        assert_eq!(kernel.resume_thread(tid), Ok(0));
        assert_eq!(kernel.suspend_count(tid), Some(0));
    }

    #[test]
    fn test_waitable_timer() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        let t = kernel.create_waitable_timer(3).unwrap();
        assert_eq!(kernel.wait_one(tid, t, Timeout::POLL), Ok(WaitStatus::TimedOut));
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.wait_one(tid, t, Timeout::POLL), Ok(WaitStatus::TimedOut));
        assert_eq!(kernel.tick(), 1);
        assert!(kernel.wait_one(tid, t, Timeout::POLL).unwrap().is_satisfied());
        // Stays signaled until re-armed.
        assert!(kernel.wait_one(tid, t, Timeout::POLL).unwrap().is_satisfied());

        kernel.modify_waitable_timer(t, 10).unwrap();
        assert_eq!(kernel.wait_one(tid, t, Timeout::POLL), Ok(WaitStatus::TimedOut));
        assert_eq!(kernel.cancel_waitable_timer(t), Ok(true));
        assert_eq!(kernel.cancel_waitable_timer(t), Ok(false));
        kernel.tick_to(20);
        assert_eq!(kernel.wait_one(tid, t, Timeout::POLL), Ok(WaitStatus::TimedOut));

        kernel.modify_waitable_timer(t, 5).unwrap();
        assert!(kernel.wait_one(tid, t, Timeout::POLL).unwrap().is_satisfied());
        kernel.close_handle(t).unwrap();
        assert_eq!(kernel.next_timer_expiry(), None);
    }

    #[test]
    fn test_waitable_timer_created_expired() {
        let kernel = kernel();
        let (tid, _) = running_thread(&kernel, "main");
        kernel.tick_to(5);
        let t = kernel.create_waitable_timer(5).unwrap();
        assert!(kernel.wait_one(tid, t, Timeout::POLL).unwrap().is_satisfied());
    }

    #[test]
    fn test_callback_timers() {
        let kernel = kernel();
        let fired = Arc::new(AtomicU64::new(0));
        let f = fired.clone();
        let id = kernel.create_timer(move |now| {
            f.store(now, Ordering::SeqCst);
        });
        assert!(!kernel.timer_active(id));
        assert!(!kernel.modify_timer(id, 4));
        kernel.add_timer(id, 3).unwrap();
        assert!(kernel.modify_timer(id, 4));
        assert_eq!(kernel.next_timer_expiry(), Some(4));

        kernel.tick_to(3);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.tick(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 4);
        assert!(!kernel.timer_active(id));

        kernel.add_timer(id, 10).unwrap();
        assert!(kernel.cancel_timer(id));
        assert!(!kernel.cancel_timer(id));
        kernel.delete_timer(id);
        assert_eq!(kernel.add_timer(id, 20), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_callback_may_reenter_kernel() {
        let kernel = Arc::new(kernel());
        let ev = kernel.create_event(true, false).unwrap();
        let k = Arc::clone(&kernel);
        let id = kernel.create_timer(move |_| {
            k.set_event(ev).unwrap();
        });
        kernel.add_timer(id, 1).unwrap();
        kernel.tick();
        assert_eq!(kernel.event_is_set(ev), Ok(true));
    }

    #[test]
    fn test_time_is_monotonic() {
        let kernel = kernel();
        kernel.tick_to(10);
        kernel.tick_to(4);
        assert_eq!(kernel.now(), 10);
        kernel.tick();
        assert_eq!(kernel.now(), 11);
    }

    #[test]
    fn test_tls_values() {
        let kernel = kernel();
        let (a, _) = running_thread(&kernel, "a");
        let (b, _) = running_thread(&kernel, "b");
        let slot = kernel.tls_alloc().unwrap();
        kernel.tls_set(a, slot, 0xdead).unwrap();
        assert_eq!(kernel.tls_get(a, slot), Ok(0xdead));
        assert_eq!(kernel.tls_get(b, slot), Ok(0));

        kernel.tls_free(slot);
        assert_eq!(kernel.tls_get(a, slot), Err(KernelError::InvalidArgument));
        let again = kernel.tls_alloc().unwrap();
        assert_eq!(again, slot);
        assert_eq!(kernel.tls_get(a, again), Ok(0));
    }

    #[test]
    fn test_handles_report() {
        let kernel = kernel();
        let (_, th) = running_thread(&kernel, "main");
        let ev = kernel.create_event(true, true).unwrap();
        kernel.create_semaphore(0).unwrap();
        kernel.protect_handle(ev).unwrap();

        let report = kernel.handles_report();
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.count(ObjectKind::Event), 1);
        let thread_row = report.entries.iter().find(|e| e.handle == th).unwrap();
        assert_eq!(thread_row.pins, 1);
        let event_row = report.entries.iter().find(|e| e.handle == ev).unwrap();
        assert!(event_row.protected && event_row.signaled);

        let text = report.to_string();
        assert!(text.contains("EVENT"));
        assert!(text.contains("SEM"));
    }
}
