// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The simulated operating system of one partition: the event loop, the
//! thread registry, and the glue that turns block/unblock/switch requests
//! into context transfers. Everything here runs on one real OS thread; the
//! only suspension points are the context transfer calls themselves.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        Context,
        ContextEntry,
        ContextKind,
    },
    event_queue::{
        SharedEventQueue,
        SimTime,
    },
    fail::Fail,
    memory::{
        stack_arena,
        StackSlot,
    },
    scheduler::{
        ComputeScheduler,
        ConditionId,
        MutexId,
        SharedSimThread,
        SimCondition,
        SimMutex,
        ThreadBody,
        ThreadId,
        ThreadState,
        WakePolicy,
    },
    SharedObject,
};
use ::slab::Slab;
use ::std::{
    collections::HashMap,
    ops::{
        Deref,
        DerefMut,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Simulated operating system of one partition.
pub struct SimOs {
    event_queue: SharedEventQueue,
    /// The event loop's own flow of control. Every transfer away from a
    /// simulated thread lands here.
    root: Context,
    kind: ContextKind,
    compute: ComputeScheduler,
    /// The simulated thread currently executing, if control is not on the
    /// event-loop context.
    active: Option<ThreadId>,
    threads: HashMap<ThreadId, SharedSimThread>,
    next_thread_id: u32,
    mutexes: Slab<SimMutex>,
    conditions: Slab<SimCondition>,
}

#[derive(Clone)]
pub struct SharedSimOs(SharedObject<SimOs>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedSimOs {
    pub fn new(kind: ContextKind, total_cores: usize, policy: WakePolicy) -> Self {
        debug!("new(): kind={:?}, total_cores={}, policy={:?}", kind, total_cores, policy);
        let root: Context = Context::root(kind);
        root.init();
        Self(SharedObject::<SimOs>::new(SimOs {
            event_queue: SharedEventQueue::new(),
            root,
            kind,
            compute: ComputeScheduler::new(total_cores, policy),
            active: None,
            threads: HashMap::new(),
            next_thread_id: 1,
            mutexes: Slab::new(),
            conditions: Slab::new(),
        }))
    }

    /// Runs the event loop until no events remain. Simulated threads that
    /// are still blocked at that point can never run again.
    pub fn run(&mut self) {
        while let Some(callback) = self.event_queue.advance() {
            callback();
        }
        let leftover: usize = self.threads.len();
        if leftover > 0 {
            warn!("run(): {} simulated threads never completed", leftover);
        }
    }

    /// Registers a new simulated thread and starts it. When the caller is
    /// itself a simulated thread the start is deferred to the event loop,
    /// because a thread cannot start another directly.
    pub fn spawn(&mut self, body: ThreadBody) -> ThreadId {
        let id: ThreadId = ThreadId::new(self.next_thread_id);
        self.next_thread_id += 1;
        let thread: SharedSimThread = SharedSimThread::new(id, self.kind, body);
        self.threads.insert(id, thread);
        debug!("spawn(): thread={}", id);
        if self.active.is_some() {
            let mut os: SharedSimOs = self.clone();
            self.event_queue
                .schedule_after(Duration::ZERO, Box::new(move || os.start_thread(id)));
        } else {
            self.start_thread(id);
        }
        id
    }

    /// Gives the thread a stack and a live context and transfers into it.
    /// Control returns here when the thread first suspends or completes.
    fn start_thread(&mut self, id: ThreadId) {
        if self.active.is_some() {
            let mut os: SharedSimOs = self.clone();
            self.event_queue
                .schedule_after(Duration::ZERO, Box::new(move || os.start_thread(id)));
            return;
        }
        let mut thread: SharedSimThread = self.thread(id);
        if thread.is_canceled() {
            self.reap(id);
            return;
        }
        let body: ThreadBody = match thread.take_body() {
            Some(body) => body,
            None => {
                let cause: String = format!("thread {} was started twice", id);
                error!("start_thread(): {}", cause);
                panic!("{}", cause);
            },
        };
        let stack: StackSlot = stack_arena::alloc();
        debug!("start_thread(): thread={}", id);
        self.active = Some(id);
        thread.set_state(ThreadState::Running);
        let mut os: SharedSimOs = self.clone();
        let entry: ContextEntry = Box::new(move || {
            body();
            os.complete_active();
        });
        thread.context().start(&stack, entry, &self.root);
        // Back on the event-loop context; the thread now owns the stack
        // until its reap.
        thread.give_stack(stack);
        self.active = None;
    }

    /// Transfers control to a suspended thread. When the caller is itself a
    /// simulated thread the switch is deferred to the event loop; contexts
    /// never switch directly between two simulated threads.
    pub fn switch_to(&mut self, id: ThreadId) {
        if self.active.is_some() {
            let mut os: SharedSimOs = self.clone();
            self.event_queue
                .schedule_after(Duration::ZERO, Box::new(move || os.switch_to(id)));
            return;
        }
        let thread: SharedSimThread = self.thread(id);
        trace!("switch_to(): thread={}", id);
        self.active = Some(id);
        thread.context().resume(&self.root);
        // Back on the event-loop context.
        self.active = None;
    }

    /// Suspends the active thread until some event unblocks it. The caller
    /// must already have arranged that wake, or the thread never runs
    /// again.
    pub fn block(&mut self) {
        let id: ThreadId = self.active_thread("block");
        let mut thread: SharedSimThread = self.thread(id);
        trace!("block(): thread={}", id);
        thread.set_timed_out(false);
        thread.set_state(ThreadState::Blocked);
        self.active = None;
        thread.context().pause(&self.root);
        // Woken: switch_to() has already made this thread active again.
        thread.set_state(ThreadState::Running);
        thread.increment_block_count();
    }

    /// Wakes a blocked thread, unless it was canceled while blocked, in
    /// which case it is reaped without ever running again.
    pub fn unblock(&mut self, id: ThreadId) {
        let thread: SharedSimThread = self.thread(id);
        if thread.is_canceled() {
            debug!("unblock(): reaping canceled thread {}", id);
            self.reap(id);
        } else {
            self.switch_to(id);
        }
    }

    /// Ends the active thread: wakes its joiners, schedules its reap, and
    /// transfers terminally to the event loop. On the OS-thread context
    /// backend the final transfer returns so the entry closure can unwind;
    /// nothing runs after it either way.
    fn complete_active(&mut self) {
        let id: ThreadId = self.active_thread("complete_active");
        let mut thread: SharedSimThread = self.thread(id);
        debug!("complete_active(): thread={}", id);
        thread.set_state(ThreadState::Done);
        while let Some(joiner) = thread.pop_joiner() {
            // The completer is still the active thread, so these wakes all
            // defer themselves to the event loop.
            self.unblock(joiner);
        }
        self.active = None;
        let mut os: SharedSimOs = self.clone();
        self.event_queue.schedule_after(Duration::ZERO, Box::new(move || os.reap(id)));
        thread.context().complete(&self.root);
    }

    /// Removes a thread from the registry and recycles its stack. Always
    /// runs on the event-loop context, never on the stack being freed. A
    /// canceled thread may die holding cores or with joiners still waiting
    /// on it; both are settled here.
    fn reap(&mut self, id: ThreadId) {
        let mut thread: SharedSimThread = match self.threads.remove(&id) {
            Some(thread) => thread,
            None => return,
        };
        debug!("reap(): thread={}", id);
        let held: usize = self.compute.cores_held(id);
        if held > 0 {
            warn!("reap(): thread {} died holding {} cores", id, held);
            if let Some(winner) = self.compute.release(held, id) {
                self.unblock(winner);
            }
        }
        while let Some(joiner) = thread.pop_joiner() {
            self.unblock(joiner);
        }
        if let Some(stack) = thread.take_stack() {
            stack_arena::free(stack);
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.event_queue.now()
    }

    /// Schedules `callback` at an absolute simulated time.
    pub fn schedule_at(&mut self, time: SimTime, callback: Box<dyn FnOnce()>) {
        self.event_queue.schedule_at(time, callback);
    }

    /// Schedules `callback` after a simulated delay.
    pub fn schedule_after(&mut self, delay: Duration, callback: Box<dyn FnOnce()>) {
        self.event_queue.schedule_after(delay, callback);
    }

    /// Suspends the active thread for `delay` of simulated time.
    pub fn sleep(&mut self, delay: Duration) {
        let id: ThreadId = self.active_thread("sleep");
        let mut os: SharedSimOs = self.clone();
        self.event_queue.schedule_after(delay, Box::new(move || os.unblock(id)));
        self.block();
    }

    /// Blocks the active thread until it is unblocked or `delay` elapses.
    /// Returns whether the block ended by timeout.
    pub fn block_timeout(&mut self, delay: Duration) -> bool {
        let id: ThreadId = self.active_thread("block_timeout");
        let generation: u64 = self.thread(id).block_count();
        let mut os: SharedSimOs = self.clone();
        self.event_queue
            .schedule_after(delay, Box::new(move || os.timeout_wake(id, generation)));
        self.block();
        self.thread(id).timed_out()
    }

    fn timeout_wake(&mut self, id: ThreadId, generation: u64) {
        let mut thread: SharedSimThread = match self.threads.get(&id) {
            Some(thread) => thread.clone(),
            None => return,
        };
        // A wake that already happened leaves the thread running or bumps
        // its block count; either way this timer is stale.
        if thread.state() != ThreadState::Blocked || thread.block_count() != generation {
            return;
        }
        debug!("timeout_wake(): thread={}", id);
        thread.set_timed_out(true);
        self.unblock(id);
    }

    /// Runs a batch of simulated computation: reserves `ncores`, sleeps for
    /// the simulated duration of the batch, and releases the cores.
    pub fn compute_for(&mut self, duration: Duration, ncores: usize) {
        let id: ThreadId = self.active_thread("compute_for");
        trace!("compute_for(): thread={}, duration={:?}, ncores={}", id, duration, ncores);
        self.reserve_cores(ncores);
        let mut os: SharedSimOs = self.clone();
        self.event_queue.schedule_after(duration, Box::new(move || os.unblock(id)));
        self.block();
        self.release_cores(ncores);
    }

    /// Reserves `ncores` for the active thread, blocking while they do not
    /// fit. A woken thread re-checks the capacity condition from scratch
    /// and blocks again if an unrelated wake got here first.
    pub fn reserve_cores(&mut self, ncores: usize) {
        let id: ThreadId = self.active_thread("reserve_cores");
        while !self.compute.try_reserve(ncores, id) {
            self.compute.enqueue_pending(ncores, id);
            self.block();
        }
    }

    /// Returns `ncores` from the active thread to the pool and wakes the
    /// thread the scheduler picks, if any.
    pub fn release_cores(&mut self, ncores: usize) {
        let id: ThreadId = self.active_thread("release_cores");
        if let Some(winner) = self.compute.release(ncores, id) {
            // The caller is still active, so this wake defers itself.
            self.unblock(winner);
        }
    }

    pub fn total_cores(&self) -> usize {
        self.compute.total_cores()
    }

    pub fn available_cores(&self) -> usize {
        self.compute.available_cores()
    }

    pub fn cores_held(&self, id: ThreadId) -> usize {
        self.compute.cores_held(id)
    }

    /// Blocks the active thread until `id` completes. Joining a thread that
    /// already completed (or was already reaped) returns immediately.
    pub fn join(&mut self, id: ThreadId) {
        let caller: ThreadId = self.active_thread("join");
        if caller == id {
            let cause: String = format!("thread {} joined itself", id);
            error!("join(): {}", cause);
            panic!("{}", cause);
        }
        let mut target: SharedSimThread = match self.threads.get(&id) {
            Some(thread) => thread.clone(),
            None => return,
        };
        if target.state() == ThreadState::Done {
            return;
        }
        target.push_joiner(caller);
        self.block();
    }

    /// Marks a thread so it is reaped instead of resumed at its next wake.
    /// Canceling a completed or unknown thread does nothing.
    pub fn cancel(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.get(&id) {
            let mut thread: SharedSimThread = thread.clone();
            if thread.state() != ThreadState::Done {
                debug!("cancel(): thread={}", id);
                thread.cancel();
            }
        }
    }

    pub fn active_thread_id(&self) -> Option<ThreadId> {
        self.active
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn mutex_create(&mut self) -> MutexId {
        MutexId::from(self.mutexes.insert(SimMutex::new()))
    }

    pub fn mutex_destroy(&mut self, id: MutexId) -> Result<(), Fail> {
        let key: usize = usize::from(id);
        match self.mutexes.get(key) {
            None => Err(Fail::new(libc::EINVAL, "no such mutex")),
            Some(mutex) if mutex.is_locked() || mutex.has_waiters() => {
                Err(Fail::new(libc::EBUSY, "mutex is in use"))
            },
            Some(_) => {
                self.mutexes.remove(key);
                Ok(())
            },
        }
    }

    /// Acquires a mutex for the active thread, blocking while another
    /// thread holds it. Ownership is handed off directly, so the woken
    /// thread holds the mutex when this returns.
    pub fn mutex_lock(&mut self, id: MutexId) -> Result<(), Fail> {
        let caller: ThreadId = self.active_thread("mutex_lock");
        {
            let mutex: &mut SimMutex = match self.mutexes.get_mut(usize::from(id)) {
                Some(mutex) => mutex,
                None => return Err(Fail::new(libc::EINVAL, "no such mutex")),
            };
            if mutex.try_acquire(caller) {
                return Ok(());
            }
            if mutex.holder() == Some(caller) {
                return Err(Fail::new(libc::EDEADLK, "mutex is already held by this thread"));
            }
            mutex.enqueue_waiter(caller);
        }
        self.block();
        Ok(())
    }

    pub fn mutex_unlock(&mut self, id: MutexId) -> Result<(), Fail> {
        let caller: ThreadId = self.active_thread("mutex_unlock");
        let next: Option<ThreadId> = {
            let mutex: &mut SimMutex = match self.mutexes.get_mut(usize::from(id)) {
                Some(mutex) => mutex,
                None => return Err(Fail::new(libc::EINVAL, "no such mutex")),
            };
            mutex.release(caller)?
        };
        if let Some(next) = next {
            self.unblock(next);
        }
        Ok(())
    }

    pub fn condition_create(&mut self) -> ConditionId {
        ConditionId::from(self.conditions.insert(SimCondition::new()))
    }

    pub fn condition_destroy(&mut self, id: ConditionId) -> Result<(), Fail> {
        let key: usize = usize::from(id);
        match self.conditions.get(key) {
            None => Err(Fail::new(libc::EINVAL, "no such condition variable")),
            Some(cond) if cond.has_waiters() => Err(Fail::new(libc::EBUSY, "condition variable is in use")),
            Some(_) => {
                self.conditions.remove(key);
                Ok(())
            },
        }
    }

    /// Atomically releases `mutex` and waits on `cond`; reacquires `mutex`
    /// before returning. Atomic here means no other simulated thread can
    /// run between the release and the wait, which the cooperative model
    /// gives for free.
    pub fn condition_wait(&mut self, cond: ConditionId, mutex: MutexId) -> Result<(), Fail> {
        let caller: ThreadId = self.active_thread("condition_wait");
        if !self.conditions.contains(usize::from(cond)) {
            return Err(Fail::new(libc::EINVAL, "no such condition variable"));
        }
        self.mutex_unlock(mutex)?;
        {
            let cond: &mut SimCondition = match self.conditions.get_mut(usize::from(cond)) {
                Some(cond) => cond,
                None => return Err(Fail::new(libc::EINVAL, "no such condition variable")),
            };
            cond.enqueue_waiter(caller);
        }
        self.block();
        self.mutex_lock(mutex)
    }

    pub fn condition_signal(&mut self, id: ConditionId) -> Result<(), Fail> {
        let winner: Option<ThreadId> = {
            let cond: &mut SimCondition = match self.conditions.get_mut(usize::from(id)) {
                Some(cond) => cond,
                None => return Err(Fail::new(libc::EINVAL, "no such condition variable")),
            };
            cond.signal()
        };
        if let Some(winner) = winner {
            self.unblock(winner);
        }
        Ok(())
    }

    pub fn condition_broadcast(&mut self, id: ConditionId) -> Result<(), Fail> {
        let waiters: Vec<ThreadId> = {
            let cond: &mut SimCondition = match self.conditions.get_mut(usize::from(id)) {
                Some(cond) => cond,
                None => return Err(Fail::new(libc::EINVAL, "no such condition variable")),
            };
            cond.broadcast()
        };
        for waiter in waiters {
            self.unblock(waiter);
        }
        Ok(())
    }

    fn thread(&self, id: ThreadId) -> SharedSimThread {
        match self.threads.get(&id) {
            Some(thread) => thread.clone(),
            None => {
                let cause: String = format!("no such thread {}", id);
                error!("thread(): {}", cause);
                panic!("{}", cause);
            },
        }
    }

    fn active_thread(&self, op: &str) -> ThreadId {
        match self.active {
            Some(id) => id,
            None => {
                let cause: String = format!("{}() from the event-loop context", op);
                error!("active_thread(): {}", cause);
                panic!("{}", cause);
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedSimOs {
    type Target = SimOs;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedSimOs {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
