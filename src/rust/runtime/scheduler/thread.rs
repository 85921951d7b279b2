// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        Context,
        ContextKind,
        ContextState,
    },
    memory::StackSlot,
    SharedObject,
};
use ::std::{
    collections::VecDeque,
    fmt,
    ops::{
        Deref,
        DerefMut,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identifier of a simulated thread, unique within one partition for the
/// partition's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ThreadId(u32);

/// Lifecycle of a simulated thread as the glue layer sees it. The execution
/// context underneath has its own, finer state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    /// Spawned but not yet given a stack and context.
    Initialized,
    /// Has a live context; runs whenever control is transferred to it.
    Running,
    /// Suspended in block() waiting for an unblock.
    Blocked,
    /// Completed; waiting only for its deferred reap.
    Done,
}

/// Body of a simulated thread.
pub type ThreadBody = Box<dyn FnOnce()>;

/// One simulated thread: its context, arena stack, and the bookkeeping the
/// glue layer needs to block, wake, time out, join, and cancel it.
pub struct SimThread {
    id: ThreadId,
    state: ThreadState,
    context: Context,
    stack: Option<StackSlot>,
    /// Held from spawn until the thread is actually started, which may be
    /// deferred to the event loop.
    body: Option<ThreadBody>,
    /// Threads blocked in join() on this one, in arrival order.
    joiners: VecDeque<ThreadId>,
    /// Completed blocks. Timeout events use this to recognize a wake that
    /// already happened.
    block_count: u64,
    timed_out: bool,
    canceled: bool,
}

#[derive(Clone)]
pub struct SharedSimThread(SharedObject<SimThread>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ThreadId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl SharedSimThread {
    pub fn new(id: ThreadId, kind: ContextKind, body: ThreadBody) -> Self {
        Self(SharedObject::<SimThread>::new(SimThread {
            id,
            state: ThreadState::Initialized,
            context: Context::fresh(kind),
            stack: None,
            body: Some(body),
            joiners: VecDeque::new(),
            block_count: 0,
            timed_out: false,
            canceled: false,
        }))
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        trace!("set_state(): thread={}, {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    pub fn context(&self) -> &Context {
        &self.0.as_ref().context
    }

    /// Whether the underlying context can still receive a transfer.
    pub fn is_completed(&self) -> bool {
        self.context.state() == ContextState::Completed
    }

    pub fn give_stack(&mut self, stack: StackSlot) {
        self.stack = Some(stack);
    }

    pub fn take_stack(&mut self) -> Option<StackSlot> {
        self.stack.take()
    }

    pub fn take_body(&mut self) -> Option<ThreadBody> {
        self.body.take()
    }

    pub fn push_joiner(&mut self, joiner: ThreadId) {
        self.joiners.push_back(joiner);
    }

    pub fn pop_joiner(&mut self) -> Option<ThreadId> {
        self.joiners.pop_front()
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn increment_block_count(&mut self) {
        self.block_count += 1;
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn set_timed_out(&mut self, timed_out: bool) {
        self.timed_out = timed_out;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u32> for ThreadId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ThreadId> for u32 {
    fn from(id: ThreadId) -> Self {
        id.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for SharedSimThread {
    type Target = SimThread;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedSimThread {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
