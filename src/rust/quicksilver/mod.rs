// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    quicksilver::config::Config,
    runtime::{
        context::ContextKind,
        fail::Fail,
        logging,
        memory::stack_arena,
        os::SharedSimOs,
        scheduler::{
            ConditionId,
            MutexId,
            ThreadId,
            WakePolicy,
        },
        SimTime,
    },
};
use ::std::{
    env,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One simulation partition: a virtual clock, a simulated operating system,
/// and a pool of simulated cores. Clones share the partition, so thread
/// bodies capture a clone to reach the simulation they run under.
#[derive(Clone)]
pub struct Simulation {
    os: SharedSimOs,
    nsockets: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Simulation {
    /// Instantiates a partition from the file named by the CONFIG_PATH
    /// environment variable, or from built-in defaults when it is unset.
    pub fn new() -> Result<Self, Fail> {
        let config: Config = match env::var("CONFIG_PATH") {
            Ok(config_path) => Config::new(config_path)?,
            Err(_) => Config::default(),
        };
        Self::from_config(&config)
    }

    /// Instantiates a partition from an explicit configuration.
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        logging::initialize();
        let kind: ContextKind = config.context_kind()?;
        let ncores: usize = config.ncores()?;
        let nsockets: usize = config.nsockets()?;
        let policy: WakePolicy = config.wake_policy()?;
        let stack_size: usize = config.stack_size()?;
        let chunk_size: usize = config.chunk_size()?;
        let protect: bool = config.protect_stacks()?;
        stack_arena::init(stack_size, chunk_size, protect);
        debug!(
            "from_config(): kind={:?}, ncores={}, nsockets={}, policy={:?}",
            kind, ncores, nsockets, policy
        );
        Ok(Self {
            os: SharedSimOs::new(kind, ncores, policy),
            nsockets,
        })
    }

    /// Registers a simulated thread running `body`.
    pub fn spawn<F: FnOnce() + 'static>(&mut self, body: F) -> ThreadId {
        self.os.spawn(Box::new(body))
    }

    /// Runs the partition until no events remain.
    pub fn run(&mut self) {
        self.os.run()
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.os.now()
    }

    /// Schedules `callback` at an absolute simulated time.
    pub fn schedule_at(&mut self, time: SimTime, callback: Box<dyn FnOnce()>) {
        self.os.schedule_at(time, callback)
    }

    /// Schedules `callback` after a simulated delay.
    pub fn schedule_after(&mut self, delay: Duration, callback: Box<dyn FnOnce()>) {
        self.os.schedule_after(delay, callback)
    }

    /// Suspends the calling simulated thread for `delay`.
    pub fn sleep(&mut self, delay: Duration) {
        self.os.sleep(delay)
    }

    /// Runs a simulated compute batch on `ncores` for `duration`.
    pub fn compute_for(&mut self, duration: Duration, ncores: usize) {
        self.os.compute_for(duration, ncores)
    }

    /// Blocks the calling simulated thread until an unblock or `delay`.
    /// Returns whether the block ended by timeout.
    pub fn block_timeout(&mut self, delay: Duration) -> bool {
        self.os.block_timeout(delay)
    }

    /// Wakes a blocked simulated thread.
    pub fn unblock(&mut self, id: ThreadId) {
        self.os.unblock(id)
    }

    /// Blocks the calling simulated thread until `id` completes.
    pub fn join(&mut self, id: ThreadId) {
        self.os.join(id)
    }

    /// Prevents a blocked thread from ever running again.
    pub fn cancel(&mut self, id: ThreadId) {
        self.os.cancel(id)
    }

    pub fn mutex_create(&mut self) -> MutexId {
        self.os.mutex_create()
    }

    pub fn mutex_destroy(&mut self, id: MutexId) -> Result<(), Fail> {
        self.os.mutex_destroy(id)
    }

    pub fn mutex_lock(&mut self, id: MutexId) -> Result<(), Fail> {
        self.os.mutex_lock(id)
    }

    pub fn mutex_unlock(&mut self, id: MutexId) -> Result<(), Fail> {
        self.os.mutex_unlock(id)
    }

    pub fn condition_create(&mut self) -> ConditionId {
        self.os.condition_create()
    }

    pub fn condition_destroy(&mut self, id: ConditionId) -> Result<(), Fail> {
        self.os.condition_destroy(id)
    }

    pub fn condition_wait(&mut self, cond: ConditionId, mutex: MutexId) -> Result<(), Fail> {
        self.os.condition_wait(cond, mutex)
    }

    pub fn condition_signal(&mut self, id: ConditionId) -> Result<(), Fail> {
        self.os.condition_signal(id)
    }

    pub fn condition_broadcast(&mut self, id: ConditionId) -> Result<(), Fail> {
        self.os.condition_broadcast(id)
    }

    /// Number of simulated threads that have not been reaped.
    pub fn thread_count(&self) -> usize {
        self.os.thread_count()
    }

    /// Identity of the running simulated thread, if any.
    pub fn active_thread_id(&self) -> Option<ThreadId> {
        self.os.active_thread_id()
    }

    pub fn total_cores(&self) -> usize {
        self.os.total_cores()
    }

    pub fn available_cores(&self) -> usize {
        self.os.available_cores()
    }

    pub fn cores_held(&self, id: ThreadId) -> usize {
        self.os.cores_held(id)
    }

    /// Number of simulated sockets. Informational; core accounting does not
    /// subdivide by socket.
    pub fn nsockets(&self) -> usize {
        self.nsockets
    }

    /// Context-switch mechanism this partition runs on.
    pub fn context_kind(&self) -> ContextKind {
        self.os.kind()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
