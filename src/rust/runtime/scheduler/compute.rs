// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::thread::ThreadId;
use ::std::collections::{
    HashMap,
    VecDeque,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// How release() picks which pending reservation to wake.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakePolicy {
    /// Scan from the front and wake the first request that fits. A later,
    /// smaller request can overtake an earlier, larger one, and a large
    /// request can starve under a sustained stream of small ones.
    FirstFit,
    /// Only ever consider the front request: wake it if it fits, otherwise
    /// wake nobody and let cores idle until the front request fits.
    InOrder,
}

/// Arbitrates a fixed pool of abstract cores among simulated threads. This
/// is pure bookkeeping: the glue layer owns the actual blocking of a thread
/// whose request does not fit and the waking of the thread release() picks.
pub struct ComputeScheduler {
    total_cores: usize,
    active_cores: usize,
    /// Core indices held per thread, pushed one per reserved unit and popped
    /// one per released unit.
    ledgers: HashMap<ThreadId, Vec<usize>>,
    /// Requests that did not fit, in arrival order.
    pending: VecDeque<(usize, ThreadId)>,
    policy: WakePolicy,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ComputeScheduler {
    pub fn new(total_cores: usize, policy: WakePolicy) -> Self {
        Self {
            total_cores,
            active_cores: 0,
            ledgers: HashMap::new(),
            pending: VecDeque::new(),
            policy,
        }
    }

    pub fn total_cores(&self) -> usize {
        self.total_cores
    }

    pub fn active_cores(&self) -> usize {
        self.active_cores
    }

    pub fn available_cores(&self) -> usize {
        self.total_cores - self.active_cores
    }

    /// Number of cores `thread` currently holds.
    pub fn cores_held(&self, thread: ThreadId) -> usize {
        self.ledgers.get(&thread).map_or(0, |ledger: &Vec<usize>| ledger.len())
    }

    /// Number of requests waiting for capacity.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Grants `ncores` to `thread` if they fit right now. The caller loops
    /// over this: a woken thread re-checks from scratch rather than trusting
    /// that the release which woke it left enough capacity.
    pub fn try_reserve(&mut self, ncores: usize, thread: ThreadId) -> bool {
        if self.active_cores + ncores > self.total_cores {
            return false;
        }
        let ledger: &mut Vec<usize> = self.ledgers.entry(thread).or_default();
        for unit in 0..ncores {
            ledger.push(self.active_cores + unit);
        }
        self.active_cores += ncores;
        trace!(
            "try_reserve(): thread={}, ncores={}, active={}/{}",
            thread,
            ncores,
            self.active_cores,
            self.total_cores
        );
        true
    }

    /// Appends a request that did not fit to the back of the pending
    /// sequence. A request larger than the whole pool is accepted and will
    /// simply never be woken.
    pub fn enqueue_pending(&mut self, ncores: usize, thread: ThreadId) {
        if ncores > self.total_cores {
            warn!(
                "enqueue_pending(): thread {} requested {} cores but the pool only has {}",
                thread, ncores, self.total_cores
            );
        }
        debug!("enqueue_pending(): thread={}, ncores={}", thread, ncores);
        self.pending.push_back((ncores, thread));
    }

    /// Returns `ncores` from `thread` to the pool and picks at most one
    /// pending request to wake, per the configured policy. Only one request
    /// is woken per release even when several now fit.
    pub fn release(&mut self, ncores: usize, thread: ThreadId) -> Option<ThreadId> {
        self.active_cores = match self.active_cores.checked_sub(ncores) {
            Some(active) => active,
            None => {
                let cause: String = format!("released {} cores with only {} active", ncores, self.active_cores);
                error!("release(): {}", cause);
                panic!("{}", cause);
            },
        };
        self.pop_ledger(ncores, thread);
        trace!(
            "release(): thread={}, ncores={}, active={}/{}",
            thread,
            ncores,
            self.active_cores,
            self.total_cores
        );

        let available: usize = self.total_cores - self.active_cores;
        let winner: usize = match self.policy {
            WakePolicy::FirstFit => self
                .pending
                .iter()
                .position(|(requested, _): &(usize, ThreadId)| *requested <= available)?,
            WakePolicy::InOrder => {
                let (requested, _): &(usize, ThreadId) = self.pending.front()?;
                if *requested > available {
                    return None;
                }
                0
            },
        };
        // The winner does not get the cores here: it re-runs the reserve
        // check itself once the glue layer transfers control to it.
        let (ncores, thread): (usize, ThreadId) = match self.pending.remove(winner) {
            Some(entry) => entry,
            None => unreachable!("position() and front() return in-bounds indices"),
        };
        debug!("release(): waking thread {} (ncores={})", thread, ncores);
        Some(thread)
    }

    fn pop_ledger(&mut self, ncores: usize, thread: ThreadId) {
        let held: usize = self.cores_held(thread);
        if held < ncores {
            let cause: String = format!("thread {} released {} cores but holds {}", thread, ncores, held);
            error!("pop_ledger(): {}", cause);
            panic!("{}", cause);
        }
        if let Some(ledger) = self.ledgers.get_mut(&thread) {
            ledger.truncate(held - ncores);
            if ledger.is_empty() {
                self.ledgers.remove(&thread);
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for WakePolicy {
    fn default() -> Self {
        WakePolicy::FirstFit
    }
}

/// Conversion trait implementation for WakePolicy.
impl From<String> for WakePolicy {
    fn from(str: String) -> Self {
        match str.to_lowercase().as_str() {
            "first-fit" | "first_fit" | "firstfit" => WakePolicy::FirstFit,
            "in-order" | "in_order" | "inorder" | "fifo" => WakePolicy::InOrder,
            _ => panic!("unknown wake policy"),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
