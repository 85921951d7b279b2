// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::SharedObject;
use ::core::cmp::Reverse;
use ::std::{
    collections::BinaryHeap,
    ops::{
        Deref,
        DerefMut,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Simulated time. Starts at zero when the partition is created and only
/// moves when the event loop pops an event.
pub type SimTime = Duration;

/// Work to run when simulated time reaches an event.
pub type EventCallback = Box<dyn FnOnce()>;

struct EventQueueEntry {
    time: SimTime,
    /// Tie-breaker: events at the same time run in the order they were
    /// scheduled.
    seq: u64,
    callback: EventCallback,
}

/// Pending events of one partition, ordered by simulated time.
pub struct EventQueue {
    now: SimTime,
    next_seq: u64,
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<EventQueueEntry>>,
}

#[derive(Clone)]
pub struct SharedEventQueue(SharedObject<EventQueue>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedEventQueue {
    pub fn new() -> Self {
        Self(SharedObject::<EventQueue>::new(EventQueue {
            now: SimTime::ZERO,
            next_seq: 0,
            heap: BinaryHeap::new(),
        }))
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedules `callback` to run at absolute simulated time `time`.
    /// Scheduling at exactly the current time is allowed and is how control
    /// transfers defer themselves to the event loop.
    pub fn schedule_at(&mut self, time: SimTime, callback: EventCallback) {
        if time < self.now {
            let cause: String = format!("scheduled an event in the past (time={:?}, now={:?})", time, self.now);
            error!("schedule_at(): {}", cause);
            panic!("{}", cause);
        }
        let seq: u64 = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(EventQueueEntry {
            time,
            seq,
            callback,
        }));
    }

    /// Schedules `callback` to run `delay` after the current simulated time.
    pub fn schedule_after(&mut self, delay: Duration, callback: EventCallback) {
        let time: SimTime = self.now + delay;
        self.schedule_at(time, callback)
    }

    /// Pops the earliest pending event, advancing simulated time to it. The
    /// callback is returned rather than run so the caller invokes it without
    /// holding any borrow of the queue.
    pub fn advance(&mut self) -> Option<EventCallback> {
        let Reverse(entry): Reverse<EventQueueEntry> = self.heap.pop()?;
        self.now = entry.time;
        trace!("advance(): now={:?}, seq={}", entry.time, entry.seq);
        Some(entry.callback)
    }

    /// Whether any events are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SharedEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SharedEventQueue {
    type Target = EventQueue;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedEventQueue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl PartialEq for EventQueueEntry {
    fn eq(&self, other: &EventQueueEntry) -> bool {
        // Entries are compared by time and sequence only; the callback does
        // not participate. Sequence numbers are unique, so this still never
        // calls two distinct entries equal.
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for EventQueueEntry {}

impl PartialOrd for EventQueueEntry {
    fn partial_cmp(&self, other: &EventQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventQueueEntry {
    fn cmp(&self, other: &EventQueueEntry) -> core::cmp::Ordering {
        // Compare event queue entries by time, then by scheduling order.
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
