// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Portable fallback backend: one OS thread per context, with a one-slot
//! rendezvous channel per context enforcing that at most one of them runs
//! at any instant. A transfer deposits a token in the target's slot and
//! then parks on the caller's own slot. Completion does not wake the
//! target directly: the wake is deferred until the completing thread has
//! unwound its entry closure, so no other thread runs while that closure's
//! captured state drops.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::ContextEntry,
    limits::THREAD_STACK_MIN,
    memory::StackSlot,
};
use ::crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};
use ::std::{
    cell::RefCell,
    mem,
    process,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Context backed by a dedicated OS thread. The arena stack slot is not
/// used for execution here; the spawned thread gets its own stack of the
/// slot's size from the standard library. Slots below the thread library
/// minimum are rejected before anything is spawned.
pub struct ThreadedContext {
    /// Wakes this context's thread.
    tx: Sender<()>,
    /// What this context's thread parks on.
    rx: Receiver<()>,
    handle: RefCell<Option<JoinHandle<()>>>,
    gate: Arc<CompletionGate>,
}

/// Shared between a context and its thread closure. complete() records the
/// final wake here instead of delivering it, and the thread closure sends
/// it as its very last act.
struct CompletionGate {
    finished: AtomicBool,
    next: Mutex<Option<Sender<()>>>,
}

/// Moves a value into a spawned thread without requiring `T: Send`.
struct SendCell<T> {
    value: T,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ThreadedContext {
    pub fn new() -> Self {
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        Self {
            tx,
            rx,
            handle: RefCell::new(None),
            gate: Arc::new(CompletionGate {
                finished: AtomicBool::new(false),
                next: Mutex::new(None),
            }),
        }
    }

    /// Nothing to capture: the calling thread is this context's thread and
    /// its rendezvous slot is ready as soon as the channel exists.
    pub fn init(&self) {}

    /// Spawns this context's thread running `entry` and parks `from`. The
    /// spawned thread begins executing immediately; the caller touches
    /// nothing shared between the spawn and its own park. A slot smaller
    /// than the thread library's stack floor is fatal.
    pub fn start(&self, stack: &StackSlot, entry: ContextEntry, from: &ThreadedContext) {
        if stack.len() < THREAD_STACK_MIN {
            let cause: String = format!(
                "cannot start a context on a {}-byte stack: the thread library minimum is {} bytes",
                stack.len(),
                THREAD_STACK_MIN
            );
            error!("start(): {}", cause);
            panic!("{}", cause);
        }
        let staged: SendCell<ContextEntry> = SendCell { value: entry };
        let gate: Arc<CompletionGate> = self.gate.clone();
        let builder: thread::Builder = thread::Builder::new()
            .name(String::from("sim-context"))
            .stack_size(stack.len());
        let result: Result<JoinHandle<()>, _> = builder.spawn(move || {
            let entry: ContextEntry = staged.into_inner();
            entry();
            // The entry closure and everything it captured are gone now;
            // this thread only touches the gate and the channel from here
            // to its exit.
            gate.deliver_wake();
        });
        match result {
            Ok(handle) => *self.handle.borrow_mut() = Some(handle),
            Err(e) => {
                let cause: String = format!("failed to spawn context thread: {}", e);
                error!("start(): {}", cause);
                panic!("{}", cause);
            },
        }
        from.park();
    }

    /// Wakes this context's thread and parks `from`.
    pub fn resume(&self, from: &ThreadedContext) {
        self.wake();
        from.park();
    }

    /// Wakes `to` and parks this context's thread.
    pub fn pause(&self, to: &ThreadedContext) {
        to.wake();
        self.park();
    }

    /// Records `to` as the deferred wake target and returns, so the calling
    /// thread can unwind out of its entry closure. The thread closure
    /// delivers the wake once the unwind is done, which keeps the teardown
    /// of the entry's captured state single-threaded.
    pub fn complete(&self, to: &ThreadedContext) {
        *self.gate.next() = Some(to.tx.clone());
        self.gate.finished.store(true, Ordering::SeqCst);
    }

    fn wake(&self) {
        // A full slot means some other transfer already woke this context;
        // two pending wakeups can only come from broken handoff sequencing.
        if self.tx.try_send(()).is_err() {
            let cause: &str = "woke a context that was already woken";
            error!("wake(): {}", cause);
            panic!("{}", cause);
        }
    }

    fn park(&self) {
        if self.rx.recv().is_err() {
            // All senders are gone, so no transfer can ever reach this
            // context again.
            error!("park(): context rendezvous channel disconnected");
            process::abort();
        }
    }
}

impl CompletionGate {
    fn next(&self) -> MutexGuard<'_, Option<Sender<()>>> {
        match self.next.lock() {
            Ok(guard) => guard,
            Err(_) => {
                let cause: &str = "context completion gate is poisoned";
                error!("next(): {}", cause);
                panic!("{}", cause);
            },
        }
    }

    /// Final act of a context thread: hand the run token to whoever the
    /// completing transfer named. An entry that returns without a recorded
    /// target fell off the end without completing.
    fn deliver_wake(&self) {
        if !self.finished.load(Ordering::SeqCst) {
            error!("deliver_wake(): context entry returned without completing");
            process::abort();
        }
        match self.next().take() {
            Some(tx) => {
                if tx.try_send(()).is_err() {
                    error!("deliver_wake(): completion target was already woken");
                    process::abort();
                }
            },
            None => {
                error!("deliver_wake(): context completed twice");
                process::abort();
            },
        }
    }
}

impl<T> SendCell<T> {
    fn into_inner(self) -> T {
        self.value
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: the cell crosses to the spawned thread exactly once, and the
// rendezvous protocol keeps the sender parked from that spawn until the
// value's owner thread hands control back, so no two threads ever touch
// the wrapped value at the same time.
unsafe impl<T> Send for SendCell<T> {}

impl Drop for ThreadedContext {
    fn drop(&mut self) {
        let handle: Option<JoinHandle<()>> = self.handle.borrow_mut().take();
        if let Some(handle) = handle {
            if self.gate.finished.load(Ordering::SeqCst) {
                // The thread is past its entry closure; wait for it so its
                // stack is fully retired before this context is recycled.
                if handle.join().is_err() {
                    warn!("drop(): context thread exited by panic");
                }
            } else {
                // Canceled while parked. The thread never wakes again, so
                // leak one sender to keep its channel connected and detach
                // the handle rather than join a thread that cannot exit.
                mem::forget(self.tx.clone());
                drop(handle);
            }
        }
    }
}
