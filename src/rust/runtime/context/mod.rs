// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod swap;
pub mod threaded;
pub mod ucontext;

pub use self::{
    swap::SwapContext,
    threaded::ThreadedContext,
    ucontext::UserContext,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::StackSlot,
};
use ::std::{
    cell::Cell,
    env,
    process,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which context-switch mechanism the partition uses. Chosen once at process
/// start and injected at every context-creation site; transfers require both
/// endpoints to be of the same kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContextKind {
    /// Hand-written assembly stack switch.
    Swap,
    /// POSIX user contexts (getcontext/makecontext/swapcontext).
    User,
    /// One OS thread per context with strict rendezvous handoff.
    Threaded,
}

/// Lifecycle of a context. Any transfer that observes an unexpected state is
/// fatal; there is no way to recover a partition whose control flow went
/// somewhere it should not have.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContextState {
    /// Created but never started.
    Fresh,
    /// Currently executing.
    Running,
    /// Saved and waiting for a resume.
    Suspended,
    /// Terminally transferred away; never runs again.
    Completed,
}

/// Body of a simulated thread. The closure finishes with a terminal transfer
/// issued by the simulated OS; it never returns control by falling off the
/// end.
pub type ContextEntry = Box<dyn FnOnce()>;

/// Carries a [`ContextEntry`] from the starting context to the stack or OS
/// thread where it will run.
pub struct EntryRecord {
    entry: Option<ContextEntry>,
}

/// A suspendable control-flow unit. One root context per partition wraps the
/// event-loop's own flow of control; every simulated thread wraps one bound
/// to an arena stack slot.
pub struct Context {
    state: Cell<ContextState>,
    inner: Inner,
}

enum Inner {
    Swap(SwapContext),
    User(UserContext),
    Threaded(ThreadedContext),
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ContextKind {
    /// Reads the kind from the CONTEXT_KIND environment variable.
    pub fn from_env() -> Result<Self, Fail> {
        match env::var("CONTEXT_KIND") {
            Ok(name) => Ok(name.into()),
            Err(_) => Err(Fail::new(
                libc::EINVAL,
                "missing value for CONTEXT_KIND environment variable",
            )),
        }
    }

    /// Best kind available on this platform.
    pub fn detect() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
                ContextKind::Swap
            } else if #[cfg(target_os = "linux")] {
                ContextKind::User
            } else {
                ContextKind::Threaded
            }
        }
    }
}

impl EntryRecord {
    /// Moves `entry` to the heap and releases ownership to whichever shim
    /// later passes the pointer to [`run_staged_entry`].
    pub(crate) fn stage(entry: ContextEntry) -> *mut EntryRecord {
        Box::into_raw(Box::new(Self { entry: Some(entry) }))
    }
}

impl Context {
    /// Wraps the calling flow of control as the partition's root context.
    pub fn root(kind: ContextKind) -> Self {
        Self {
            state: Cell::new(ContextState::Running),
            inner: Inner::allocate(kind),
        }
    }

    /// Creates a context that has not been started yet.
    pub fn fresh(kind: ContextKind) -> Self {
        Self {
            state: Cell::new(ContextState::Fresh),
            inner: Inner::allocate(kind),
        }
    }

    /// Prepares the context for having its state saved into. Root contexts
    /// call this once before the first transfer away from them.
    pub fn init(&self) {
        match &self.inner {
            Inner::Swap(context) => context.init(),
            Inner::User(context) => context.init(),
            Inner::Threaded(context) => context.init(),
        }
    }

    /// Kind of this context.
    pub fn kind(&self) -> ContextKind {
        match &self.inner {
            Inner::Swap(_) => ContextKind::Swap,
            Inner::User(_) => ContextKind::User,
            Inner::Threaded(_) => ContextKind::Threaded,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state.get()
    }

    /// Whether this context supports [`Context::jump`].
    pub fn supports_jump(&self) -> bool {
        matches!(self.inner, Inner::Swap(_))
    }

    /// Launches this fresh context running `entry` on `stack`. The caller's
    /// context `from` is suspended until some later transfer leads back to
    /// it.
    pub fn start(&self, stack: &StackSlot, entry: ContextEntry, from: &Context) {
        self.expect_state(ContextState::Fresh, "start");
        from.expect_state(ContextState::Running, "start");
        from.state.set(ContextState::Suspended);
        self.state.set(ContextState::Running);
        match (&self.inner, &from.inner) {
            (Inner::Swap(this), Inner::Swap(from)) => this.start(stack, entry, from),
            (Inner::User(this), Inner::User(from)) => this.start(stack, entry, from),
            (Inner::Threaded(this), Inner::Threaded(from)) => this.start(stack, entry, from),
            _ => kind_mismatch("start"),
        }
    }

    /// Transfers control into this suspended context, saving the caller into
    /// `from`.
    pub fn resume(&self, from: &Context) {
        self.expect_state(ContextState::Suspended, "resume");
        from.expect_state(ContextState::Running, "resume");
        from.state.set(ContextState::Suspended);
        self.state.set(ContextState::Running);
        match (&self.inner, &from.inner) {
            (Inner::Swap(this), Inner::Swap(from)) => this.resume(from),
            (Inner::User(this), Inner::User(from)) => this.resume(from),
            (Inner::Threaded(this), Inner::Threaded(from)) => this.resume(from),
            _ => kind_mismatch("resume"),
        }
    }

    /// Suspends this running context for a later resume and transfers to
    /// `to`.
    pub fn pause(&self, to: &Context) {
        self.expect_state(ContextState::Running, "pause");
        to.expect_state(ContextState::Suspended, "pause");
        self.state.set(ContextState::Suspended);
        to.state.set(ContextState::Running);
        match (&self.inner, &to.inner) {
            (Inner::Swap(this), Inner::Swap(to)) => this.pause(to),
            (Inner::User(this), Inner::User(to)) => this.pause(to),
            (Inner::Threaded(this), Inner::Threaded(to)) => this.pause(to),
            _ => kind_mismatch("pause"),
        }
    }

    /// Terminal transfer: control moves to `to` and this context never runs
    /// again. On the OS-thread backend the call returns so the thread can
    /// unwind its entry and exit; callers must do nothing afterwards.
    pub fn complete(&self, to: &Context) {
        self.expect_state(ContextState::Running, "complete");
        to.expect_state(ContextState::Suspended, "complete");
        self.state.set(ContextState::Completed);
        to.state.set(ContextState::Running);
        match (&self.inner, &to.inner) {
            (Inner::Swap(this), Inner::Swap(to)) => this.complete(to),
            (Inner::User(this), Inner::User(to)) => this.complete(to),
            (Inner::Threaded(this), Inner::Threaded(to)) => this.complete(to),
            _ => kind_mismatch("complete"),
        }
    }

    /// Fast one-way transfer that does not preserve this context for later
    /// resumption. Only the stack-swap backend implements it.
    pub fn jump(&self, to: &Context) {
        self.expect_state(ContextState::Running, "jump");
        to.expect_state(ContextState::Suspended, "jump");
        self.state.set(ContextState::Completed);
        to.state.set(ContextState::Running);
        match (&self.inner, &to.inner) {
            (Inner::Swap(this), Inner::Swap(to)) => this.jump(to),
            _ => {
                let cause: String = format!("jump is not supported by {:?} contexts", self.kind());
                error!("jump(): {}", cause);
                panic!("{}", cause);
            },
        }
    }

    fn expect_state(&self, expected: ContextState, op: &str) {
        let actual: ContextState = self.state.get();
        if actual != expected {
            let cause: String = format!(
                "{}() on a {:?} context in state {:?} (expected {:?})",
                op,
                self.kind(),
                actual,
                expected
            );
            error!("expect_state(): {}", cause);
            panic!("{}", cause);
        }
    }
}

impl Inner {
    fn allocate(kind: ContextKind) -> Self {
        match kind {
            ContextKind::Swap => Inner::Swap(SwapContext::new()),
            ContextKind::User => Inner::User(UserContext::new()),
            ContextKind::Threaded => Inner::Threaded(ThreadedContext::new()),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Conversion trait implementation for ContextKind.
impl From<String> for ContextKind {
    fn from(str: String) -> Self {
        match str.to_lowercase().as_str() {
            "swap" => ContextKind::Swap,
            "user" | "ucontext" => ContextKind::User,
            "threads" | "threaded" => ContextKind::Threaded,
            _ => panic!("unknown context kind"),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Takes ownership of a staged record and runs its closure. Used as the
/// first frame of every stack-swap and user context.
pub(crate) extern "C" fn run_staged_entry(record: *mut EntryRecord) {
    // Safety: the pointer comes from EntryRecord::stage() and ownership
    // passes to this shim exactly once.
    let mut record: Box<EntryRecord> = unsafe { Box::from_raw(record) };
    let entry: ContextEntry = match record.entry.take() {
        Some(entry) => entry,
        None => {
            error!("run_staged_entry(): context entry was staged without a closure");
            process::abort();
        },
    };
    drop(record);
    entry();
    // The entry closure ends with a terminal transfer, so control only gets
    // here when a simulated thread fell off its entry without completing.
    error!("run_staged_entry(): context entry returned without completing");
    process::abort();
}

fn kind_mismatch(op: &str) -> ! {
    let cause: String = format!("{}() between contexts of different kinds", op);
    error!("kind_mismatch(): {}", cause);
    panic!("{}", cause);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
