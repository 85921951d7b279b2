// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! POSIX user contexts. `makecontext` passes entry arguments as C `int`s,
//! so the 64-bit entry-shim and record pointers are split into 32-bit
//! halves here and rejoined in the springboard. That packing is an
//! implementation detail of this backend; nothing outside this file sees
//! half-pointers.

//======================================================================================================================
// Imports
//======================================================================================================================

#[cfg(target_os = "linux")]
use crate::runtime::context::{
    run_staged_entry,
    EntryRecord,
};
use crate::runtime::{
    context::ContextEntry,
    memory::StackSlot,
};

#[cfg(target_os = "linux")]
use ::libc::c_int;
#[cfg(target_os = "linux")]
use ::std::{
    cell::UnsafeCell,
    io,
    mem,
    ptr,
};

//======================================================================================================================
// Structures
//======================================================================================================================

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Context backed by getcontext/makecontext/swapcontext. The
        /// structure is heap-pinned because glibc links the saved FP state
        /// into the ucontext_t itself; moving it after a save would leave a
        /// dangling interior pointer.
        pub struct UserContext {
            ucp: Box<UnsafeCell<libc::ucontext_t>>,
        }
    } else {
        /// User contexts need the POSIX ucontext family, which this target
        /// does not provide. Construction succeeds so kind probing stays
        /// cheap; any transfer is fatal.
        pub struct UserContext;
    }
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

#[cfg(target_os = "linux")]
impl UserContext {
    pub fn new() -> Self {
        // Safety: ucontext_t is a plain C structure; all-zeroes is a valid
        // initial byte pattern and getcontext fills it in before any
        // transfer reads it.
        Self {
            ucp: Box::new(UnsafeCell::new(unsafe { mem::zeroed() })),
        }
    }

    /// Captures the current execution state so later transfers can save
    /// into this context.
    pub fn init(&self) {
        // Safety: the pointer refers to a live, heap-pinned ucontext_t.
        let rc: c_int = unsafe { libc::getcontext(self.ucp()) };
        if rc != 0 {
            fatal_os("init", "getcontext");
        }
    }

    /// Binds this context to `stack` with the staged entry as its first
    /// frame, then swaps from `from` into it.
    pub fn start(&self, stack: &StackSlot, entry: ContextEntry, from: &UserContext) {
        let record: *mut EntryRecord = EntryRecord::stage(entry);
        let (shim_hi, shim_lo): (c_int, c_int) = split(run_staged_entry as *const () as usize);
        let (record_hi, record_lo): (c_int, c_int) = split(record as usize);
        // Safety: getcontext initializes the structure before makecontext
        // rewrites its entry point; the stack fields point into a live
        // arena slot that outlives the context.
        unsafe {
            if libc::getcontext(self.ucp()) != 0 {
                fatal_os("start", "getcontext");
            }
            (*self.ucp()).uc_stack.ss_sp = stack.base() as *mut libc::c_void;
            (*self.ucp()).uc_stack.ss_size = stack.len();
            (*self.ucp()).uc_link = ptr::null_mut();
            let func: extern "C" fn() = mem::transmute(springboard as extern "C" fn(c_int, c_int, c_int, c_int));
            libc::makecontext(self.ucp(), func, 4, shim_hi, shim_lo, record_hi, record_lo);
            if libc::swapcontext(from.ucp(), self.ucp()) != 0 {
                fatal_os("start", "swapcontext");
            }
        }
    }

    /// Saves `from` and restores this context.
    pub fn resume(&self, from: &UserContext) {
        // Safety: both structures are live and were initialized by
        // getcontext before their first use.
        let rc: c_int = unsafe { libc::swapcontext(from.ucp(), self.ucp()) };
        if rc != 0 {
            fatal_os("resume", "swapcontext");
        }
    }

    /// Saves this context and restores `to`.
    pub fn pause(&self, to: &UserContext) {
        // Safety: same argument as resume, with the roles reversed.
        let rc: c_int = unsafe { libc::swapcontext(self.ucp(), to.ucp()) };
        if rc != 0 {
            fatal_os("pause", "swapcontext");
        }
    }

    /// Restores `to` without saving this context. setcontext only returns
    /// on failure.
    pub fn complete(&self, to: &UserContext) {
        // Safety: `to` holds a state saved by swapcontext or getcontext and
        // this context is never resumed again.
        let _ = unsafe { libc::setcontext(to.ucp()) };
        fatal_os("complete", "setcontext");
    }

    fn ucp(&self) -> *mut libc::ucontext_t {
        self.ucp.get()
    }
}

#[cfg(not(target_os = "linux"))]
impl UserContext {
    pub fn new() -> Self {
        Self
    }

    pub fn init(&self) {
        unsupported_os();
    }

    pub fn start(&self, _stack: &StackSlot, _entry: ContextEntry, _from: &UserContext) {
        unsupported_os();
    }

    pub fn resume(&self, _from: &UserContext) {
        unsupported_os();
    }

    pub fn pause(&self, _to: &UserContext) {
        unsupported_os();
    }

    pub fn complete(&self, _to: &UserContext) {
        unsupported_os();
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Splits a pointer-sized value into the two `int` halves makecontext can
/// carry.
#[cfg(target_os = "linux")]
fn split(value: usize) -> (c_int, c_int) {
    ((value >> 32) as c_int, (value & 0xffff_ffff) as c_int)
}

/// Rejoins two halves produced by [`split`]. The halves pass through `u32`
/// so that a set top bit in either half widens with zeroes; sign extension
/// here would corrupt the rebuilt pointer.
#[cfg(target_os = "linux")]
fn join(hi: c_int, lo: c_int) -> usize {
    ((hi as u32 as usize) << 32) | (lo as u32 as usize)
}

/// First frame of every user context: rebuilds the entry-shim and record
/// pointers and tail-calls into the shim.
#[cfg(target_os = "linux")]
extern "C" fn springboard(shim_hi: c_int, shim_lo: c_int, record_hi: c_int, record_lo: c_int) {
    // Safety: the halves were produced by split() from a valid shim pointer
    // in start().
    let shim: extern "C" fn(*mut EntryRecord) = unsafe { mem::transmute(join(shim_hi, shim_lo)) };
    let record: *mut EntryRecord = join(record_hi, record_lo) as *mut EntryRecord;
    shim(record);
}

#[cfg(target_os = "linux")]
fn fatal_os(op: &str, call: &str) -> ! {
    let cause: String = format!("{} failed in {}(): {}", call, op, io::Error::last_os_error());
    error!("fatal_os(): {}", cause);
    panic!("{}", cause);
}

#[cfg(not(target_os = "linux"))]
fn unsupported_os() -> ! {
    let cause: &str = "user contexts are not supported on this platform";
    error!("unsupported_os(): {}", cause);
    panic!("{}", cause);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
