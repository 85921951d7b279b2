// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        run_staged_entry,
        ContextEntry,
        EntryRecord,
    },
    memory::StackSlot,
};
use ::std::{
    cell::Cell,
    ptr,
};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use ::std::arch::naked_asm;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Context backed by a hand-written stack switch. The only per-context state
/// is the saved stack pointer; everything else lives in the register frame
/// written to the stack itself.
pub struct SwapContext {
    /// Stack pointer captured at the last transfer away from this context.
    /// Null until the first save.
    sp: Cell<*mut u8>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SwapContext {
    pub fn new() -> Self {
        Self {
            sp: Cell::new(ptr::null_mut()),
        }
    }

    /// Nothing to prepare: the first transfer away writes the save slot.
    pub fn init(&self) {}

    /// Seeds a synthetic register frame at the top of `stack` so that the
    /// first transfer into this context "returns" into the boot shim, then
    /// swaps from `from` into it.
    pub fn start(&self, stack: &StackSlot, entry: ContextEntry, from: &SwapContext) {
        let record: *mut EntryRecord = EntryRecord::stage(entry);
        self.sp.set(seed_frame(stack, record));
        // Safety: both save slots are live Cells and the seeded frame obeys
        // the layout qs_context_swap restores from.
        unsafe { qs_context_swap(from.sp.as_ptr(), self.sp.as_ptr()) };
    }

    /// Swaps from `from` into this context's saved frame.
    pub fn resume(&self, from: &SwapContext) {
        // Safety: this context was saved by an earlier transfer away, so its
        // frame is a valid save produced by qs_context_swap or seed_frame.
        unsafe { qs_context_swap(from.sp.as_ptr(), self.sp.as_ptr()) };
    }

    /// Saves this context and loads `to`.
    pub fn pause(&self, to: &SwapContext) {
        // Safety: same argument as resume, with the roles reversed.
        unsafe { qs_context_swap(self.sp.as_ptr(), to.sp.as_ptr()) };
    }

    /// Loads `to` without saving this context. Never returns.
    pub fn complete(&self, to: &SwapContext) {
        // Safety: `to` holds a valid saved frame and this context is never
        // resumed again, so discarding its registers is fine.
        unsafe { qs_context_load(to.sp.as_ptr()) };
    }

    /// One-way transfer. Identical mechanics to complete; the distinction in
    /// bookkeeping is made by the caller.
    pub fn jump(&self, to: &SwapContext) {
        // Safety: same argument as complete.
        unsafe { qs_context_load(to.sp.as_ptr()) };
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Number of words in a saved register frame: r15, r14, r13, r12,
        /// rbx, rbp, return address.
        const FRAME_WORDS: usize = 7;

        /// Builds the synthetic first frame for a fresh context. The layout
        /// mirrors the restore order of [`qs_context_swap`]; the boot shim
        /// address sits where `ret` expects the return address.
        fn seed_frame(stack: &StackSlot, record: *mut EntryRecord) -> *mut u8 {
            let top: *mut usize = stack.top() as *mut usize;
            // Safety: the frame lies fully inside the slot; slot lengths are
            // page multiples, so `top` is 16-byte aligned as the ABI wants.
            unsafe {
                let sp: *mut usize = top.sub(FRAME_WORDS);
                ptr::write_bytes(sp, 0, FRAME_WORDS);
                sp.add(2).write(record as usize); // r13: argument
                sp.add(3).write(run_staged_entry as *const () as usize); // r12: entry shim
                sp.add(6).write(qs_context_boot as *const () as usize); // return address
                sp as *mut u8
            }
        }

        /// Saves the callee-saved registers and stack pointer of the calling
        /// context into `*save`, then restores the frame pointed to by
        /// `*load`. Returns on the restored context's stack.
        #[unsafe(naked)]
        unsafe extern "C" fn qs_context_swap(save: *mut *mut u8, load: *const *mut u8) {
            naked_asm!(
                "push rbp",
                "push rbx",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov [rdi], rsp",
                "mov rsp, [rsi]",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                "pop rbp",
                "ret",
            )
        }

        /// Restores the frame pointed to by `*load`, discarding the calling
        /// context's registers. Never returns to the caller.
        #[unsafe(naked)]
        unsafe extern "C" fn qs_context_load(load: *const *mut u8) {
            naked_asm!(
                "mov rsp, [rdi]",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                "pop rbp",
                "ret",
            )
        }

        /// First "return address" of every fresh context: realigns the stack
        /// and calls the staged entry shim with its argument.
        #[unsafe(naked)]
        unsafe extern "C" fn qs_context_boot() {
            naked_asm!(
                "and rsp, -16",
                "mov rdi, r13",
                "call r12",
                "ud2",
            )
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Number of words in a saved register frame: x19-x28, fp, lr,
        /// d8-d15.
        const FRAME_WORDS: usize = 20;

        /// Builds the synthetic first frame for a fresh context. The layout
        /// mirrors the restore order of [`qs_context_swap`]; the boot shim
        /// address sits in the lr slot that `ret` branches through.
        fn seed_frame(stack: &StackSlot, record: *mut EntryRecord) -> *mut u8 {
            let top: *mut usize = stack.top() as *mut usize;
            // Safety: the frame lies fully inside the slot; slot lengths are
            // page multiples, so the seeded sp keeps 16-byte alignment.
            unsafe {
                let sp: *mut usize = top.sub(FRAME_WORDS);
                ptr::write_bytes(sp, 0, FRAME_WORDS);
                sp.write(run_staged_entry as *const () as usize); // x19: entry shim
                sp.add(1).write(record as usize); // x20: argument
                sp.add(11).write(qs_context_boot as *const () as usize); // lr
                sp as *mut u8
            }
        }

        /// Saves the callee-saved registers and stack pointer of the calling
        /// context into `*save`, then restores the frame pointed to by
        /// `*load`. Returns on the restored context's stack.
        #[unsafe(naked)]
        unsafe extern "C" fn qs_context_swap(save: *mut *mut u8, load: *const *mut u8) {
            naked_asm!(
                "sub sp, sp, #0xa0",
                "stp x19, x20, [sp, #0x00]",
                "stp x21, x22, [sp, #0x10]",
                "stp x23, x24, [sp, #0x20]",
                "stp x25, x26, [sp, #0x30]",
                "stp x27, x28, [sp, #0x40]",
                "stp x29, x30, [sp, #0x50]",
                "stp d8, d9, [sp, #0x60]",
                "stp d10, d11, [sp, #0x70]",
                "stp d12, d13, [sp, #0x80]",
                "stp d14, d15, [sp, #0x90]",
                "mov x2, sp",
                "str x2, [x0]",
                "ldr x2, [x1]",
                "mov sp, x2",
                "ldp x19, x20, [sp, #0x00]",
                "ldp x21, x22, [sp, #0x10]",
                "ldp x23, x24, [sp, #0x20]",
                "ldp x25, x26, [sp, #0x30]",
                "ldp x27, x28, [sp, #0x40]",
                "ldp x29, x30, [sp, #0x50]",
                "ldp d8, d9, [sp, #0x60]",
                "ldp d10, d11, [sp, #0x70]",
                "ldp d12, d13, [sp, #0x80]",
                "ldp d14, d15, [sp, #0x90]",
                "add sp, sp, #0xa0",
                "ret",
            )
        }

        /// Restores the frame pointed to by `*load`, discarding the calling
        /// context's registers. Never returns to the caller.
        #[unsafe(naked)]
        unsafe extern "C" fn qs_context_load(load: *const *mut u8) {
            naked_asm!(
                "ldr x2, [x0]",
                "mov sp, x2",
                "ldp x19, x20, [sp, #0x00]",
                "ldp x21, x22, [sp, #0x10]",
                "ldp x23, x24, [sp, #0x20]",
                "ldp x25, x26, [sp, #0x30]",
                "ldp x27, x28, [sp, #0x40]",
                "ldp x29, x30, [sp, #0x50]",
                "ldp d8, d9, [sp, #0x60]",
                "ldp d10, d11, [sp, #0x70]",
                "ldp d12, d13, [sp, #0x80]",
                "ldp d14, d15, [sp, #0x90]",
                "add sp, sp, #0xa0",
                "ret",
            )
        }

        /// First branch target of every fresh context: calls the staged
        /// entry shim with its argument.
        #[unsafe(naked)]
        unsafe extern "C" fn qs_context_boot() {
            naked_asm!(
                "mov x0, x20",
                "blr x19",
                "brk #0x1",
            )
        }
    } else {
        fn seed_frame(_stack: &StackSlot, _record: *mut EntryRecord) -> *mut u8 {
            unsupported_arch()
        }

        unsafe extern "C" fn qs_context_swap(_save: *mut *mut u8, _load: *const *mut u8) {
            unsupported_arch()
        }

        unsafe extern "C" fn qs_context_load(_load: *const *mut u8) {
            unsupported_arch()
        }

        fn unsupported_arch() -> ! {
            let cause: &str = "stack-swap contexts are not supported on this architecture";
            error!("unsupported_arch(): {}", cause);
            panic!("{}", cause);
        }
    }
}
