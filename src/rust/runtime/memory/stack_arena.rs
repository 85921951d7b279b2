// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::limits;
use ::libc::c_void;
use ::std::{
    ptr,
    ptr::NonNull,
    sync::{
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A usable stack region handed out by the arena. The region is exclusively
/// owned by the holder until it is returned with [`free`]. Length always
/// equals the configured (page-rounded) stack size.
pub struct StackSlot {
    base: NonNull<u8>,
    len: usize,
}

/// Frozen arena configuration. Set once by the first [`StackArena::configure`]
/// call in the process.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ArenaConfig {
    /// Size of one stack, rounded up to a whole number of pages.
    stack_size: usize,
    /// Size of one mapped chunk, rounded up to a whole number of stacks.
    chunk_size: usize,
    /// Whether to interleave PROT_NONE guard regions between stacks.
    protect: bool,
}

/// One anonymous mapping carved into stack slots. Chunks are never unmapped;
/// the arena deliberately keeps every mapping alive for the rest of the
/// process so that stale stack pointers in completed contexts can never
/// alias a foreign mapping.
struct Chunk {
    base: usize,
    len: usize,
}

/// Chunked allocator for simulated-thread stacks. All state sits behind one
/// mutex in the process-wide instance; partitions on distinct OS threads
/// contend on that lock only when spawning or reaping threads.
pub struct StackArena {
    config: Option<ArenaConfig>,
    /// LIFO of slot base addresses ready for reuse.
    free: Vec<usize>,
    chunks: Vec<Chunk>,
    /// Slots currently handed out.
    outstanding: usize,
}

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// The process-wide arena.
static ARENA: Mutex<StackArena> = Mutex::new(StackArena::uninit());

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl StackSlot {
    /// Lowest address of the region.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Highest address of the region, exclusive. Stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        // Safety: base and len describe a single live mapping, so the
        // one-past-the-end pointer stays within the same allocated object.
        unsafe { self.base.as_ptr().add(self.len) }
    }
}

impl StackArena {
    /// Creates an unconfigured arena.
    pub const fn uninit() -> Self {
        Self {
            config: None,
            free: Vec::new(),
            chunks: Vec::new(),
            outstanding: 0,
        }
    }

    /// Fixes the arena configuration. The first call wins; later calls with
    /// the same effective values are no-ops, and later calls with different
    /// values are fatal. `stack_size` is rounded up to a whole number of
    /// pages and `chunk_size` to a whole number of stacks.
    pub fn configure(&mut self, stack_size: usize, chunk_size: usize, protect: bool) {
        let stack_size: usize = round_up(stack_size, page_size());
        let chunk_size: usize = round_up(chunk_size, stack_size);
        let config: ArenaConfig = ArenaConfig {
            stack_size,
            chunk_size,
            protect,
        };
        match self.config {
            None => {
                debug!(
                    "configure(): stack_size={}, chunk_size={}, protect={}",
                    stack_size, chunk_size, protect
                );
                self.config = Some(config);
            },
            Some(current) if current == config => (),
            Some(current) => {
                let cause: String = format!(
                    "stack arena re-configured with conflicting values (current={:?}, requested={:?})",
                    current, config
                );
                error!("configure(): {}", cause);
                panic!("{}", cause);
            },
        }
    }

    /// Pops a stack slot off the free list, mapping and carving a fresh chunk
    /// first if no slot is available. The returned memory is zero-filled.
    pub fn alloc(&mut self) -> StackSlot {
        let config: ArenaConfig = match self.config {
            Some(config) => config,
            None => {
                let cause: &str = "stack arena used before it was configured";
                error!("alloc(): {}", cause);
                panic!("{}", cause);
            },
        };
        if self.free.is_empty() {
            self.carve_chunk(&config);
        }
        let base: usize = match self.free.pop() {
            Some(base) => base,
            None => {
                let cause: String = format!("chunk too small to carve any usable stack ({:?})", config);
                error!("alloc(): {}", cause);
                panic!("{}", cause);
            },
        };
        self.outstanding += 1;
        trace!("alloc(): base={:#x}, outstanding={}", base, self.outstanding);
        StackSlot {
            // Safety: slot addresses come from successful mmap calls and are
            // therefore non-null.
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            len: config.stack_size,
        }
    }

    /// Returns a slot to the free list. The region is scrubbed so the next
    /// alloc observes zeroed memory, matching the zero-fill of fresh chunks.
    pub fn free(&mut self, slot: StackSlot) {
        let config: ArenaConfig = match self.config {
            Some(config) => config,
            None => {
                let cause: &str = "stack arena used before it was configured";
                error!("free(): {}", cause);
                panic!("{}", cause);
            },
        };
        let base: usize = slot.base.as_ptr() as usize;
        if slot.len != config.stack_size || !self.owns(base) {
            let cause: String = format!("freed slot does not belong to this arena (base={:#x})", base);
            error!("free(): {}", cause);
            panic!("{}", cause);
        }
        // Safety: the slot was handed out by alloc() and its region is a live
        // read-write mapping of exactly slot.len bytes.
        unsafe { ptr::write_bytes(slot.base.as_ptr(), 0, slot.len) };
        self.outstanding -= 1;
        self.free.push(base);
        trace!("free(): base={:#x}, outstanding={}", base, self.outstanding);
    }

    /// Effective stack size. Fatal when unconfigured.
    pub fn stack_size(&self) -> usize {
        match self.config {
            Some(config) => config.stack_size,
            None => {
                let cause: &str = "stack arena used before it was configured";
                error!("stack_size(): {}", cause);
                panic!("{}", cause);
            },
        }
    }

    /// Number of chunks mapped so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of slots ready for reuse.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of slots currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Whether the arena has been configured.
    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Maps one chunk and carves it into stack-size-aligned slots. With
    /// protection on, regions alternate guard/usable beginning and ending
    /// with a guard, so every usable slot has an inaccessible region
    /// directly below it and directly above it. The last region is always a
    /// guard; without one, an overflow off the topmost slot would run into
    /// whatever mapping lands after the chunk. This halves the yield per
    /// chunk.
    fn carve_chunk(&mut self, config: &ArenaConfig) {
        let base: *mut u8 = map_chunk(config.chunk_size);
        self.chunks.push(Chunk {
            base: base as usize,
            len: config.chunk_size,
        });

        let chunk_end: usize = base as usize + config.chunk_size;
        let aligned: usize = round_up(base as usize, config.stack_size);
        let nregions: usize = (chunk_end - aligned) / config.stack_size;

        let mut yielded: usize = 0;
        for index in 0..nregions {
            let region: usize = aligned + index * config.stack_size;
            if config.protect && (index % 2 == 0 || index + 1 == nregions) {
                protect_region(region as *mut u8, config.stack_size);
            } else {
                self.free.push(region);
                yielded += 1;
            }
        }
        debug!(
            "carve_chunk(): base={:#x}, regions={}, usable={}",
            base as usize, nregions, yielded
        );
    }

    /// Whether `addr` falls inside a mapped chunk.
    fn owns(&self, addr: usize) -> bool {
        self.chunks
            .iter()
            .any(|chunk: &Chunk| addr >= chunk.base && addr < chunk.base + chunk.len)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: a slot describes an exclusively-owned region of a process-global
// mapping, so moving the handle to another partition's OS thread transfers
// that exclusive ownership with it.
unsafe impl Send for StackSlot {}

// Safety: the arena only stores addresses of process-global mappings; the
// mutex around the process-wide instance serializes all access to them.
unsafe impl Send for StackArena {}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Locks the process-wide arena.
fn arena() -> MutexGuard<'static, StackArena> {
    match ARENA.lock() {
        Ok(guard) => guard,
        Err(_) => {
            let cause: &str = "stack arena lock is poisoned";
            error!("arena(): {}", cause);
            panic!("{}", cause);
        },
    }
}

/// Configures the process-wide arena. See [`StackArena::configure`].
pub fn init(stack_size: usize, chunk_size: usize, protect: bool) {
    arena().configure(stack_size, chunk_size, protect)
}

/// Allocates a slot from the process-wide arena.
pub fn alloc() -> StackSlot {
    arena().alloc()
}

/// Returns a slot to the process-wide arena.
pub fn free(slot: StackSlot) {
    arena().free(slot)
}

/// Effective stack size of the process-wide arena.
pub fn stack_size() -> usize {
    arena().stack_size()
}

/// Number of chunks the process-wide arena has mapped.
pub fn chunk_count() -> usize {
    arena().chunk_count()
}

/// Number of recycled slots available in the process-wide arena.
pub fn free_count() -> usize {
    arena().free_count()
}

/// Number of slots handed out by the process-wide arena.
pub fn outstanding() -> usize {
    arena().outstanding()
}

/// Whether the process-wide arena has been configured.
pub fn is_initialized() -> bool {
    arena().is_configured()
}

/// Size of a virtual-memory page.
fn page_size() -> usize {
    let value: i64 = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        limits::PAGE_SIZE
    } else {
        value as usize
    }
}

/// Rounds `value` up to the next multiple of `multiple`.
fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Maps one anonymous read-write chunk. Fatal on failure.
fn map_chunk(len: usize) -> *mut u8 {
    // Safety: anonymous mapping with no requested address; arguments are
    // self-contained and the result is checked below.
    let base: *mut c_void = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let cause: String = format!(
            "failed to map stack chunk (len={}): {}",
            len,
            std::io::Error::last_os_error()
        );
        error!("map_chunk(): {}", cause);
        panic!("{}", cause);
    }
    base as *mut u8
}

/// Revokes all access to a guard region. Fatal on failure.
fn protect_region(base: *mut u8, len: usize) {
    // Safety: the region lies within a chunk just mapped by map_chunk().
    let rc: i32 = unsafe { libc::mprotect(base as *mut c_void, len, libc::PROT_NONE) };
    if rc != 0 {
        let cause: String = format!(
            "failed to protect guard region (base={:p}, len={}): {}",
            base,
            len,
            std::io::Error::last_os_error()
        );
        error!("protect_region(): {}", cause);
        panic!("{}", cause);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
