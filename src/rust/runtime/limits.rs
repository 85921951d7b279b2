// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Size of a virtual-memory page on every platform we target.
pub const PAGE_SIZE: usize = 4096;

/// Default size for a simulated thread stack. Rounded up to a whole number
/// of pages by the arena at initialization time.
pub const DEFAULT_STACK_SIZE: usize = 131072;

/// Default number of stack-sized regions carved out of one arena chunk.
pub const DEFAULT_STACKS_PER_CHUNK: usize = 8;

/// Smallest stack an OS-thread backed context may be given. This matches
/// PTHREAD_STACK_MIN on the platforms we target.
pub const THREAD_STACK_MIN: usize = 16384;

/// Default number of simulated cores in the compute pool.
pub const DEFAULT_NCORES: usize = 24;

/// Default number of simulated sockets. Informational only.
pub const DEFAULT_NSOCKETS: usize = 4;
