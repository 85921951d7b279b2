// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod compute;
pub mod sync;
pub mod thread;

pub use self::{
    compute::{
        ComputeScheduler,
        WakePolicy,
    },
    sync::{
        ConditionId,
        MutexId,
        SimCondition,
        SimMutex,
    },
    thread::{
        SharedSimThread,
        SimThread,
        ThreadBody,
        ThreadId,
        ThreadState,
    },
};
