// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod stack_arena;

//==============================================================================
// Exports
//==============================================================================

pub use self::stack_arena::{
    StackArena,
    StackSlot,
};
