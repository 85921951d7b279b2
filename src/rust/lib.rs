// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod quicksilver;
pub mod runtime;

pub use self::{
    quicksilver::{
        config::Config,
        Simulation,
    },
    runtime::{
        context::ContextKind,
        fail::Fail,
        scheduler::{
            ConditionId,
            MutexId,
            ThreadId,
            WakePolicy,
        },
        SimTime,
    },
};

/// Ensures that two expressions evaluate to equal values, bailing out of the
/// enclosing test with a diagnostic otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure_eq failed: `(left == right)`\n  left: `{:?}`\n right: `{:?}`",
                        &*left_val,
                        &*right_val
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions evaluate to different values, bailing out of
/// the enclosing test with a diagnostic otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure_neq failed: `(left != right)`\n  left: `{:?}`\n right: `{:?}`",
                        &*left_val,
                        &*right_val
                    );
                }
            },
        }
    }};
}
