// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::ContextKind,
    fail::Fail,
    limits,
    scheduler::WakePolicy,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Partition-wide options.
mod quicksilver_config {
    pub const SECTION_NAME: &str = "quicksilver";
    // Context-switch mechanism.
    pub const CONTEXT: &str = "context";
}

// Compute pool options.
mod compute_config {
    pub const SECTION_NAME: &str = "compute";
    pub const NCORES: &str = "ncores";
    pub const NSOCKETS: &str = "nsockets";
    pub const WAKE_POLICY: &str = "wake_policy";
}

// Stack arena options.
mod stacks_config {
    pub const SECTION_NAME: &str = "stacks";
    pub const STACK_SIZE: &str = "stack_size";
    pub const CHUNK_SIZE: &str = "chunk_size";
    pub const PROTECT: &str = "protect";
}

// Environment variables that override the file. Names differ from the
// YAML keys where a bare key would be too generic for the environment.
mod env_overrides {
    pub const CONTEXT_KIND: &str = "CONTEXT_KIND";
    pub const NCORES: &str = "NCORES";
    pub const NSOCKETS: &str = "NSOCKETS";
    pub const WAKE_POLICY: &str = "WAKE_POLICY";
    pub const STACK_SIZE: &str = "STACK_SIZE";
    pub const CHUNK_SIZE: &str = "CHUNK_SIZE";
    pub const PROTECT_STACKS: &str = "PROTECT_STACKS";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Simulation configuration. Every key falls back to a documented default
/// when absent, so an empty configuration is a valid one.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: String) -> Result<Self, Fail> {
        let mut text: String = String::new();
        match File::open(&config_path) {
            Ok(mut file) => {
                if let Err(e) = file.read_to_string(&mut text) {
                    let cause: String = format!("failed to read config file {}: {}", config_path, e);
                    error!("new(): {}", cause);
                    return Err(Fail::new(libc::EIO, &cause));
                }
            },
            Err(e) => {
                let cause: String = format!("failed to open config file {}: {}", config_path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        }
        Self::from_yaml_str(&text)
    }

    /// Parses a configuration from in-memory YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, Fail> {
        let docs: Vec<Yaml> = match YamlLoader::load_from_str(text) {
            Ok(docs) => docs,
            Err(e) => {
                let cause: String = format!("malformed config: {}", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        match &docs[..] {
            [] => Ok(Self(Yaml::Null)),
            [doc] => Ok(Self(doc.clone())),
            _ => Err(Fail::new(libc::EINVAL, "wrong number of config objects")),
        }
    }

    /// Context-switch mechanism. The `CONTEXT_KIND` environment variable
    /// overrides the file; with neither set, the best kind available on
    /// this platform is picked.
    pub fn context_kind(&self) -> Result<ContextKind, Fail> {
        if let Some(name) = Self::get_env_option::<String>(env_overrides::CONTEXT_KIND)? {
            return Self::parse_context_kind(&name);
        }
        match self.lookup(quicksilver_config::SECTION_NAME, quicksilver_config::CONTEXT) {
            Some(value) => match value.as_str() {
                Some(name) => Self::parse_context_kind(name),
                None => Err(Self::unexpected_type(quicksilver_config::CONTEXT)),
            },
            None => Ok(ContextKind::detect()),
        }
    }

    /// Number of simulated cores in the compute pool.
    pub fn ncores(&self) -> Result<usize, Fail> {
        if let Some(ncores) = Self::get_env_option(env_overrides::NCORES)? {
            return Ok(ncores);
        }
        match self.lookup(compute_config::SECTION_NAME, compute_config::NCORES) {
            Some(value) => Self::as_int(value, compute_config::NCORES),
            None => Ok(limits::DEFAULT_NCORES),
        }
    }

    /// Number of simulated sockets. Informational only.
    pub fn nsockets(&self) -> Result<usize, Fail> {
        if let Some(nsockets) = Self::get_env_option(env_overrides::NSOCKETS)? {
            return Ok(nsockets);
        }
        match self.lookup(compute_config::SECTION_NAME, compute_config::NSOCKETS) {
            Some(value) => Self::as_int(value, compute_config::NSOCKETS),
            None => Ok(limits::DEFAULT_NSOCKETS),
        }
    }

    /// Policy for waking pending core requests on release.
    pub fn wake_policy(&self) -> Result<WakePolicy, Fail> {
        if let Some(name) = Self::get_env_option::<String>(env_overrides::WAKE_POLICY)? {
            return Self::parse_wake_policy(&name);
        }
        match self.lookup(compute_config::SECTION_NAME, compute_config::WAKE_POLICY) {
            Some(value) => match value.as_str() {
                Some(name) => Self::parse_wake_policy(name),
                None => Err(Self::unexpected_type(compute_config::WAKE_POLICY)),
            },
            None => Ok(WakePolicy::default()),
        }
    }

    /// Size of one simulated thread stack in bytes, before page rounding.
    pub fn stack_size(&self) -> Result<usize, Fail> {
        if let Some(stack_size) = Self::get_env_option(env_overrides::STACK_SIZE)? {
            return Ok(stack_size);
        }
        match self.lookup(stacks_config::SECTION_NAME, stacks_config::STACK_SIZE) {
            Some(value) => Self::as_int(value, stacks_config::STACK_SIZE),
            None => Ok(limits::DEFAULT_STACK_SIZE),
        }
    }

    /// Size of one arena chunk in bytes. Defaults to a fixed number of
    /// stacks' worth of the effective stack size.
    pub fn chunk_size(&self) -> Result<usize, Fail> {
        if let Some(chunk_size) = Self::get_env_option(env_overrides::CHUNK_SIZE)? {
            return Ok(chunk_size);
        }
        match self.lookup(stacks_config::SECTION_NAME, stacks_config::CHUNK_SIZE) {
            Some(value) => Self::as_int(value, stacks_config::CHUNK_SIZE),
            None => Ok(limits::DEFAULT_STACKS_PER_CHUNK * self.stack_size()?),
        }
    }

    /// Whether stacks get inaccessible guard regions below and above them.
    pub fn protect_stacks(&self) -> Result<bool, Fail> {
        if let Some(protect) = Self::get_env_option(env_overrides::PROTECT_STACKS)? {
            return Ok(protect);
        }
        match self.lookup(stacks_config::SECTION_NAME, stacks_config::PROTECT) {
            Some(value) => match value.as_bool() {
                Some(protect) => Ok(protect),
                None => Err(Self::unexpected_type(stacks_config::PROTECT)),
            },
            None => Ok(false),
        }
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Indexes `section.key` in the document, treating a missing section or
    /// key as absent rather than as an error.
    fn lookup(&self, section: &str, key: &str) -> Option<&Yaml> {
        let section: &Yaml = match self.0.index(section) {
            Yaml::BadValue => return None,
            value => value,
        };
        match section.index(key) {
            Yaml::BadValue => None,
            value => Some(value),
        }
    }

    /// Reads an environment variable, parsing it into the destination type.
    /// An unset variable is absent; a set but unparsable one is an error.
    fn get_env_option<T: FromStr>(name: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(name) {
            match var.as_str().parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    let cause: String = format!("environment variable {} has unexpected type", name);
                    error!("get_env_option(): {}", cause);
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            }
        } else {
            Ok(None)
        }
    }

    /// Converts a YAML integer into the destination type, verifying that the
    /// destination may hold the value.
    fn as_int<T: TryFrom<i64>>(value: &Yaml, key: &str) -> Result<T, Fail> {
        let value: i64 = match value.as_i64() {
            Some(value) => value,
            None => return Err(Self::unexpected_type(key)),
        };
        match T::try_from(value) {
            Ok(value) => Ok(value),
            _ => {
                let cause: String = format!("parameter \"{}\" is out of range", key);
                Err(Fail::new(libc::ERANGE, &cause))
            },
        }
    }

    fn parse_context_kind(name: &str) -> Result<ContextKind, Fail> {
        match name.to_lowercase().as_str() {
            "swap" => Ok(ContextKind::Swap),
            "user" | "ucontext" => Ok(ContextKind::User),
            "threads" | "threaded" => Ok(ContextKind::Threaded),
            _ => {
                let cause: String = format!("unknown context kind \"{}\"", name);
                error!("parse_context_kind(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    fn parse_wake_policy(name: &str) -> Result<WakePolicy, Fail> {
        match name.to_lowercase().as_str() {
            "first-fit" | "first_fit" | "firstfit" => Ok(WakePolicy::FirstFit),
            "in-order" | "in_order" | "inorder" | "fifo" => Ok(WakePolicy::InOrder),
            _ => {
                let cause: String = format!("unknown wake policy \"{}\"", name);
                error!("parse_wake_policy(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    fn unexpected_type(key: &str) -> Fail {
        let cause: String = format!("parameter \"{}\" has unexpected type", key);
        error!("unexpected_type(): {}", cause);
        Fail::new(libc::EINVAL, &cause)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Null)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
