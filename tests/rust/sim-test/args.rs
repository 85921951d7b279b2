// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use anyhow::Result;
use clap::{
    Arg,
    ArgMatches,
    Command,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Context backends the test accepts on the command line.
const CONTEXT_BACKENDS: [&str; 5] = ["swap", "user", "ucontext", "threads", "threaded"];

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Context-switch backend.
    context: Option<String>,
    /// Number of threads in stress tests.
    nthreads: usize,
}

impl ProgramArguments {
    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("context")
                    .long("context")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("swap|ucontext|threads")
                    .help("Sets context-switch backend"),
            )
            .arg(
                Arg::new("nthreads")
                    .long("nthreads")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("NTHREADS")
                    .default_value("64")
                    .help("Sets number of threads in stress tests"),
            )
            .get_matches();

        let mut args: ProgramArguments = Self {
            context: None,
            nthreads: 64,
        };

        // Context backend.
        if let Some(context) = matches.get_one::<String>("context") {
            if !CONTEXT_BACKENDS.contains(&context.as_str()) {
                anyhow::bail!("invalid context backend");
            }
            args.context = Some(context.to_string());
        }

        // Number of threads.
        if let Some(nthreads) = matches.get_one::<String>("nthreads") {
            args.nthreads = nthreads.parse::<usize>()?;
            if args.nthreads == 0 {
                anyhow::bail!("nthreads must be positive");
            }
        }

        Ok(args)
    }

    /// Returns the `context` command line argument.
    pub fn context(&self) -> Option<String> {
        self.context.clone()
    }

    /// Returns the `nthreads` command line argument.
    pub fn nthreads(&self) -> usize {
        self.nthreads
    }
}
