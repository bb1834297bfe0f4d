// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

/// An LLM-driven coding agent served over HTTP and WebSocket.
///
/// All tunables come from the environment (`KLAUS_*`); run
/// `klaus show-config` to see the effective values.
#[derive(Parser, Debug)]
#[command(name = "klaus", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log at debug level (overrides RUST_LOG).
    #[arg(long, short)]
    pub verbose: bool,

    /// Override the listen port from KLAUS_PORT.
    #[arg(long, short)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent server (the default when no subcommand is given).
    Serve,

    /// Print the effective configuration and exit.  Secrets are redacted.
    ShowConfig,
}
