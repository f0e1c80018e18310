// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use maice_types::SessionId;

#[derive(Parser, Debug)]
#[command(name = "maice", about = "Multi-agent educational chat backend", version)]
pub struct Cli {
    /// Explicit config file (highest-priority layer).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole fleet (six agent workers + backend service) over the
    /// in-process bus until ctrl-c.
    Serve,

    /// Send one question through the full pipeline and print the
    /// response-event stream as JSON lines.
    Chat {
        /// The question to ask.
        message: String,
        /// User id to submit as.
        #[arg(long, default_value = "demo")]
        user: String,
        /// Existing session to continue; a new one is created otherwise.
        #[arg(long)]
        session: Option<SessionId>,
    },

    /// Rubric-based session evaluation.
    Eval {
        #[command(subcommand)]
        command: EvalCommands,
    },

    /// Print the agent status table from the shared store.
    Status,

    /// Print the merged configuration and exit.
    ShowConfig,
}

#[derive(Subcommand, Debug)]
pub enum EvalCommands {
    /// Evaluate a single session.
    Session { id: SessionId },
    /// Evaluate an explicit list of sessions.
    Batch { ids: Vec<SessionId> },
    /// Evaluate every session.
    All {
        /// Skip sessions that already have an evaluation record.
        #[arg(long)]
        only_unevaluated: bool,
    },
}
