//! Command-line interface for the control plane.
//!
//! Provides the autoscaler loop plus operator commands for listing,
//! scaling, and draining workers and reprocessing dead letters.

mod commands;

pub use commands::{
    build_backend, connect_store, parse_cli, run, spawn_signal_handler, Cli, CliError, Commands,
    OrchestratorKind,
};
