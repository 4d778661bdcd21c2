//! Command line interface for chainwatchd

pub mod commands;

pub use commands::{daemonize, init_logging, run_cli, Cli, Commands};
