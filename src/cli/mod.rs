//! CLI module for tasksched - command-line interface and subcommands.
//!
//! The binary is a harness around the library: it loads configuration and
//! drives a synthetic workload so scheduling behaviour can be observed.

pub mod commands;

pub use commands::Cli;
