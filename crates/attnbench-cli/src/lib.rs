//! attnbench CLI library
//!
//! Exposes the subcommand implementations for testing.

pub mod commands;
