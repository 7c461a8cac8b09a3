//! MIDI activity logger CLI library.
//!
//! This crate provides the CLI interface for the MIDI activity logger.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, RangeArgs};
pub use config::Config;
