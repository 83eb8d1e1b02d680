//! Implementation of gridwright CLI commands.

pub mod config;
pub mod escape;
pub mod generate;
pub mod quote;
