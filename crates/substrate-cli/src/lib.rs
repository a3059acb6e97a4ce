//! # substrate-cli
//!
//! Command-line interface for the Substrate agent runtime.
//!
//! ## Commands
//!
//! - `substrate chat` — Interactive streaming chat in the terminal
//! - `substrate config` — Show the effective configuration
//! - `substrate memory` — Inspect core blocks and search archival memory
//! - `substrate doctor` — Validate configuration and probe providers
//! - `substrate completions` — Generate shell completions

pub mod commands;

pub use commands::Cli;
