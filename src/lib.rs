//! agent-sandbox - run agent-generated commands under OS isolation
//!
//! This crate provides:
//! - A sandbox policy (writable directories, working directory, environment,
//!   timeout, isolation mode) that validates and dispatches commands
//! - Platform backends: Linux namespaces, macOS Seatbelt, Windows restricted tokens
//! - A TOML config file and the `agent-sandbox` command line

pub mod cli;
pub mod config;
pub mod paths;
pub mod sandbox;

pub use config::Config;
pub use sandbox::{Command, IsolationMode, Sandbox, SandboxError};
