//! Sandboxed command execution for agent-generated commands.
//!
//! A [`Sandbox`] holds the policy (writable directories, working directory,
//! environment, timeout, isolation mode) and hands out [`Command`]s. Under
//! [`IsolationMode::Os`] the command runs through the platform backend:
//! - Linux: fresh user/mount/PID/IPC/UTS namespaces via `unshare`
//! - macOS: Seatbelt SBPL profile via `sandbox-exec`
//! - Windows: restricted token of a dedicated low-privilege account

pub mod acl;
pub mod backend;
pub mod command;
pub mod context;
pub mod credential;
pub mod detect;
pub mod error;
pub mod executor;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod native;
pub mod policy;
pub mod process;
pub mod restriction;
#[cfg(windows)]
pub mod windows;

pub use command::{Command, Input, Output, SharedBuffer};
pub use detect::{PlatformInfo, get_platform_info};
pub use error::{ErrorKind, Result, SandboxError};
pub use executor::{CapturedOutput, run_captured};
pub use policy::{Config, IsolationMode, Sandbox};
