//! Offline-installable agent chains.
//!
//! This crate packages independently authored agents and their dependency
//! closure into verifiable artifacts, then runs them as a bounded chain inside
//! a sandbox. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (requirement parsing, closure
//!   resolution, the tape protocol, the workflow state machine). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, downloads, archives,
//!   the sandbox interface). Isolated to enable fakes in tests.
//!
//! Stage modules ([`vendor`], [`package`], [`verify`], [`stage`], [`engine`],
//! [`run`]) coordinate core logic with I/O to implement CLI commands.

pub mod agents;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod package;
pub mod run;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod vendor;
pub mod verify;
