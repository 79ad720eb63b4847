//! Deterministic, pure logic shared by the build and run stages.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod protocol;
pub mod requirements;
pub mod resolver;
pub mod types;
pub mod workflow;
