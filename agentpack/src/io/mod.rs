//! Side-effecting adapters: filesystem, network, archives and the sandbox.
//!
//! Modules here perform I/O and are kept thin so core logic stays pure.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod discover;
pub mod events;
pub mod fetch;
pub mod manifest;
pub mod registry;
pub mod sandbox;
