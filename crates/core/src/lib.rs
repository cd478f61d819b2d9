//! Shared domain types for the post-processing dispatcher: configuration,
//! worker command construction and the heartbeat record. No I/O beyond
//! reading the config file.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod job;
