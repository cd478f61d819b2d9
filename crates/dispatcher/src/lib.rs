//! `postproc-dispatcher` library crate.
//!
//! Re-exports internal modules for integration testing. The binary
//! entrypoint lives in `main.rs`.

pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod launcher;
pub mod pool;
