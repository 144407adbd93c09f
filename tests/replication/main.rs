//! Replication Integration Tests
//!
//! End-to-end behavior of a node across the workspace crates.

mod common;

mod abort_queue;
mod apply_path;
mod cache_pin;
mod node_lifecycle;
