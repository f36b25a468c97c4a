//! Infrastructure layer for Orbin.
//!
//! Contains implementations of the repository traits defined in `orbin-core`
//! (SQLite storage), the `config.toml` loader, webhook signature
//! verification, and the built-in step handlers run by the local worker.

pub mod config;
pub mod handlers;
pub mod sqlite;
pub mod workflow;
