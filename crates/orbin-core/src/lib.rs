//! Execution core and repository trait definitions for Orbin.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `orbin-types` -- never on
//! `orbin-infra` or any database/IO crate.

pub mod engine;
pub mod event;
pub mod repository;
pub mod trigger;
pub mod usage;
pub mod worker;
pub mod workflow;
