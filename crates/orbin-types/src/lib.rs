//! Shared domain types for Orbin.
//!
//! This crate contains the types used across the execution core: workflow
//! definitions, runs and step executions, execution events, organization
//! settings, engine configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod organization;
pub mod run;
pub mod workflow;
