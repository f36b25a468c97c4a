//! Workflow execution building blocks.
//!
//! - `definition` -- YAML parsing and structural validation
//! - `dag` -- step graph cycle detection
//! - `retry` -- backoff delays and attempt eligibility
//! - `step` / `run` -- the step and run state machines
//! - `dispatcher` -- pure next-action planning for a run
//! - `timers` -- min-heap of retry, resume, timeout, and deadline wake-ups
//! - `scheduler` -- cron triggers

pub mod dag;
pub mod definition;
pub mod dispatcher;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod step;
pub mod timers;
