//! HTTP request handlers for the REST API.

pub mod event;
pub mod hook;
pub mod run;
pub mod workflow;
