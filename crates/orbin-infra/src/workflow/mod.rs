//! Trigger-side infrastructure.

pub mod webhook_handler;
