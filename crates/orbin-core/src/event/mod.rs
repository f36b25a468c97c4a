//! Event bus carrying execution state changes to workers and side channels.

pub mod bus;

pub use bus::EventBus;
