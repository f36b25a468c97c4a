//! Request extractors.

pub mod organization;
pub mod query;
