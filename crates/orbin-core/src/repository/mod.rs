//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (orbin-infra) implements. The core crate never depends on any specific
//! storage technology. `memory` provides a process-local implementation for
//! tests and ephemeral deployments.

pub mod memory;
pub mod organization;
pub mod workflow;
