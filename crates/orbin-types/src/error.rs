use thiserror::Error;

/// Errors from repository operations (used by trait definitions in orbin-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A status change that the run or step state machine does not permit.
///
/// Mutating a terminal run or step is the common case. These are surfaced to
/// callers as a distinct error kind and logged; they are never applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal {entity} transition from '{from}' to '{to}'")]
    Illegal {
        entity: &'static str,
        from: String,
        to: String,
    },
}

impl TransitionError {
    pub fn illegal(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self::Illegal {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
