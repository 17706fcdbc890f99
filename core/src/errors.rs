/// Error types for the orchestration kernel.
use thiserror::Error;

/// The exhaustive set of error kinds the kernel surfaces.
///
/// `Conflict`/`NotFound` are frequently *expected* outcomes of a race (two
/// agents racing to claim the same task) rather than failures; callers that
/// need to distinguish "lost the race" from "something broke" should prefer
/// the `Option`-returning lifecycle methods, which return `Ok(None)` instead
/// of `Err(Conflict)` for that specific case.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A mutation's precondition was not met (e.g. accept on a non-offered task).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A row or agent referenced by the caller does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was missing or had an invalid field.
    #[error("bad request: {field}: {reason}")]
    BadRequest { field: String, reason: String },

    /// Missing or invalid bearer token / webhook signature.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The database file is on an older/incompatible schema.
    #[error("migration failed: {0} (remediation: {1})")]
    MigrationFailed(String, String),

    /// An outbound call to a third-party service failed. Never fatal to the
    /// causing transaction; callers get `Ok(false)` rather than propagating
    /// this, but the variant exists so internals can model the failure.
    #[error("external call failed: {0}")]
    External(String),
}

impl KernelError {
    pub fn bad_request(field: impl Into<String>, reason: impl Into<String>) -> Self {
        KernelError::BadRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn migration_failed(detail: impl Into<String>) -> Self {
        KernelError::MigrationFailed(
            detail.into(),
            "delete the database file to rebuild from scratch, or restore from backup".into(),
        )
    }
}

impl From<sqlx::Error> for KernelError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => KernelError::NotFound("row not found".into()),
            other => KernelError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::BadRequest {
            field: "body".into(),
            reason: e.to_string(),
        }
    }
}

/// Result type used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;
