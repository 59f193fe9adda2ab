use crate::identity::StorageKey;

/// Outcomes the host maps onto its own error taxonomy.
///
/// Only transport-level failures are retried, and those never surface here
/// directly: once every candidate endpoint has been tried they collapse into
/// [`StoreError::BackendUnavailable`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: StorageKey },

    #[error("requested range not satisfiable: {key}")]
    RangeNotSatisfiable { key: StorageKey },

    #[error("backend unavailable after {attempts} attempt(s): {last_error}")]
    BackendUnavailable { attempts: usize, last_error: String },

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's byte source failed, or the caller aborted the operation.
    /// Nothing was committed and no endpoint was penalized.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
