use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Input rejected before any state was touched.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No user session is active.
    #[error("user not authenticated")]
    Authentication,

    /// Only surfaced by explicit remote operations such as `refresh`; every
    /// mutator falls back to local state instead.
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(#[from] RemoteError),
}
