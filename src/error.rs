//! CCA core error types.

use thiserror::Error;

/// Result type for CCA core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// CCA core error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A filesystem operation failed.
    #[error("filesystem error: {0}")]
    Io(String),

    /// PEM/DER/JWT decoding or parsing failed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A CSR's self-signature failed to verify.
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// A CSR or referral ticket violated policy (subject mismatch, bad
    /// issuer/audience, expired, wrong algorithm, ...).
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// A PSK candidate had the wrong format or matched no active/grace row.
    #[error("invalid PSK")]
    InvalidPsk,

    /// A unique constraint was violated on insert (serial or PSK id collision).
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    /// A lookup by serial, name, or id found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A caller passed a programmatically invalid argument (unknown
    /// cert_type, empty id, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A retryable database conflict that exhausted its retry budget.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// The calling context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Key generation or signing failed in the underlying crypto primitive.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The database layer reported a failure outside the conflict/retry path.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        if is_conflict(&e) {
            Self::TransactionConflict(e.to_string())
        } else {
            Self::Storage(e.to_string())
        }
    }
}

/// True if a `rusqlite` error represents a retryable write conflict (a busy
/// or locked database) rather than a terminal storage failure.
fn is_conflict(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_psk_message_carries_no_candidate_contents() {
        let err = Error::InvalidPsk;
        assert_eq!(err.to_string(), "invalid PSK");
    }

    #[test]
    fn duplicate_carries_context() {
        let err = Error::Duplicate("serial abc123".into());
        assert!(err.to_string().contains("abc123"));
    }
}
