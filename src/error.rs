use thiserror::Error;

/// Failure reasons attached to individual negative results. These travel as
/// plain strings on [`crate::MatchResult::error`] so callers can persist or
/// display them without matching on the error enum.
pub mod reason {
    pub const CONTENTION_EXCEEDED: &str = "contention_exceeded";
    pub const TIMEOUT_EXCEEDED: &str = "timeout_exceeded";
    pub const FETCH_FAILED: &str = "fetch_failed";
    pub const STORE_FAILED: &str = "store_failed";
    pub const CANCELLED: &str = "cancelled";
    pub const INVALID_AMOUNT: &str = "invalid_amount";
    pub const DUPLICATE_NEGATIVE: &str = "duplicate_negative";
}

#[derive(Debug, Error)]
pub enum MatchError {
    /// Candidate retrieval failed at the transport level. Retryable failures
    /// are re-attempted with backoff before the group is failed.
    #[error("candidate fetch failed: {message}")]
    CandidateFetch { message: String, retryable: bool },

    /// A locked row's re-read balance no longer covers the planned decrement;
    /// the group plan was computed against balances that have since moved.
    #[error("stale plan: line {line_id} has {remaining_cents} remaining, planned {planned_cents}")]
    StaleAllocation {
        line_id: i64,
        planned_cents: i64,
        remaining_cents: i64,
    },

    /// The batch id already exists and is not resumable.
    #[error("batch {batch_id} already exists (status {status})")]
    DuplicateBatch { batch_id: String, status: String },

    /// A commit tripped a uniqueness or check constraint. This indicates a
    /// bug in plan construction and is fatal for the batch.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Per-group or per-batch deadline exceeded.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// The batch was cancelled by the caller.
    #[error("batch cancelled")]
    Cancelled,

    /// Rejected engine input (non-positive magnitude, malformed amount).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other store failure (pool exhaustion, broken connection outside a
    /// fetch, unexpected row shapes).
    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MatchError {
    pub fn retryable_fetch(&self) -> bool {
        matches!(self, MatchError::CandidateFetch { retryable: true, .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, MatchError::StaleAllocation { .. })
    }

    /// The per-negative reason string reported when a whole group fails.
    pub(crate) fn group_failure_reason(&self) -> &'static str {
        match self {
            MatchError::StaleAllocation { .. } => reason::CONTENTION_EXCEEDED,
            MatchError::CandidateFetch { .. } => reason::FETCH_FAILED,
            MatchError::Timeout(_) => reason::TIMEOUT_EXCEEDED,
            MatchError::Cancelled => reason::CANCELLED,
            _ => reason::STORE_FAILED,
        }
    }
}

// SQLSTATE 40001 (serialization_failure) surfaces when a FOR UPDATE wakes up
// behind a concurrent commit under repeatable read; that is a stale plan, not
// a transport failure. 23505/23514 are unique/check violations.
impl From<sqlx::Error> for MatchError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some("40001") => {
                    return MatchError::StaleAllocation {
                        line_id: 0,
                        planned_cents: 0,
                        remaining_cents: 0,
                    }
                }
                Some("23505") | Some("23514") => return MatchError::Integrity(db.to_string()),
                _ => {}
            }
        }
        MatchError::Store(e.to_string())
    }
}
