use thiserror::Error;

/// Failures reported by a [`crate::ledger::SignupLedger`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A uniqueness constraint rejected the write.
    #[error("uniqueness constraint violated")]
    Conflict,

    /// The addressed record does not exist.
    #[error("record not found")]
    NotFound,

    /// The admission lease the write was made under expired or was taken over.
    #[error("admission lease for workshop {0} is no longer held")]
    LeaseLost(i32),

    /// The storage backend failed (connection, query or worker thread).
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<diesel::result::Error> for LedgerError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => LedgerError::NotFound,
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, _) => {
                LedgerError::Conflict
            }
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(e: r2d2::Error) -> Self {
        LedgerError::Storage(format!("connection pool: {}", e))
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(e: tokio::task::JoinError) -> Self {
        LedgerError::Storage(format!("blocking task failed: {}", e))
    }
}

/// Errors returned to request handlers by the admission engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignupError {
    /// The user already holds a confirmed or waitlisted signup for this workshop.
    #[error("user '{user_id}' already has an active signup for workshop {workshop_id}")]
    DuplicateSignup { user_id: String, workshop_id: i32 },

    /// The workshop's admission lock could not be acquired within the bounded wait.
    #[error("admission lock for workshop {workshop_id} is unavailable")]
    LockUnavailable { workshop_id: i32 },

    /// Storage rejected a write after the admission checks passed.
    #[error("ledger write failed: {0}")]
    LedgerWrite(LedgerError),

    /// Storage failed while reading, before anything was written.
    #[error("ledger read failed: {0}")]
    LedgerRead(LedgerError),

    /// The workshop is unknown or does not belong to the given conference.
    #[error("workshop {0} not found")]
    WorkshopNotFound(i32),

    #[error("signup {0} not found")]
    SignupNotFound(i32),

    #[error("signup {0} is already cancelled")]
    AlreadyCancelled(i32),

    /// The task running the critical section died before reporting a result.
    #[error("admission task aborted: {0}")]
    Internal(String),
}

impl SignupError {
    /// Whether the caller may simply retry the same request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SignupError::LockUnavailable { .. }
                | SignupError::LedgerWrite(_)
                | SignupError::LedgerRead(_)
                | SignupError::Internal(_)
        )
    }
}

impl From<tokio::task::JoinError> for SignupError {
    fn from(e: tokio::task::JoinError) -> Self {
        SignupError::Internal(e.to_string())
    }
}
