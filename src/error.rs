use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("lock wait timeout: {0}")]
    LockTimeout(String),
    #[error("transaction cancelled")]
    Cancelled,
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,
    #[error("tx err: {tx_err}, rb err: {rb_err}")]
    RollbackFailure {
        #[source]
        tx_err: Box<LedgerError>,
        rb_err: Box<LedgerError>,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// True for a plain not-found and for a failed rollback whose original error was one.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::RollbackFailure { tx_err, .. } => tx_err.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
