use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored value could not be decoded (programming error or manual edit).
    #[error("Corrupt ledger row for {subject}: {reason}")]
    Corrupt { subject: String, reason: String },
}

pub type Result<T> = std::result::Result<T, LedgerError>;
