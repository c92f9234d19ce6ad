use thiserror::Error;
use vault_core::{CoreError, PlatformError};
use vault_ledger::LedgerError;

/// Errors that can occur within the lifecycle engine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    /// A stored row has an unexpected shape. Resolution of that one entity is
    /// abandoned for this cycle.
    #[error("Corrupt {entity} row {id}: {reason}")]
    Corrupt {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The requested action is not valid from the entity's current status.
    #[error("Cannot {action} {entity} {id} while {status}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        status: String,
        action: &'static str,
    },

    /// A pending or active heist already exists.
    #[error("A heist is already running: {id}")]
    HeistAlreadyRunning { id: String },

    /// Today's heist window has already closed.
    #[error("Today's heist window has closed")]
    HeistWindowClosed,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
