use vault_core::PlatformError;

/// Errors produced by the Discord adapter.
#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("serenity error: {0}")]
    Serenity(#[from] serenity::Error),

    #[error("no bot token configured")]
    NoToken,

    /// Not a Discord snowflake. The referenced object cannot exist.
    #[error("invalid {kind} id: {raw:?}")]
    InvalidId { kind: &'static str, raw: String },
}

impl From<DiscordError> for PlatformError {
    fn from(err: DiscordError) -> Self {
        match err {
            DiscordError::Serenity(e) => crate::platform::classify(e),
            DiscordError::InvalidId { .. } => PlatformError::NotFound(err.to_string()),
            DiscordError::NoToken => PlatformError::Transient(err.to_string()),
        }
    }
}
