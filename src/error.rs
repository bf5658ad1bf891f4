use thiserror::Error;

#[derive(Debug, Error)]
pub enum NvrError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Assembly failed: {0}")]
    Assembly(String),

    #[error("No recorded content overlaps the requested range")]
    NotFound,

    #[error("Channel '{id}' not found")]
    ChannelNotFound { id: String },

    #[error("Vendor playback request failed: {0}")]
    Vendor(String),
}

pub type Result<T> = std::result::Result<T, NvrError>;
