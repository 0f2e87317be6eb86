use thiserror::Error;

/// Result type for loresync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in loresync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid document id '{id}': {reason}")]
    InvalidDocumentId { id: String, reason: String },

    #[error("Missing connection input: {0}")]
    MissingInput(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Local store error: {0}")]
    LocalStore(String),

    #[error("Malformed markup: {0}")]
    Markup(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Backing store unavailable for project {project}")]
    StoreUnavailable { project: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Markers that identify an authentication failure in transport error text
    const AUTH_MARKERS: [&'static str; 6] = [
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "permission denied",
        "authentication",
    ];

    /// Classify a raw transport failure message.
    ///
    /// Authentication failures are a terminal branch for the channel, everything
    /// else is treated as a transient network error.
    pub fn from_transport_text(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_auth_failure(&message) {
            SyncError::Unauthorized(message)
        } else {
            SyncError::Transport(message)
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }
}

/// Check error text for authentication failure markers
pub fn is_auth_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    SyncError::AUTH_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
