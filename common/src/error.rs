use thiserror::Error;

/// Rejected command input. Raised before any mutation or store write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("timer_number must be between 1 and 6")]
    TimerNumber,
    #[error("new_days must be between 0 and 127")]
    Days,
    #[error("new_on_time must be between 0 and 1410")]
    OnTime,
    #[error("new_off_time must be between 0 and 1410")]
    OffTime,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value store read failed for `{key}`: {reason}")]
    Read { key: String, reason: String },
    #[error("key-value store write failed for `{key}`: {reason}")]
    Write { key: String, reason: String },
    #[error("key-value store commit failed: {0}")]
    Commit(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to persist schedule state")]
    Persistence(#[from] StoreError),
}

impl CommandError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Persistence(_) => 500,
        }
    }
}

/// A `/api` body that could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Not JSON, or no usable `action`. Answered like an unknown action.
    #[error("Unknown action")]
    Malformed,
    #[error("Unknown action")]
    UnknownAction,
    #[error("Invalid parameters for {action}")]
    InvalidParameters { action: String },
}
