use crate::job::{HistoryEntry, Jid};
use thiserror::Error;

/// Context attached to a rejected job result.
///
/// Carries enough of the job to diagnose the failure without going back to
/// the store.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub jid: Jid,
    pub queue: String,
    pub history: Vec<HistoryEntry>,
    pub canceled: bool,
}

#[derive(Error, Debug)]
pub enum BeehiveError {
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Not found")]
    JobNotFound { jid: String },

    #[error("Expired")]
    Expired { jid: Jid },

    #[error("Canceled")]
    Canceled { jid: Jid },

    #[error("{message}")]
    Validation { message: String },

    #[error("{message}")]
    Timeout { message: String },

    #[error("{}", .0.message)]
    JobFailed(Box<JobFailure>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BeehiveError {
    /// True for explicit or inherited cancellation, whichever way it surfaced.
    pub fn is_canceled(&self) -> bool {
        match self {
            BeehiveError::Canceled { .. } => true,
            BeehiveError::JobFailed(failure) => failure.canceled,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BeehiveError::JobNotFound { .. })
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, BeehiveError::Expired { .. })
    }

    /// The failure context of a rejected job result, if this is one.
    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            BeehiveError::JobFailed(failure) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        BeehiveError::Store {
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for BeehiveError {
    fn from(err: toml::de::Error) -> Self {
        BeehiveError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for BeehiveError {
    fn from(err: toml::ser::Error) -> Self {
        BeehiveError::Config(format!("TOML serialization error: {}", err))
    }
}
