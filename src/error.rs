//! Error type shared by the coordination and metering layers.
//!
//! Request handlers match on [`MeteringError`] exhaustively instead of
//! sniffing messages; [`MeteringError::http_status`] gives the status the
//! HTTP layer should surface for each kind.

use crate::coordination::resp::ProtocolError;

/// Errors surfaced by locks, counters, the credit ledger and the config stores.
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    /// Another request holds the lock for this key. Retryable.
    #[error("'{key}' is currently being updated in another request; please retry")]
    LockHeld { key: String },

    /// The user's balance does not cover the task. Nothing was deducted.
    #[error("not enough credits: required {required}, remaining {remaining}")]
    InsufficientCredits { required: u32, remaining: u32 },

    /// A coordination backend is configured but the call failed.
    ///
    /// Never downgraded to uncoordinated execution: callers that believed
    /// cross-process exclusion was active must see the failure.
    #[error("coordination backend unreachable: {reason}")]
    CoordinationUnreachable { reason: String },

    /// The backend answered with bytes that are not a valid reply.
    #[error("malformed reply from coordination backend: {0}")]
    Protocol(#[from] ProtocolError),

    /// The backend answered with a well-formed reply of the wrong shape.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// Rejected admin or settings input (unknown tier, bad target, ...).
    #[error("{0}")]
    InvalidInput(String),

    /// Failure in the durable store or another internal collaborator.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MeteringError {
    pub(crate) fn unreachable(reason: impl Into<String>) -> Self {
        Self::CoordinationUnreachable {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// HTTP status the route layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::LockHeld { .. } => 409,
            Self::InsufficientCredits { .. } => 402,
            Self::CoordinationUnreachable { .. }
            | Self::Protocol(_)
            | Self::UnexpectedReply { .. } => 503,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Whether the same request may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::CoordinationUnreachable { .. }
        )
    }
}

impl From<rusqlite::Error> for MeteringError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(e.into())
    }
}
