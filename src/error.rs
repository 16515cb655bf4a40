use thiserror::Error;

use crate::fetcher::PageId;

/// Digest handshake failures. Fatal for the cycle they occur in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("device rejected the digest credentials")]
    Rejected,
    #[error("device answered 401 without a digest challenge")]
    MissingChallenge,
    #[error("malformed digest challenge: {0}")]
    BadChallenge(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Only transport-level faults are worth repeating inside one cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("page {page} no longer matches the expected layout ({detail})")]
    StructureMismatch { page: PageId, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("cannot parse `{text}` for `{label}` as a number")]
    BadNumber { label: String, text: String },
    #[error("unknown unit `{unit}` for `{label}`")]
    UnknownUnit { label: String, unit: String },
    #[error("label `{0}` appears more than once on the totals page")]
    DuplicateLabel(String),
    #[error("totals page is missing {0:?}")]
    IncompleteTotals(Vec<&'static str>),
    #[error("reading key `{0}` is not unique")]
    DuplicateKey(String),
}

/// The classified outcome of a failed poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("poll cycle cancelled")]
    Cancelled,
}

impl PollError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PollError::Fetch(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}
