//! Chain-index API error types.
//!
//! Index failures fall into two kinds, and the distinction drives the retry
//! logic:
//!
//! - **Transient** errors are retriable with backoff (5xx, 429, network
//!   timeouts). They also degrade gracefully at the tick level: the scanner
//!   simply tries again on the next poll.
//! - **Permanent** errors (most 4xx, bad credentials, malformed responses)
//!   are returned immediately and surface in the logs for operator action.

use std::fmt;

use thiserror::Error;

/// The kind of index error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexErrorKind {
    /// Safe to retry with backoff: 5xx, 429, connection-level failures.
    Transient,

    /// Requires operator attention: 4xx (bad project key, unknown address),
    /// undecodable payloads.
    Permanent,
}

impl IndexErrorKind {
    /// Returns true if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, IndexErrorKind::Transient)
    }
}

/// A chain-index API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct IndexError {
    pub kind: IndexErrorKind,

    /// The HTTP status code, if the request got far enough to have one.
    pub status: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "index API error (HTTP {}): {}", code, self.message),
            None => write!(f, "index API error: {}", self.message),
        }
    }
}

impl IndexError {
    /// Creates a transient error without an underlying reqwest source.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: IndexErrorKind::Transient,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent error without an underlying reqwest source.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: IndexErrorKind::Permanent,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes an HTTP status from the index.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => IndexErrorKind::Transient,
            code if (500..600).contains(&code) => IndexErrorKind::Transient,
            _ => IndexErrorKind::Permanent,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes a transport-level reqwest error.
    ///
    /// Timeouts and connection failures are transient; everything else
    /// (builder misuse, body decode failures) is permanent.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let kind = match status {
            Some(code) => Self::from_status(code, "").kind,
            None if err.is_timeout() || err.is_connect() || err.is_request() => {
                IndexErrorKind::Transient
            }
            None => IndexErrorKind::Permanent,
        };
        Self {
            kind,
            status,
            message: err.to_string(),
            source: Some(err),
        }
    }
}
