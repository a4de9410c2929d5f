// src/error.rs
//! Error taxonomy shared across the pipeline.
//!
//! Everything below `SourceSetError` is recoverable inside a running cycle:
//! it ends processing of one source (or one line) and shows up in
//! `CycleStats`. Only an invalid source set or settings file is fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Protocol;

/// Flat classification used for counters and reputation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FetchTimeout,
    FetchRateLimited,
    FetchBreakerOpen,
    FetchHttpError,
    DecodeFailure,
    ParseMalformed,
    ParseSecurityRejected,
    CacheUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FetchTimeout => "fetch_timeout",
            ErrorKind::FetchRateLimited => "fetch_rate_limited",
            ErrorKind::FetchBreakerOpen => "fetch_breaker_open",
            ErrorKind::FetchHttpError => "fetch_http_error",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::ParseMalformed => "parse_malformed",
            ErrorKind::ParseSecurityRejected => "parse_security_rejected",
            ErrorKind::CacheUnavailable => "cache_unavailable",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("host {host} is rate limited")]
    RateLimited { host: String },

    #[error("circuit breaker open for source {0}")]
    BreakerOpen(String),

    #[error("http error (status {status:?}): {message}")]
    Http { status: Option<u16>, message: String },

    #[error("cycle deadline reached before the fetch could start")]
    DeadlineExceeded,
}

impl FetchError {
    /// `None` for outcomes outside the error taxonomy (deadline skips).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            FetchError::Timeout(_) => Some(ErrorKind::FetchTimeout),
            FetchError::RateLimited { .. } => Some(ErrorKind::FetchRateLimited),
            FetchError::BreakerOpen(_) => Some(ErrorKind::FetchBreakerOpen),
            FetchError::Http { .. } => Some(ErrorKind::FetchHttpError),
            FetchError::DeadlineExceeded => None,
        }
    }

    /// Failures that say something about the source itself, as opposed to
    /// our own throttling.
    pub fn counts_against_source(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Http { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("gzip body could not be inflated: {0}")]
    Gzip(String),

    #[error("decoded body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("body is not valid UTF-8 text")]
    NotText,

    #[error("unrecognized body encoding")]
    Unrecognized,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed {protocol} link: {reason}")]
    Malformed { protocol: Protocol, reason: String },

    #[error("rejected by content screening: {0}")]
    SecurityRejected(String),
}

impl ParseError {
    pub(crate) fn malformed(protocol: Protocol, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::SecurityRejected(_) => ErrorKind::ParseSecurityRejected,
            ParseError::UnsupportedScheme(_) | ParseError::Malformed { .. } => {
                ErrorKind::ParseMalformed
            }
        }
    }

    pub fn is_security(&self) -> bool {
        matches!(self, ParseError::SecurityRejected(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache tier unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry could not be (de)serialized: {0}")]
    Corrupt(String),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CacheUnavailable
    }
}

/// Load-time error for a malformed source set entry, pinned to one field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceSetError {
    #[error("sources[{index}].{field}: {message}")]
    Field {
        index: usize,
        field: &'static str,
        message: String,
    },

    #[error("duplicate source id {id:?} at sources[{index}]")]
    DuplicateId { index: usize, id: String },

    #[error("source set is empty")]
    Empty,

    #[error("source set could not be parsed: {0}")]
    Syntax(String),
}

impl SourceSetError {
    pub(crate) fn field(index: usize, field: &'static str, message: impl Into<String>) -> Self {
        SourceSetError::Field {
            index,
            field,
            message: message.into(),
        }
    }
}
