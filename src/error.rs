//! Error taxonomy for the analysis layer
//!
//! Providers always return one of these to the orchestrator. The orchestrator
//! classifies through `kind()` before deciding whether to fall back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("API credential is not configured")]
    CredentialMissing,

    #[error("API credential was rejected")]
    InvalidCredential,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error ({status}): {detail}")]
    ServerError { status: u16, detail: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),

    #[error("Empty response from provider")]
    EmptyResponse,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Request cancelled")]
    Cancelled,
}

pub type AnalysisOutcome<T> = Result<T, AnalysisError>;

/// Fieldless classification of an `AnalysisError`, stable for UI lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CredentialMissing,
    InvalidCredential,
    RateLimitExceeded,
    ServerError,
    NetworkError,
    UnknownError,
    EmptyResponse,
    InvalidInput,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CredentialMissing => "credential_missing",
            ErrorKind::InvalidCredential => "invalid_credential",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::UnknownError => "unknown_error",
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::CredentialMissing => ErrorKind::CredentialMissing,
            AnalysisError::InvalidCredential => ErrorKind::InvalidCredential,
            AnalysisError::RateLimitExceeded => ErrorKind::RateLimitExceeded,
            AnalysisError::ServerError { .. } => ErrorKind::ServerError,
            AnalysisError::NetworkError(_) => ErrorKind::NetworkError,
            AnalysisError::UnknownError(_) => ErrorKind::UnknownError,
            AnalysisError::EmptyResponse => ErrorKind::EmptyResponse,
            AnalysisError::InvalidInput(_) => ErrorKind::InvalidInput,
            AnalysisError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Detail string for rendering next to a localized kind message
    pub fn detail(&self) -> Option<&str> {
        match self {
            AnalysisError::ServerError { detail, .. }
            | AnalysisError::NetworkError(detail)
            | AnalysisError::UnknownError(detail)
            | AnalysisError::InvalidInput(detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Map a non-success HTTP status to the error taxonomy
pub fn classify_status(status: u16, body: &str) -> AnalysisError {
    match status {
        401 => AnalysisError::InvalidCredential,
        429 => AnalysisError::RateLimitExceeded,
        500..=599 => AnalysisError::ServerError {
            status,
            detail: body.to_string(),
        },
        _ => AnalysisError::NetworkError(format!("HTTP {}: {}", status, body)),
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), &err.to_string());
        }
        if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            AnalysisError::NetworkError(err.to_string())
        } else {
            AnalysisError::UnknownError(err.to_string())
        }
    }
}

impl From<AnalysisError> for String {
    fn from(err: AnalysisError) -> String {
        err.to_string()
    }
}
