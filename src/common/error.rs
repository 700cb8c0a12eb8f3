//! Error types for racegate

use std::io;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Malformed handshake acknowledgement from a candidate path.
    /// Treated as a connect failure for that candidate, eligible for retry.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DNS error: {0}")]
    Dns(String),

    /// A candidate scored worse than another during live racing.
    /// Internal to a race session, never surfaced to the caller.
    #[error("Race lost: {0}")]
    RaceFail(String),

    /// No data within the idle window. Internal unless verification
    /// also fails, in which case it escalates to candidate failure.
    #[error("Idle timeout: {0}")]
    IdleTimeout(String),

    /// Every candidate exhausted its retries.
    #[error("All candidates failed: {0}")]
    AllCandidatesFailed(String),

    /// DNS resolution and proxy list both empty for a destination.
    #[error("No usable channel for destination: {0}")]
    DiagnosisUnavailable(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn dns<S: Into<String>>(msg: S) -> Self {
        Error::Dns(msg.into())
    }

    pub fn race_fail<S: Into<String>>(msg: S) -> Self {
        Error::RaceFail(msg.into())
    }

    pub fn idle_timeout<S: Into<String>>(msg: S) -> Self {
        Error::IdleTimeout(msg.into())
    }

    pub fn all_failed<S: Into<String>>(msg: S) -> Self {
        Error::AllCandidatesFailed(msg.into())
    }

    pub fn diagnosis_unavailable<S: Into<String>>(msg: S) -> Self {
        Error::DiagnosisUnavailable(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    /// True for errors that count as an ordinary candidate loss inside a
    /// race session rather than something worth reporting outward.
    pub fn is_candidate_local(&self) -> bool {
        matches!(self, Error::RaceFail(_) | Error::IdleTimeout(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::protocol("invalid ack");
        assert_eq!(e.to_string(), "Protocol error: invalid ack");
    }

    #[test]
    fn test_candidate_local() {
        assert!(Error::race_fail("outscored").is_candidate_local());
        assert!(Error::idle_timeout("quiet").is_candidate_local());
        assert!(!Error::all_failed("done").is_candidate_local());
    }
}
