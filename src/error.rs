//! Error types for scanning, checkpointing and fleet dispatch.
//!
//! Errors are split by who can act on them:
//! - [`ScrapeError`]: page, session and listing failures inside one worker
//! - [`CheckpointError`]: local persistence failures
//! - [`WorkerError`]: why a worker run ended early
//! - [`FleetError`] and [`ShardError`]: cloud, readiness and SSH failures,
//!   the latter tagged with the shard and instance so the operator can retry
//!   just that shard.

use crate::models::Shard;
use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Classifies errors that are expected to clear after a recovery action.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("stale element reference: {0}")]
    StaleElement(String),

    #[error("click on {0} was intercepted")]
    ClickIntercepted(String),

    #[error("no such element: {0}")]
    NoSuchElement(String),

    #[error("article container not found at {0}")]
    ContainerNotFound(String),

    #[error("browser session error: {0}")]
    Session(String),

    #[error("webdriver error ({code}): {message}")]
    WebDriver { code: String, message: String },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl Transient for ScrapeError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::Timeout(_) | ScrapeError::StaleElement(_) | ScrapeError::ClickIntercepted(_)
        )
    }
}

impl ScrapeError {
    /// The browser session itself is gone; nothing more can be scanned with it.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, ScrapeError::Session(_))
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScrapeError::Timeout(err.to_string())
        } else {
            ScrapeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(err: serde_json::Error) -> Self {
        ScrapeError::Parse(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("scan session failed: {0}")]
    Session(#[from] ScrapeError),

    #[error("listing for {date} failed: {source}")]
    Listing {
        date: NaiveDate,
        #[source]
        source: ScrapeError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("compute API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("operation {operation} failed: {message}")]
    Operation { operation: String, message: String },

    #[error("instance {instance} not ready after {waited:?}")]
    ReadinessTimeout { instance: String, waited: Duration },

    #[error("instance {instance} has no external address")]
    NoAddress { instance: String },

    #[error("ssh to {host} failed: {message}")]
    Ssh { host: String, message: String },

    #[error("remote command exited with {status}: {stderr}")]
    RemoteCommand { status: i32, stderr: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        FleetError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Parse(err.to_string())
    }
}

/// A fleet failure pinned to the shard and instance it happened on.
#[derive(Debug, Error)]
#[error("shard {shard} on instance {instance}: {source}")]
pub struct ShardError {
    pub shard: Shard,
    pub instance: String,
    #[source]
    pub source: FleetError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DateRange;

    #[test]
    fn test_transient_classification() {
        assert!(ScrapeError::Timeout("x".into()).is_transient());
        assert!(ScrapeError::StaleElement("x".into()).is_transient());
        assert!(ScrapeError::ClickIntercepted("x".into()).is_transient());
        assert!(!ScrapeError::Session("gone".into()).is_transient());
        assert!(!ScrapeError::ContainerNotFound("x".into()).is_transient());
    }

    #[test]
    fn test_only_session_errors_lose_the_session() {
        assert!(ScrapeError::Session("invalid session id".into()).is_session_lost());
        assert!(!ScrapeError::NoSuchElement("comment-text".into()).is_session_lost());
        assert!(!ScrapeError::Network("reset".into()).is_session_lost());
        let dns = ScrapeError::WebDriver {
            code: "unknown error".into(),
            message: "net::ERR_NAME_NOT_RESOLVED".into(),
        };
        assert!(!dns.is_session_lost());
    }

    #[test]
    fn test_shard_error_carries_context() {
        let range = DateRange::new(
            "2022-10-25".parse().unwrap(),
            "2022-10-26".parse().unwrap(),
        )
        .unwrap();
        let err = ShardError {
            shard: Shard { index: 1, range },
            instance: "top-comment-1-abc123".to_string(),
            source: FleetError::ReadinessTimeout {
                instance: "top-comment-1-abc123".to_string(),
                waited: Duration::from_secs(600),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("#1 [2022-10-25..=2022-10-26]"));
        assert!(msg.contains("top-comment-1-abc123"));
    }
}
