//! Fault taxonomy for probes and the per-target pipeline
//!
//! Probes classify every fault into a [`ProbeError`] and recover locally;
//! only [`ProbeError::RateLimited`] ever leaves the pipeline.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::ProbeResult;

/// Errors observed while probing a single target.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Name resolution failed or returned nothing.
    #[error("resolution failure: {0}")]
    Resolution(String),
    /// Connection refused, unreachable, reset or timed out in the kernel.
    #[error("connection failure: {0}")]
    Connection(String),
    /// A deadline expired before the peer answered.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The server answered HTTP 429. Carries the degraded result of the attempt.
    #[error("rate limited (HTTP 429)")]
    RateLimited { last: Box<ProbeResult> },
    /// The reply failed structural validation.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Raw sockets need elevated privilege.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Anything else.
    #[error("{0}")]
    Unclassified(String),
}

impl ProbeError {
    /// Whether the orchestrator should retry the target.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProbeError::RateLimited { .. })
    }

    /// Classify a failed HTTP exchange. Timeouts carry the deadline that
    /// expired: `connect_deadline` while connecting, `deadline` otherwise.
    pub fn from_reqwest(err: reqwest::Error, connect_deadline: Duration, deadline: Duration) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout(if err.is_connect() { connect_deadline } else { deadline })
        } else if err.is_connect() {
            ProbeError::Connection(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ProbeError::Malformed(err.to_string())
        } else {
            ProbeError::Unclassified(err.to_string())
        }
    }
}

impl From<io::Error> for ProbeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(err.to_string()),
            io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable => ProbeError::Connection(err.to_string()),
            _ => ProbeError::Unclassified(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "raw socket");
        assert!(matches!(ProbeError::from(denied), ProbeError::PermissionDenied(_)));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ProbeError::from(refused), ProbeError::Connection(_)));

        let kernel_timeout = io::Error::new(io::ErrorKind::TimedOut, "connection timed out");
        let err = ProbeError::from(kernel_timeout);
        assert!(matches!(err, ProbeError::Connection(_)));
        assert!(!err.to_string().contains("0ns"));
    }

    #[test]
    fn test_timeout_reports_its_deadline() {
        let err = ProbeError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "timed out after 250ms");
    }

    #[test]
    fn test_only_rate_limited_retries() {
        let last = Box::new(ProbeResult::partial("example.com", "429"));
        assert!(ProbeError::RateLimited { last }.is_rate_limited());
        assert!(!ProbeError::Resolution("nx".into()).is_rate_limited());
        assert!(!ProbeError::Unclassified("boom".into()).is_rate_limited());
    }
}
