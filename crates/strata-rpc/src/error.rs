//! Classified peer-call failures
//!
//! The retry machinery treats the classes differently: refused connections
//! are retried immediately within the same sync attempt, timeouts and HTTP
//! failures wait for the periodic pending timer.

use thiserror::Error;

/// A failed intra-cluster call, by failure class
#[derive(Clone, Debug, Error)]
pub enum RpcError {
    /// The peer's endpoint actively refused the connection (ECONNREFUSED
    /// and similar); typical of a node that is restarting
    #[error("connection refused: {0}")]
    Refused(String),

    /// The call exceeded its deadline
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer answered with HTTP >= 400; the response body is preserved
    #[error("{body}, status code: {status}")]
    Status { status: u16, body: String },

    /// The request could not even be constructed
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RpcError {
    #[must_use]
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused(_))
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Classify a client-side send failure
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        if is_connection_refused(err) {
            return Self::Refused(err.to_string());
        }
        if err.is_builder() || err.is_request() {
            return Self::InvalidRequest(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

/// Walk the error source chain looking for ECONNREFUSED
///
/// `reqwest` wraps the underlying `std::io::Error` several layers deep;
/// a connect error with no reachable io cause is treated as refused too.
pub fn is_connection_refused(err: &reqwest::Error) -> bool {
    match io_error_kind(err) {
        Some(kind) => kind == std::io::ErrorKind::ConnectionRefused,
        None => err.is_connect(),
    }
}

fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        cur = e.source();
    }
    None
}
