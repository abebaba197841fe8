// SPDX-License-Identifier: MIT
//! Remote-API error taxonomy.
//!
//! Every failure from the remote service is classified into one of these
//! variants at the HTTP boundary. The classification drives retry policy:
//! transient errors are retried or accumulated as soft failures, auth errors
//! enter the confirm-before-invalidate protocol, and validation errors fail
//! synchronously with no retry.

use std::time::Duration;
use thiserror::Error;

/// Classified error from a remote-service operation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request did not complete within its deadline. Always ambiguous —
    /// the server may or may not have processed it.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// TCP/TLS/DNS-level failure before a response was received.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered 401/403. One occurrence is *not* proof of a
    /// terminated session — see the session verifier's confirmation policy.
    #[error("unauthorized (status {status})")]
    Unauthorized { status: u16 },

    /// 5xx-class response. Treated as transient.
    #[error("server error (status {status})")]
    Server { status: u16 },

    /// The identity credential cannot be sent over the wire (illegal
    /// characters for an HTTP header). Fatal, never retried.
    #[error("invalid identity credential: {0}")]
    Validation(String),

    /// The server answered with something we could not interpret.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ApiError {
    /// True for errors that look like an authentication failure and feed the
    /// confirm-before-invalidate protocol.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// True for errors that must never, on their own, change session state:
    /// timeouts, connection failures, 5xx responses, and garbled replies.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout(_)
                | ApiError::Connection(_)
                | ApiError::Server { .. }
                | ApiError::Protocol(_)
        )
    }

    /// True for errors that are fatal immediately, with no retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Validation(_))
    }
}

/// Map a `reqwest` transport error into the taxonomy.
///
/// Status-code classification happens at the call site (the response is still
/// available there); this only covers errors raised before a status exists.
pub fn classify_transport(err: reqwest::Error, deadline: Duration) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(deadline)
    } else if err.is_connect() {
        ApiError::Connection(err.to_string())
    } else if err.is_decode() {
        ApiError::Protocol(err.to_string())
    } else {
        ApiError::Connection(err.to_string())
    }
}

/// Map an HTTP status code into the taxonomy. `None` means the status is a
/// success and carries no error.
pub fn classify_status(status: u16) -> Option<ApiError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ApiError::Unauthorized { status }),
        500..=599 => Some(ApiError::Server { status }),
        other => Some(ApiError::Protocol(format!("unexpected status {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_classify_as_unauthorized() {
        assert!(classify_status(401).unwrap().is_auth());
        assert!(classify_status(403).unwrap().is_auth());
    }

    #[test]
    fn server_errors_are_transient() {
        let e = classify_status(503).unwrap();
        assert!(e.is_transient());
        assert!(!e.is_auth());
    }

    #[test]
    fn success_statuses_carry_no_error() {
        assert!(classify_status(200).is_none());
        assert!(classify_status(204).is_none());
    }

    #[test]
    fn validation_is_fatal_not_transient() {
        let e = ApiError::Validation("bad token".into());
        assert!(e.is_fatal());
        assert!(!e.is_transient());
        assert!(!e.is_auth());
    }

    #[test]
    fn timeout_is_transient_not_fatal() {
        let e = ApiError::Timeout(Duration::from_secs(10));
        assert!(e.is_transient());
        assert!(!e.is_fatal());
    }
}
