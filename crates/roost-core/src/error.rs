// ── Core error types ──
//
// User-facing errors from roost-core. Consumers never see raw HTTP
// status codes or JSON parse failures directly; the
// `From<roost_api::Error>` impl translates wire-layer errors into
// domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach the service: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Backend is not connected")]
    Disconnected,

    #[error("Request timed out")]
    Timeout,

    // ── Request errors ───────────────────────────────────────────────
    #[error("Service error: {message}")]
    Api { message: String, status: Option<u16> },

    /// A second transaction was registered under a live key.
    #[error("Transaction already pending for key {key}")]
    TransactionPending { key: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<roost_api::Error> for CoreError {
    fn from(err: roost_api::Error) -> Self {
        match err {
            roost_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            roost_api::Error::TwoFactor { message } => CoreError::AuthenticationFailed {
                message: format!("second-factor challenge failed: {message}"),
            },
            roost_api::Error::SessionExpired => CoreError::AuthenticationFailed {
                message: "session expired -- re-authentication required".into(),
            },
            roost_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout
                } else if e.is_connect() {
                    CoreError::ConnectionFailed { reason: e.to_string() }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            roost_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            roost_api::Error::Tls(message) => CoreError::ConnectionFailed {
                reason: format!("TLS error: {message}"),
            },
            roost_api::Error::Api { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            roost_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("deserialization error: {message}"))
            }
            roost_api::Error::EventStream(reason) => CoreError::ConnectionFailed { reason },
        }
    }
}
