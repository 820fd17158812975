use thiserror::Error;

/// Top-level error type for the `roost-api` crate.
///
/// Covers every failure mode across the wire layer: authentication,
/// two-factor handling, HTTP transport, and the event stream.
/// `roost-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed (wrong credentials, exhausted retries, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// A second-factor challenge could not be completed.
    #[error("Two-factor challenge failed: {message}")]
    TwoFactor { message: String },

    /// Cached token rejected by the validation endpoint.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or client construction error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Service ─────────────────────────────────────────────────────
    /// Non-success response from the service (either HTTP status or the
    /// `meta.code` carried inside a 200 envelope).
    #[error("Service error (code {status}): {message}")]
    Api { status: u16, message: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Event stream ────────────────────────────────────────────────
    /// The event transport failed to connect or dropped mid-stream.
    #[error("Event stream error: {0}")]
    EventStream(String),
}

impl Error {
    /// Returns `true` if this error indicates auth material has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired) || matches!(self, Self::Api { status: 401, .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::EventStream(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
