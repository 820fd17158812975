// Shared transport configuration for building reqwest::Client instances.
//
// The service's edge fingerprints clients at the connection level, so a
// login round may need several differently shaped connections before one
// is accepted. A `FingerprintProfile` names one such shape; the auth
// engine rotates through the configured list. All clients built from one
// `TransportConfig` share a single cookie jar so trust cookies survive
// profile changes.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;

use crate::error::Error;

/// One low-level connection shape to present to the service's edge.
///
/// rustls does not expose curve pinning, so profiles vary the knobs that
/// are observable from the outside: HTTP version negotiation and the
/// maximum TLS version offered.
#[derive(Debug, Clone)]
pub struct FingerprintProfile {
    /// Short name used in logs (`"default"`, `"http1"`, ...).
    pub name: &'static str,
    /// Disable HTTP/2 negotiation.
    pub http1_only: bool,
    /// Cap the handshake at TLS 1.2.
    pub tls12_max: bool,
}

impl FingerprintProfile {
    /// The default rotation, most-modern first.
    pub fn default_set() -> Vec<Self> {
        vec![
            Self { name: "default", http1_only: false, tls12_max: false },
            Self { name: "http1", http1_only: true, tls12_max: false },
            Self { name: "compat", http1_only: true, tls12_max: true },
        ]
    }
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub cookie_jar: Arc<Jar>,
    pub profiles: Vec<FingerprintProfile>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            cookie_jar: Arc::new(Jar::default()),
            profiles: FingerprintProfile::default_set(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` shaped by the given profile.
    ///
    /// Every client shares this config's cookie jar.
    pub fn build_client(&self, profile: &FingerprintProfile) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .use_rustls_tls()
            .cookie_provider(Arc::clone(&self.cookie_jar));

        if profile.http1_only {
            builder = builder.http1_only();
        }
        if profile.tls12_max {
            builder = builder.max_tls_version(reqwest::tls::Version::TLS_1_2);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Build a client for the long-lived event stream: same jar, no
    /// request timeout (the stream is read until the server closes it).
    pub fn build_stream_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .cookie_provider(Arc::clone(&self.cookie_jar))
            .build()
            .map_err(|e| Error::Tls(format!("failed to build stream client: {e}")))
    }
}

// ── User-agent selection ─────────────────────────────────────────────

const UA_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                        (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const UA_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                      (KHTML, like Gecko) Version/17.1 Safari/605.1.15";
const UA_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Map a configured agent choice to a real user-agent string.
///
/// `!literal` uses the rest of the string as-is (for passing an agent
/// captured from a browser). `random` picks one of the named agents per
/// call, which gives each login attempt a fresh identity.
pub fn resolve_user_agent(choice: &str) -> String {
    if let Some(literal) = choice.strip_prefix('!') {
        return literal.to_owned();
    }
    match choice.to_lowercase().as_str() {
        "mac" => UA_MAC.to_owned(),
        "windows" => UA_WINDOWS.to_owned(),
        "random" => {
            let all = [UA_LINUX, UA_MAC, UA_WINDOWS];
            let idx = usize::try_from(rand::random::<u32>()).unwrap_or(0) % all.len();
            all[idx].to_owned()
        }
        _ => UA_LINUX.to_owned(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_rotation() {
        let profiles = FingerprintProfile::default_set();
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[0].name, "default");
        assert!(!profiles[0].http1_only);
        assert!(profiles[2].tls12_max);
    }

    #[test]
    fn user_agent_literal_passthrough() {
        assert_eq!(resolve_user_agent("!MyAgent/1.0"), "MyAgent/1.0");
    }

    #[test]
    fn user_agent_named_and_fallback() {
        assert_eq!(resolve_user_agent("mac"), UA_MAC);
        assert_eq!(resolve_user_agent("Windows"), UA_WINDOWS);
        // unknown names fall back to linux
        assert_eq!(resolve_user_agent("beos"), UA_LINUX);
    }

    #[test]
    fn builds_clients_for_every_profile() {
        let config = TransportConfig::default();
        for profile in &config.profiles {
            config.build_client(profile).expect("client should build");
        }
    }
}
