// ── Runtime backend configuration ──
//
// These types describe *how* to reach the service: hosts, timeouts,
// retry policy, second-factor selection, and session persistence paths.
// They carry credential data and tuning, but never touch disk
// themselves -- an outer layer (CLI, integration host) constructs a
// `BackendConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use roost_api::auth::AuthConfig;
use roost_api::events::EventConfig;
use roost_api::tfa::TfaSettings;
use roost_api::transport::{FingerprintProfile, TransportConfig};
use secrecy::SecretString;
use url::Url;

/// Which event transport to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    /// Let the backend decide: the pub/sub broker when the account's
    /// devices advertise topics, the push stream otherwise.
    #[default]
    Auto,
    /// Always the server-push stream.
    Stream,
    /// Always the pub/sub broker.
    Broker,
}

/// Configuration for one backend instance.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Main API host.
    pub host: Url,
    /// Authentication host.
    pub auth_host: Url,

    pub username: String,
    pub password: SecretString,

    /// Per-request timeout; also the default transaction wait.
    pub request_timeout: Duration,
    /// Force-close the event stream after this long without a packet.
    /// Zero means unbounded.
    pub stream_timeout: Duration,
    /// Proactively close and re-open the event transport this often.
    /// Zero disables the reconnect timer.
    pub reconnect_interval: Duration,

    /// How many one-second rounds `start_monitoring` waits for the
    /// first connect signal before continuing in the background.
    pub connect_wait_rounds: u32,

    /// Synchronous mode: requests default to waiting for their
    /// correlated event, and startup blocks on the initial refresh.
    pub synchronous_mode: bool,
    pub event_transport: TransportPreference,

    /// Second-factor mechanism and its credentials.
    pub tfa: TfaSettings,
    /// Factor type to match in the account's factor list.
    pub factor_kind: String,
    pub factor_nickname: Option<String>,
    /// Finish-challenge retries while a push approval is pending.
    pub tfa_retries: u32,
    pub tfa_delay: Duration,

    /// Outer rounds through the fingerprint-profile list during login.
    pub login_attempts: u32,
    /// Delay between failed login rounds.
    pub login_retry_delay: Duration,
    pub fingerprint_profiles: Vec<FingerprintProfile>,
    /// User-agent choice (named agent, `random`, or `!literal`).
    pub user_agent: String,
    /// Send the web-client `source` marker header.
    pub send_source: bool,

    /// Session/cookie cache locations.
    pub session_file: PathBuf,
    pub cookies_file: PathBuf,
    pub save_session: bool,

    /// Pub/sub broker endpoint (may be overridden by the service).
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_path: String,

    /// Append every inbound packet here (debugging aid).
    pub dump_file: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "https://api.roost.cloud".parse().expect("static url"),
            auth_host: "https://auth.roost.cloud".parse().expect("static url"),
            username: String::new(),
            password: SecretString::from(String::new()),
            request_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(120),
            reconnect_interval: Duration::ZERO,
            connect_wait_rounds: 30,
            synchronous_mode: false,
            event_transport: TransportPreference::default(),
            tfa: TfaSettings::default(),
            factor_kind: "email".into(),
            factor_nickname: None,
            tfa_retries: 5,
            tfa_delay: Duration::from_secs(5),
            login_attempts: 3,
            login_retry_delay: Duration::from_secs(3),
            fingerprint_profiles: FingerprintProfile::default_set(),
            user_agent: "linux".into(),
            send_source: true,
            session_file: PathBuf::from("roost-session.json"),
            cookies_file: PathBuf::from("roost-cookies.txt"),
            save_session: true,
            broker_host: "broker.roost.cloud".into(),
            broker_port: 443,
            broker_path: "/mqtt".into(),
            dump_file: None,
        }
    }
}

impl BackendConfig {
    /// Wire-layer transport settings derived from this config.
    ///
    /// Call once and reuse: the returned value owns the cookie jar all
    /// connections share.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: self.request_timeout,
            profiles: self.fingerprint_profiles.clone(),
            ..Default::default()
        }
    }

    /// Auth-engine settings derived from this config.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            username: self.username.clone(),
            password: self.password.clone(),
            user_agent: self.user_agent.clone(),
            send_source: self.send_source,
            tfa: self.tfa.clone(),
            factor_kind: self.factor_kind.clone(),
            factor_nickname: self.factor_nickname.clone(),
            tfa_retries: self.tfa_retries,
            tfa_delay: self.tfa_delay,
            attempts: self.login_attempts,
            retry_delay: self.login_retry_delay,
        }
    }

    /// Event-channel settings derived from this config.
    pub fn event_config(&self) -> EventConfig {
        EventConfig {
            host: self.host.clone(),
            stream_timeout: self.stream_timeout,
            broker_host: self.broker_host.clone(),
            broker_port: self.broker_port,
            broker_path: self.broker_path.clone(),
        }
    }
}
