// Authentication engine.
//
// A deterministic state machine that turns credentials (plus an optional
// cached token and trust cookie) into a valid session token. Each state
// is one async method returning the next state; `login()` drives the
// loop until `Success` or `Failed`. Network failures abort the current
// fingerprint-profile attempt only -- the engine rotates through the
// configured profiles across a bounded number of outer attempts before
// giving up. Credential rejection (401) and challenge-option exhaustion
// are immediately fatal.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::client::{CloudClient, paths};
use crate::error::Error;
use crate::session::{SessionDetails, SessionStore};
use crate::tfa::{self, TfaSettings, TfaSource, TwoFactorProvider};
use crate::transport::{FingerprintProfile, TransportConfig, resolve_user_agent};

// ── AuthState ────────────────────────────────────────────────────────

/// States of the login state machine.
///
/// Every reachable state has a defined successor for every outcome; the
/// only terminal states are `Success` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Starting,
    RevalidateToken,
    Login,
    CurrentFactorId,
    TrustedAuth,
    NewAuth,
    ValidateToken,
    TrustBrowser,
    Success,
    Failed,
}

// ── AuthConfig ───────────────────────────────────────────────────────

/// Knobs consumed by the engine. Built by the core's configuration
/// layer; the engine never reads files.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: SecretString,
    /// User-agent choice (named agent, `random`, or `!literal`).
    pub user_agent: String,
    /// Send the web-client `source` marker header.
    pub send_source: bool,
    /// Second-factor mechanism settings.
    pub tfa: TfaSettings,
    /// Factor type to match in the account's factor list (`email`,
    /// `sms`, `push`).
    pub factor_kind: String,
    /// Preferred factor nickname; first factor of the kind otherwise.
    pub factor_nickname: Option<String>,
    /// Finish-challenge retries while a push approval is pending.
    pub tfa_retries: u32,
    /// Delay between finish-challenge retries.
    pub tfa_delay: Duration,
    /// Outer rounds through the fingerprint-profile list.
    pub attempts: u32,
    /// Delay between failed login rounds.
    pub retry_delay: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: SecretString::from(String::new()),
            user_agent: "linux".into(),
            send_source: true,
            tfa: TfaSettings::default(),
            factor_kind: "email".into(),
            factor_nickname: None,
            tfa_retries: 5,
            tfa_delay: Duration::from_secs(5),
            attempts: 3,
            retry_delay: Duration::from_secs(3),
        }
    }
}

type ProviderFactory = Box<dyn Fn(&TfaSettings) -> Box<dyn TwoFactorProvider> + Send + Sync>;

// ── AuthEngine ───────────────────────────────────────────────────────

/// Drives the login state machine against the auth host.
pub struct AuthEngine {
    cfg: AuthConfig,
    transport: TransportConfig,
    provider_factory: ProviderFactory,

    // Per-run state, reset by `Starting`.
    headers: HeaderMap,
    factor_id: Option<String>,
    browser_code: Option<String>,
    needs_pairing: bool,
    attempt: u32,
    profile_queue: Vec<FingerprintProfile>,
}

impl AuthEngine {
    pub fn new(cfg: AuthConfig, transport: TransportConfig) -> Self {
        Self {
            cfg,
            transport,
            provider_factory: Box::new(|settings| tfa::provider_for(settings)),
            headers: HeaderMap::new(),
            factor_id: None,
            browser_code: None,
            needs_pairing: true,
            attempt: 1,
            profile_queue: Vec::new(),
        }
    }

    /// Replace how second-factor providers are created (test seam).
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    /// Run the state machine to completion.
    ///
    /// On success the session details and trust cookies are persisted
    /// and the winning connection is left installed on `client`.
    pub async fn login(
        &mut self,
        client: &CloudClient,
        details: &mut SessionDetails,
        store: &SessionStore,
    ) -> Result<(), Error> {
        let mut state = AuthState::Starting;

        loop {
            debug!(?state, "auth");
            state = match state {
                AuthState::Starting => self.on_starting(client, details, store),
                AuthState::RevalidateToken => self.on_revalidate(client, details).await,
                AuthState::Login => self.on_login(client, details).await,
                AuthState::CurrentFactorId => self.on_current_factor_id(client, details).await,
                AuthState::TrustedAuth => self.on_trusted_auth(client, details).await,
                AuthState::NewAuth => self.on_new_auth(client, details).await,
                AuthState::ValidateToken => self.on_validate(client, details).await,
                AuthState::TrustBrowser => self.on_trust_browser(client).await,
                AuthState::Success => {
                    store.save(details);
                    store.save_cookies(&self.transport.cookie_jar, client.auth_host());
                    debug!("auth: success");
                    return Ok(());
                }
                AuthState::Failed => {
                    return Err(Error::Authentication { message: "login failed".into() });
                }
            };
        }
    }

    // ── Connection rotation ──────────────────────────────────────────

    /// Install the next fingerprint profile on the client.
    ///
    /// Pops profiles from the current round; when a round is exhausted
    /// and outer attempts remain, refills the queue. Returns `false`
    /// once both are spent. The attempt counter spans the whole run, so
    /// revalidation and login share one budget.
    fn next_connection(&mut self, client: &CloudClient) -> bool {
        loop {
            if !self.profile_queue.is_empty() {
                let profile = self.profile_queue.remove(0);
                debug!(profile = profile.name, "fingerprint profile");
                match self.transport.build_client(&profile) {
                    Ok(http) => {
                        client.set_connection(http);
                        return true;
                    }
                    Err(e) => {
                        warn!(error = %e, "profile unusable");
                        continue;
                    }
                }
            }

            if self.attempt <= self.cfg.attempts {
                debug!(attempt = self.attempt, "login attempt");
                self.attempt += 1;
                self.profile_queue = self.transport.profiles.clone();
                continue;
            }

            return false;
        }
    }

    fn set_authorization(&mut self, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert("authorization", value);
        }
    }

    // ── States ───────────────────────────────────────────────────────

    /// Clear auth state to a known starting point.
    fn on_starting(
        &mut self,
        client: &CloudClient,
        details: &mut SessionDetails,
        store: &SessionStore,
    ) -> AuthState {
        store.load_cookies(&self.transport.cookie_jar, client.auth_host());
        details.user_agent = resolve_user_agent(&self.cfg.user_agent);

        self.factor_id = None;
        self.browser_code = None;
        self.needs_pairing = true;
        self.attempt = 1;
        self.profile_queue.clear();

        AuthState::RevalidateToken
    }

    /// See if the cached token lets us skip the whole login.
    async fn on_revalidate(
        &mut self,
        client: &CloudClient,
        details: &mut SessionDetails,
    ) -> AuthState {
        if !details.token_usable() {
            debug!("auth: no usable cached token");
            return AuthState::Login;
        }

        while self.next_connection(client) {
            self.headers = details.auth_headers(client.host(), self.cfg.send_source);
            if let Some(token_b64) = details.token_b64.clone() {
                self.set_authorization(&token_b64);
            }

            if self.validate_call(client).await {
                debug!("auth: cached token accepted");
                return AuthState::Success;
            }

            tokio::time::sleep(self.cfg.retry_delay).await;
        }

        AuthState::Login
    }

    /// The actual username/password login.
    async fn on_login(&mut self, client: &CloudClient, details: &mut SessionDetails) -> AuthState {
        while self.next_connection(client) {
            self.headers = details.auth_headers(client.host(), self.cfg.send_source);

            client.auth_options(paths::AUTH_PATH, &self.headers).await;
            let body = json!({
                "email": self.cfg.username,
                "password": BASE64.encode(self.cfg.password.expose_secret()),
                "language": "en",
            });

            match client.auth_post(paths::AUTH_PATH, &body, &self.headers).await {
                Ok(outcome) if outcome.status == 401 => {
                    error!("login failed: credentials rejected");
                    return AuthState::Failed;
                }
                Ok(outcome) if outcome.is_ok() => {
                    details.update_from_auth(&outcome.body);
                    if let Some(token_b64) = details.token_b64.clone() {
                        self.set_authorization(&token_b64);
                    }

                    // A trusted browser can complete the challenge in
                    // the login call itself.
                    let completed = outcome
                        .body
                        .get("authCompleted")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    return if completed {
                        AuthState::ValidateToken
                    } else {
                        AuthState::CurrentFactorId
                    };
                }
                Ok(outcome) => {
                    error!(status = outcome.status, "login rejected by edge");
                }
                Err(e) => {
                    warn!(error = %e, "login transport error");
                }
            }

            tokio::time::sleep(self.cfg.retry_delay).await;
        }

        error!("login failed: fingerprint profiles exhausted");
        AuthState::Failed
    }

    /// Ask which second-factor binding is currently associated with
    /// this client. A previously trusted install gets a factor id back
    /// and can skip the challenge.
    async fn on_current_factor_id(
        &mut self,
        client: &CloudClient,
        details: &SessionDetails,
    ) -> AuthState {
        client.auth_options(paths::AUTH_FACTOR_ID_PATH, &self.headers).await;
        let body = json!({
            "factorType": "BROWSER",
            "factorData": "",
            "userId": details.user_id,
        });

        match client.auth_post(paths::AUTH_FACTOR_ID_PATH, &body, &self.headers).await {
            Ok(outcome) if outcome.is_ok() => {
                self.needs_pairing = false;
                self.factor_id = outcome
                    .body
                    .get("factorId")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                AuthState::TrustedAuth
            }
            _ => AuthState::NewAuth,
        }
    }

    /// Replay the known factor id; the trust cookie binds us to it.
    async fn on_trusted_auth(
        &mut self,
        client: &CloudClient,
        details: &mut SessionDetails,
    ) -> AuthState {
        client.auth_options(paths::AUTH_START_PATH, &self.headers).await;
        let body = json!({
            "factorId": self.factor_id,
            "factorType": "BROWSER",
            "userId": details.user_id,
        });

        let Ok(outcome) = client.auth_post(paths::AUTH_START_PATH, &body, &self.headers).await
        else {
            error!("login failed: trusted start unreachable");
            return AuthState::Failed;
        };
        if !outcome.is_ok() {
            error!(status = outcome.status, "login failed: trusted start rejected");
            return AuthState::Failed;
        }

        details.update_from_auth(&outcome.body);

        let completed = outcome
            .body
            .get("authCompleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if completed {
            AuthState::ValidateToken
        } else {
            error!("login failed: trusted auth not completed");
            AuthState::Failed
        }
    }

    /// Run a fresh second-factor challenge.
    async fn on_new_auth(&mut self, client: &CloudClient, details: &mut SessionDetails) -> AuthState {
        let Some(factor_id) = self.find_factor_id(client).await else {
            return AuthState::Failed;
        };
        debug!(%factor_id, "using factor");
        self.factor_id = Some(factor_id.clone());

        // Start the provider before the challenge so it can capture
        // state first (e.g. the mailbox watermark before the mail goes
        // out).
        let mut provider = (self.provider_factory)(&self.cfg.tfa);
        if !provider.start().await {
            error!("login failed: second-factor provider would not start");
            return AuthState::Failed;
        }

        // Push approval carries no factor type of its own.
        let factor_type = if self.cfg.tfa.source == TfaSource::Push { "" } else { "BROWSER" };

        client.auth_options(paths::AUTH_START_PATH, &self.headers).await;
        let body = json!({
            "factorId": factor_id,
            "factorType": factor_type,
            "userId": details.user_id,
        });
        let started = client.auth_post(paths::AUTH_START_PATH, &body, &self.headers).await;

        let outcome = match started {
            Ok(outcome) if outcome.is_ok() => outcome,
            other => {
                provider.stop().await;
                error!(?other, "login failed: challenge start rejected");
                return AuthState::Failed;
            }
        };
        let Some(factor_auth_code) = outcome
            .body
            .get("factorAuthCode")
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            provider.stop().await;
            error!("login failed: challenge start carried no auth code");
            return AuthState::Failed;
        };

        let otp = provider.get().await;
        provider.stop().await;

        let Some(otp) = otp else {
            error!("login failed: second-factor code retrieval failed");
            return AuthState::Failed;
        };

        let mut payload = json!({
            "factorAuthCode": factor_auth_code,
            "isBrowserTrusted": true,
        });
        if !otp.is_empty() {
            payload["otp"] = Value::String(otp.clone());
        }

        // Finish the challenge. An empty code means the user approves a
        // push prompt out of band: the finishing call is what waits, so
        // it alone is retried. A real code is single-use and never
        // resubmitted.
        let mut tries = 1u32;
        loop {
            debug!(tries, "finishing challenge");
            match client.auth_post(paths::AUTH_FINISH_PATH, &payload, &self.headers).await {
                Ok(outcome) if outcome.is_ok() => {
                    self.browser_code = outcome
                        .body
                        .get("browserAuthCode")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    details.update_from_auth(&outcome.body);
                    return AuthState::ValidateToken;
                }
                _ => {
                    if !otp.is_empty() || tries >= self.cfg.tfa_retries {
                        break;
                    }
                    warn!(tries, "challenge not approved yet");
                    tokio::time::sleep(self.cfg.tfa_delay).await;
                    tries += 1;
                }
            }
        }

        error!("login failed: challenge finish failed");
        AuthState::Failed
    }

    /// Confirm the freshly obtained token.
    async fn on_validate(&mut self, client: &CloudClient, details: &SessionDetails) -> AuthState {
        if let Some(token_b64) = details.token_b64.clone() {
            self.set_authorization(&token_b64);
        }

        if self.validate_call(client).await {
            AuthState::TrustBrowser
        } else {
            error!("token validation failed");
            AuthState::Failed
        }
    }

    /// Register the browser-trust code so future logins can skip the
    /// challenge. Never fatal.
    async fn on_trust_browser(&mut self, client: &CloudClient) -> AuthState {
        if !self.needs_pairing {
            debug!("no pairing required");
            return AuthState::Success;
        }
        let Some(browser_code) = self.browser_code.clone() else {
            debug!("pairing postponed: no trust code");
            return AuthState::Success;
        };

        let body = json!({
            "factorAuthCode": browser_code,
            "factorData": "",
            "factorType": "BROWSER",
        });
        match client.auth_post(paths::AUTH_PAIRING_PATH, &body, &self.headers).await {
            Ok(outcome) if outcome.is_ok() => debug!("pairing succeeded"),
            Ok(outcome) => error!(status = outcome.status, "pairing failed"),
            Err(e) => error!(error = %e, "pairing failed"),
        }

        AuthState::Success
    }

    // ── Helpers ──────────────────────────────────────────────────────

    async fn validate_call(&self, client: &CloudClient) -> bool {
        let now = chrono::Utc::now().timestamp();
        let path = format!("{}?data={now}", paths::AUTH_VALIDATE_PATH);
        matches!(
            client.auth_get(&path, &self.headers).await,
            Ok(outcome) if outcome.is_ok()
        )
    }

    /// Fetch the account's factor list and pick the one matching the
    /// configured kind and nickname.
    async fn find_factor_id(&self, client: &CloudClient) -> Option<String> {
        debug!("auth: finding factor id");

        let now = chrono::Utc::now().timestamp();
        let path = format!("{}?data={now}", paths::AUTH_FACTORS_PATH);
        let outcome = match client.auth_get(&path, &self.headers).await {
            Ok(outcome) if outcome.is_ok() => outcome,
            _ => {
                error!("login failed: no secondary choices available");
                return None;
            }
        };

        let factors = outcome.body.get("items").and_then(Value::as_array).cloned();
        let chosen = factors.as_deref().and_then(|items| {
            select_factor(items, &self.cfg.factor_kind, self.cfg.factor_nickname.as_deref())
        });
        if chosen.is_none() {
            error!(kind = %self.cfg.factor_kind, "login failed: no matching factor");
        }
        chosen
    }
}

/// Pick a factor id: match on type first, then prefer the configured
/// nickname, falling back to the first factor of the right type.
fn select_factor(items: &[Value], kind: &str, nickname: Option<&str>) -> Option<String> {
    let of_kind: Vec<&Value> = items
        .iter()
        .filter(|f| {
            f.get("factorType")
                .and_then(Value::as_str)
                .is_some_and(|t| t.eq_ignore_ascii_case(kind))
        })
        .collect();

    if let Some(nickname) = nickname {
        for factor in &of_kind {
            if factor.get("factorNickname").and_then(Value::as_str) == Some(nickname) {
                return factor.get("factorId").and_then(Value::as_str).map(str::to_owned);
            }
        }
    }

    of_kind
        .first()
        .and_then(|f| f.get("factorId"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factors() -> Vec<Value> {
        vec![
            json!({"factorId": "f-sms", "factorType": "SMS", "factorNickname": "phone"}),
            json!({"factorId": "f-mail-1", "factorType": "EMAIL", "factorNickname": "work"}),
            json!({"factorId": "f-mail-2", "factorType": "EMAIL", "factorNickname": "home"}),
        ]
    }

    #[test]
    fn factor_selection_matches_type_case_insensitively() {
        assert_eq!(select_factor(&factors(), "sms", None).as_deref(), Some("f-sms"));
    }

    #[test]
    fn factor_selection_prefers_nickname() {
        assert_eq!(
            select_factor(&factors(), "email", Some("home")).as_deref(),
            Some("f-mail-2")
        );
    }

    #[test]
    fn factor_selection_falls_back_to_first_of_kind() {
        assert_eq!(
            select_factor(&factors(), "email", Some("missing")).as_deref(),
            Some("f-mail-1")
        );
        assert_eq!(select_factor(&factors(), "email", None).as_deref(), Some("f-mail-1"));
    }

    #[test]
    fn factor_selection_fails_on_unknown_kind() {
        assert_eq!(select_factor(&factors(), "push", None), None);
        assert_eq!(select_factor(&[], "email", None), None);
    }
}
