// Session identity and persistence.
//
// `SessionDetails` is built up during the authentication phase and stays
// constant afterwards: ids, the bearer token, and when it expires. The
// `SessionStore` persists that record per account (plus the auth-host
// trust cookies) so a previously trusted install can skip the 2FA
// challenge on the next run. Both files are advisory caches -- any load
// failure just means a fresh login.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// A token is only considered usable while `now < expires_at - margin`.
pub const TOKEN_SAFETY_MARGIN_SECS: i64 = 300;

const SESSION_FILE_VERSION: &str = "2";

// ── SessionDetails ───────────────────────────────────────────────────

/// Everything needed for the post-authentication phase of a session.
///
/// `device_id` is a stable, self-generated identifier for this client
/// installation: created once, persisted forever. `web_id` and `sub_id`
/// are derived from `user_id` after a successful login.
#[derive(Debug, Clone, Default)]
pub struct SessionDetails {
    pub device_id: String,
    pub user_id: Option<String>,
    pub web_id: Option<String>,
    pub sub_id: Option<String>,
    pub token: Option<String>,
    pub token_b64: Option<String>,
    /// Token expiry as epoch seconds.
    pub expires_at: i64,
    /// Resolved user-agent string for this run.
    pub user_agent: String,
}

impl SessionDetails {
    /// Update from an auth response body.
    ///
    /// Grabs the token, user id, and expiry; derives the base64 token,
    /// the web id, and the subscription id. Some endpoints nest the
    /// interesting part one level down under `accessToken`.
    pub fn update_from_auth(&mut self, body: &Value) {
        let body = body.get("accessToken").unwrap_or(body);

        if let Some(token) = body.get("token").and_then(Value::as_str) {
            self.token = Some(token.to_owned());
            self.token_b64 = Some(BASE64.encode(token));
        }
        if let Some(user_id) = body.get("userId").and_then(Value::as_str) {
            self.user_id = Some(user_id.to_owned());
            self.web_id = Some(format!("{user_id}_web"));
            self.sub_id = Some(format!("subscriptions/{user_id}_web"));
        }
        if let Some(expires) = body.get("expiresIn").and_then(Value::as_i64) {
            self.expires_at = expires;
        }
    }

    /// Whether the cached token is still inside its safety margin.
    pub fn token_usable(&self) -> bool {
        self.token_b64.is_some()
            && chrono::Utc::now().timestamp() < self.expires_at - TOKEN_SAFETY_MARGIN_SECS
    }

    // ── Header sets ──────────────────────────────────────────────────

    /// Headers for the authentication phase.
    ///
    /// This set mirrors what the service's own web client sends; the
    /// engine adds and updates an `Authorization` field as the login
    /// progresses.
    pub fn auth_headers(&self, origin: &Url, send_source: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        put(&mut headers, "accept", "application/json, text/plain, */*");
        put(&mut headers, "content-type", "application/json");
        put(&mut headers, "origin", origin.as_str().trim_end_matches('/'));
        put(&mut headers, "referer", origin.as_str());
        put(&mut headers, "user-agent", &self.user_agent);
        put(&mut headers, "x-service-version", "3");
        // The service inspects this to separate browsers from bots.
        put(&mut headers, "x-client-device-automation-name", &BASE64.encode("BROWSER"));
        put(&mut headers, "x-client-device-id", &self.device_id);
        put(&mut headers, "x-client-device-type", "BROWSER");
        if send_source {
            put(&mut headers, "source", "camWeb");
        }
        headers
    }

    /// Headers for the post-authentication phase.
    ///
    /// Built once after a successful login and unchanged until the next
    /// re-authentication.
    pub fn session_headers(&self, origin: &Url) -> HeaderMap {
        let mut headers = HeaderMap::new();
        put(&mut headers, "accept", "application/json");
        put(&mut headers, "auth-version", "2");
        if let Some(ref token) = self.token {
            put(&mut headers, "authorization", token);
        }
        put(&mut headers, "content-type", "application/json; charset=utf-8;");
        put(&mut headers, "origin", origin.as_str().trim_end_matches('/'));
        put(&mut headers, "referer", origin.as_str());
        put(&mut headers, "schemaversion", "1");
        put(&mut headers, "user-agent", &self.user_agent);
        headers
    }
}

/// Insert a header, skipping values that are not valid header text.
fn put(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

// ── Persistence ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Default)]
struct SessionFile {
    version: String,
    #[serde(default)]
    accounts: HashMap<String, StoredSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    device_id: String,
    user_id: Option<String>,
    web_id: Option<String>,
    sub_id: Option<String>,
    token: Option<String>,
    expires_at: i64,
}

/// Per-account persistence for [`SessionDetails`] and trust cookies.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    cookies_path: PathBuf,
    username: String,
    enabled: bool,
}

impl SessionStore {
    pub fn new(path: PathBuf, cookies_path: PathBuf, username: String, enabled: bool) -> Self {
        Self { path, cookies_path, username, enabled }
    }

    /// Load the stored session for this account.
    ///
    /// A missing or unreadable file yields a fresh `SessionDetails`; the
    /// `device_id` is created lazily here on first run and never changes
    /// afterwards.
    pub fn load(&self) -> SessionDetails {
        let mut details = SessionDetails::default();

        match self.read_file() {
            Some(file) => {
                if let Some(saved) = file.accounts.get(&self.username) {
                    details.device_id = saved.device_id.clone();
                    details.user_id = saved.user_id.clone();
                    details.web_id = saved.web_id.clone();
                    details.sub_id = saved.sub_id.clone();
                    details.token = saved.token.clone();
                    details.token_b64 = saved.token.as_deref().map(|t| BASE64.encode(t));
                    details.expires_at = saved.expires_at;
                    debug!(account = %self.username, "loaded saved session");
                } else {
                    debug!(account = %self.username, "no saved session for account");
                }
            }
            None => debug!("session file not read"),
        }

        if details.device_id.is_empty() {
            details.device_id = uuid::Uuid::new_v4().to_string();
            debug!(device_id = %details.device_id, "created new client id");
        }

        details
    }

    /// Persist the session record for this account.
    ///
    /// Failures are logged and swallowed -- the cache is advisory.
    pub fn save(&self, details: &SessionDetails) {
        if !self.enabled {
            return;
        }

        let mut file = self.read_file().unwrap_or_else(|| SessionFile {
            version: SESSION_FILE_VERSION.to_owned(),
            accounts: HashMap::new(),
        });

        file.accounts.insert(
            self.username.clone(),
            StoredSession {
                device_id: details.device_id.clone(),
                user_id: details.user_id.clone(),
                web_id: details.web_id.clone(),
                sub_id: details.sub_id.clone(),
                token: details.token.clone(),
                expires_at: details.expires_at,
            },
        );

        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    debug!(error = %e, "session file not written");
                }
            }
            Err(e) => debug!(error = %e, "session record not serialized"),
        }
    }

    fn read_file(&self) -> Option<SessionFile> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    // ── Cookies ──────────────────────────────────────────────────────

    /// Persist the auth-host cookies (the browser-trust cookie lives
    /// here) as one `name=value` pair per line.
    pub fn save_cookies(&self, jar: &Jar, auth_url: &Url) {
        if !self.enabled {
            return;
        }
        let Some(header) = jar.cookies(auth_url) else {
            return;
        };
        let Ok(header) = header.to_str() else {
            return;
        };
        let lines = header.split("; ").collect::<Vec<_>>().join("\n");
        if let Err(e) = std::fs::write(&self.cookies_path, lines) {
            debug!(error = %e, "cookie file not written");
        }
    }

    /// Seed the jar with previously saved auth-host cookies.
    pub fn load_cookies(&self, jar: &Jar, auth_url: &Url) {
        let Ok(contents) = std::fs::read_to_string(&self.cookies_path) else {
            debug!("cookie file not read");
            return;
        };
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            jar.add_cookie_str(line, auth_url);
        }
        debug!("loaded saved cookies");
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(
            dir.path().join("session.json"),
            dir.path().join("cookies.txt"),
            "user@example.com".into(),
            true,
        )
    }

    #[test]
    fn update_from_auth_derives_ids() {
        let mut details = SessionDetails::default();
        details.update_from_auth(&json!({
            "token": "tok-123",
            "userId": "U1",
            "expiresIn": 2_000_000_000i64,
        }));

        assert_eq!(details.token.as_deref(), Some("tok-123"));
        assert_eq!(details.token_b64.as_deref(), Some(&BASE64.encode("tok-123")[..]));
        assert_eq!(details.web_id.as_deref(), Some("U1_web"));
        assert_eq!(details.sub_id.as_deref(), Some("subscriptions/U1_web"));
        assert_eq!(details.expires_at, 2_000_000_000);
    }

    #[test]
    fn update_from_auth_unwraps_access_token() {
        let mut details = SessionDetails::default();
        details.update_from_auth(&json!({
            "accessToken": { "token": "inner", "userId": "U2", "expiresIn": 5 }
        }));
        assert_eq!(details.token.as_deref(), Some("inner"));
        assert_eq!(details.user_id.as_deref(), Some("U2"));
    }

    #[test]
    fn token_usability_honours_safety_margin() {
        let now = chrono::Utc::now().timestamp();

        let mut details = SessionDetails::default();
        assert!(!details.token_usable(), "no token is never usable");

        details.token = Some("t".into());
        details.token_b64 = Some(BASE64.encode("t"));
        details.expires_at = now + TOKEN_SAFETY_MARGIN_SECS - 10;
        assert!(!details.token_usable(), "inside the margin counts as expired");

        details.expires_at = now + TOKEN_SAFETY_MARGIN_SECS + 60;
        assert!(details.token_usable());
    }

    #[test]
    fn round_trip_preserves_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        let mut details = store.load();
        let device_id = details.device_id.clone();
        assert!(!device_id.is_empty(), "device id created on first load");

        details.update_from_auth(&json!({
            "token": "tok",
            "userId": "U9",
            "expiresIn": 1_900_000_000i64,
        }));
        store.save(&details);

        let reloaded = store.load();
        assert_eq!(reloaded.device_id, device_id);
        assert_eq!(reloaded.user_id.as_deref(), Some("U9"));
        assert_eq!(reloaded.token.as_deref(), Some("tok"));
        assert_eq!(reloaded.expires_at, 1_900_000_000);
    }

    #[test]
    fn device_id_survives_missing_account_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        let first = store.load();
        store.save(&first);

        // A different account in the same file gets its own id.
        let other = SessionStore::new(
            dir.path().join("session.json"),
            dir.path().join("cookies.txt"),
            "other@example.com".into(),
            true,
        );
        let second = other.load();
        assert_ne!(first.device_id, second.device_id);
    }

    #[test]
    fn cookie_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let url: Url = "https://auth.example.com".parse().expect("url");

        let jar = Jar::default();
        jar.add_cookie_str("browser_trust=abc123", &url);
        store.save_cookies(&jar, &url);

        let fresh = Jar::default();
        store.load_cookies(&fresh, &url);
        let header = fresh.cookies(&url).expect("cookies present");
        assert!(header.to_str().expect("ascii").contains("browser_trust=abc123"));
    }
}
