// Cloud HTTP client.
//
// Wraps `reqwest::Client` with the service's URL decoration, the two
// accepted response envelopes, and the split between auth-phase and
// session-phase requests. The underlying connection is swappable: the
// auth engine installs whichever fingerprint profile the edge accepted,
// and the same connection then serves the whole session.

use std::sync::RwLock;

use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::Error;
use crate::transport::{FingerprintProfile, TransportConfig};

// ── Endpoint paths ───────────────────────────────────────────────────

pub mod paths {
    //! Service endpoint paths. Auth endpoints live on the auth host,
    //! the rest on the main API host.

    pub const AUTH_PATH: &str = "/api/auth";
    pub const AUTH_START_PATH: &str = "/api/startAuth";
    pub const AUTH_FINISH_PATH: &str = "/api/finishAuth";
    pub const AUTH_FACTORS_PATH: &str = "/api/getFactors";
    pub const AUTH_FACTOR_ID_PATH: &str = "/api/getFactorId";
    pub const AUTH_VALIDATE_PATH: &str = "/api/validateAccessToken";
    pub const AUTH_PAIRING_PATH: &str = "/api/startPairingFactor";

    pub const DEVICES_PATH: &str = "/client/v3/devices";
    pub const SESSION_PATH: &str = "/client/v3/session";
    pub const SUBSCRIBE_PATH: &str = "/client/v3/subscribe";
    pub const NOTIFY_PATH: &str = "/client/v3/devices/notify/";
    pub const LOGOUT_PATH: &str = "/client/v3/logout";
}

/// `meta.error` value meaning "device not trusted" -- expected during a
/// fresh login, so not worth a warning.
const UNTRUSTED_ERROR_CODE: i64 = 9204;

// ── ApiOutcome ───────────────────────────────────────────────────────

/// Status + unwrapped body of a service call.
///
/// Auth-phase callers branch on `status` (401 is terminal, anything
/// other than 200 retries), so envelope errors are data here rather
/// than `Err` values. Session-phase helpers convert non-200 outcomes
/// into [`Error::Api`].
#[derive(Debug, Clone)]
pub struct ApiOutcome {
    pub status: u16,
    pub body: Value,
}

impl ApiOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

// ── CloudClient ──────────────────────────────────────────────────────

/// HTTP client for the cloud service.
pub struct CloudClient {
    http: RwLock<reqwest::Client>,
    session_headers: RwLock<HeaderMap>,
    host: Url,
    auth_host: Url,
}

impl CloudClient {
    /// Create a client against the given hosts, initially shaped by the
    /// first fingerprint profile.
    pub fn new(transport: &TransportConfig, host: Url, auth_host: Url) -> Result<Self, Error> {
        let profile = transport
            .profiles
            .first()
            .cloned()
            .unwrap_or(FingerprintProfile { name: "default", http1_only: false, tls12_max: false });
        let http = transport.build_client(&profile)?;
        Ok(Self {
            http: RwLock::new(http),
            session_headers: RwLock::new(HeaderMap::new()),
            host,
            auth_host,
        })
    }

    /// Install the connection the auth engine settled on.
    pub fn set_connection(&self, client: reqwest::Client) {
        *self.http.write().expect("connection lock poisoned") = client;
    }

    /// Install the post-authentication header set.
    pub fn set_session_headers(&self, headers: HeaderMap) {
        *self.session_headers.write().expect("header lock poisoned") = headers;
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    pub fn auth_host(&self) -> &Url {
        &self.auth_host
    }

    fn http(&self) -> reqwest::Client {
        self.http.read().expect("connection lock poisoned").clone()
    }

    fn headers(&self) -> HeaderMap {
        self.session_headers.read().expect("header lock poisoned").clone()
    }

    // ── URL construction ─────────────────────────────────────────────

    /// Generate a fresh transaction id for request correlation.
    pub fn transaction_id() -> String {
        format!("web!{}", uuid::Uuid::new_v4())
    }

    /// Session-phase URL: append the transaction id and timestamp the
    /// service expects on every non-auth GET/POST.
    fn decorated_url(&self, path: &str, tid: &str) -> Result<Url, Error> {
        let mut url = self.host.join(path)?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        url.query_pairs_mut()
            .append_pair("eventId", tid)
            .append_pair("time", &now_ms.to_string());
        Ok(url)
    }

    // ── Session-phase requests ───────────────────────────────────────

    /// GET a session-phase endpoint, returning the unwrapped `data`.
    pub async fn get(&self, path: &str) -> Result<Value, Error> {
        let tid = Self::transaction_id();
        let url = self.decorated_url(path, &tid)?;
        debug!(%url, "GET");

        let resp = self
            .http()
            .get(url)
            .headers(self.headers())
            .header("x-transaction-id", &tid)
            .send()
            .await?;

        expect_ok(parse_response(resp).await?)
    }

    /// PUT a session-phase endpoint.
    pub async fn put(&self, path: &str, body: Option<&Value>) -> Result<Value, Error> {
        let tid = Self::transaction_id();
        let url = self.decorated_url(path, &tid)?;
        debug!(%url, "PUT");

        let mut req = self
            .http()
            .put(url)
            .headers(self.headers())
            .header("x-transaction-id", &tid);
        if let Some(body) = body {
            req = req.json(body);
        }

        expect_ok(parse_response(req.send().await?).await?)
    }

    /// POST a session-phase endpoint with optional extra headers
    /// (e.g. the routing header a base-station notify needs).
    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        extra_headers: Option<HeaderMap>,
    ) -> Result<Value, Error> {
        let tid = Self::transaction_id();
        let url = self.decorated_url(path, &tid)?;
        debug!(%url, "POST");

        let mut req = self
            .http()
            .post(url)
            .headers(self.headers())
            .header("x-transaction-id", &tid)
            .json(body);
        if let Some(extra) = extra_headers {
            req = req.headers(extra);
        }

        expect_ok(parse_response(req.send().await?).await?)
    }

    // ── Auth-phase requests ──────────────────────────────────────────

    /// POST an auth-host endpoint. No URL decoration; the caller owns
    /// the header set and branches on the returned status.
    pub async fn auth_post(
        &self,
        path: &str,
        body: &Value,
        headers: &HeaderMap,
    ) -> Result<ApiOutcome, Error> {
        let url = self.auth_host.join(path)?;
        debug!(%url, "auth POST");

        let resp = self
            .http()
            .post(url)
            .headers(headers.clone())
            .json(body)
            .send()
            .await?;

        parse_response(resp).await
    }

    /// GET an auth-host endpoint.
    pub async fn auth_get(&self, path: &str, headers: &HeaderMap) -> Result<ApiOutcome, Error> {
        let url = self.auth_host.join(path)?;
        debug!(%url, "auth GET");

        let resp = self.http().get(url).headers(headers.clone()).send().await?;

        parse_response(resp).await
    }

    /// Preflight an auth-host endpoint. Best-effort: the service's edge
    /// expects the OPTIONS round-trip but its result carries nothing.
    pub async fn auth_options(&self, path: &str, headers: &HeaderMap) {
        let Ok(url) = self.auth_host.join(path) else {
            return;
        };
        trace!(%url, "auth OPTIONS");
        if let Err(e) = self.http().request(reqwest::Method::OPTIONS, url).headers(headers.clone()).send().await {
            debug!(error = %e, "options preflight failed");
        }
    }
}

// ── Envelope handling ────────────────────────────────────────────────

/// Convert a non-200 outcome into [`Error::Api`] for session-phase
/// callers that only care about the happy path.
fn expect_ok(outcome: ApiOutcome) -> Result<Value, Error> {
    if outcome.is_ok() {
        Ok(outcome.body)
    } else {
        Err(Error::Api {
            status: outcome.status,
            message: outcome.body.as_str().unwrap_or("request failed").to_owned(),
        })
    }
}

async fn parse_response(resp: reqwest::Response) -> Result<ApiOutcome, Error> {
    let status = resp.status().as_u16();
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    let text = resp.text().await?;
    trace!(status, body = %text, "response");

    Ok(parse_body(status, &text, is_json))
}

/// Unwrap one of the two envelope shapes the service uses:
/// `{"meta": {"code", "message"}, "data": ...}` or
/// `{"success": bool, "data": ...}`. Anything else is treated as a
/// transport failure (status 500, empty body).
fn parse_body(status: u16, text: &str, is_json: bool) -> ApiOutcome {
    if status != 200 {
        return ApiOutcome { status, body: Value::Null };
    }

    let body: Value = if is_json {
        match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "body not decodable");
                return ApiOutcome { status: 500, body: Value::Null };
            }
        }
    } else {
        Value::String(text.to_owned())
    };

    // New envelope: {"meta": {"code": N, "message": ...}, "data": ...}
    if let Some(meta) = body.get("meta") {
        let code = meta.get("code").and_then(Value::as_i64).unwrap_or(500);
        let code = u16::try_from(code).unwrap_or(500);
        if code == 200 {
            return ApiOutcome { status: 200, body: body.get("data").cloned().unwrap_or(Value::Null) };
        }
        if meta.get("error").and_then(Value::as_i64) != Some(UNTRUSTED_ERROR_CODE) {
            warn!(code, "error in response envelope");
        }
        return ApiOutcome {
            status: code,
            body: meta.get("message").cloned().unwrap_or(Value::Null),
        };
    }

    // Original envelope: {"success": bool, "data": ...}
    if let Some(success) = body.get("success").and_then(Value::as_bool) {
        if success {
            return ApiOutcome {
                status: 200,
                body: body.get("data").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            };
        }
        warn!("request reported failure");
        return ApiOutcome { status: 500, body: Value::Null };
    }

    ApiOutcome { status: 500, body: Value::Null }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_envelope_success() {
        let text = json!({"meta": {"code": 200}, "data": {"token": "t"}}).to_string();
        let outcome = parse_body(200, &text, true);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body["token"], "t");
    }

    #[test]
    fn meta_envelope_error_carries_code_and_message() {
        let text = json!({
            "meta": {"code": 401, "message": "bad password", "error": 1100}
        })
        .to_string();
        let outcome = parse_body(200, &text, true);
        assert_eq!(outcome.status, 401);
        assert_eq!(outcome.body, "bad password");
    }

    #[test]
    fn success_envelope_with_and_without_data() {
        let with = json!({"success": true, "data": [1, 2]}).to_string();
        let outcome = parse_body(200, &with, true);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, json!([1, 2]));

        let without = json!({"success": true}).to_string();
        let outcome = parse_body(200, &without, true);
        assert_eq!(outcome.status, 200);
        assert!(outcome.body.as_object().is_some_and(serde_json::Map::is_empty));
    }

    #[test]
    fn failed_success_envelope_is_transport_failure() {
        let text = json!({"success": false}).to_string();
        let outcome = parse_body(200, &text, true);
        assert_eq!(outcome.status, 500);
    }

    #[test]
    fn non_200_short_circuits() {
        let outcome = parse_body(401, "ignored", true);
        assert_eq!(outcome.status, 401);
        assert!(outcome.body.is_null());
    }

    #[test]
    fn unknown_shape_is_transport_failure() {
        let outcome = parse_body(200, r#"{"weird": 1}"#, true);
        assert_eq!(outcome.status, 500);
    }

    #[test]
    fn malformed_json_is_transport_failure() {
        let outcome = parse_body(200, "not json", true);
        assert_eq!(outcome.status, 500);
    }

    #[test]
    fn transaction_ids_are_unique_and_prefixed() {
        let a = CloudClient::transaction_id();
        let b = CloudClient::transaction_id();
        assert!(a.starts_with("web!"));
        assert_ne!(a, b);
    }
}
