// Second-factor providers.
//
// All four strategies share one contract: `start()` prepares the
// provider (capturing mailbox state, clearing a relay), `get()` produces
// the one-time code, `stop()` releases resources. `get()` has three
// outcomes: `Some(code)` -- a real code; `Some("")` -- the finishing
// call itself performs the wait (push approval); `None` -- the provider
// timed out, fatal for the current challenge.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tracing::{debug, warn};

/// How a second-factor code reaches us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TfaSource {
    /// Code typed in at an interactive prompt.
    Console,
    /// Code read automatically from an IMAP mailbox.
    Imap,
    /// Code polled from a third-party relay service.
    Relay,
    /// User approves a push prompt; the finish call does the waiting.
    #[default]
    Push,
}

/// Settings shared by the polling providers.
#[derive(Debug, Clone)]
pub struct TfaSettings {
    pub source: TfaSource,
    /// IMAP host or relay base URL.
    pub host: Option<String>,
    /// IMAP port.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Fragment expected in the sender of the code-bearing mail.
    pub sender: String,
    /// Delay between mailbox/relay checks.
    pub poll_interval: Duration,
    /// Give up after this much total waiting.
    pub total_timeout: Duration,
}

impl Default for TfaSettings {
    fn default() -> Self {
        Self {
            source: TfaSource::default(),
            host: None,
            port: 993,
            username: None,
            password: None,
            sender: "Roost".into(),
            poll_interval: Duration::from_secs(5),
            total_timeout: Duration::from_secs(180),
        }
    }
}

/// Uniform contract across the four second-factor strategies.
#[async_trait]
pub trait TwoFactorProvider: Send {
    /// Prepare the provider. Returning `false` aborts the challenge.
    async fn start(&mut self) -> bool;

    /// Obtain the one-time code (see module docs for the `Some("")` and
    /// `None` cases).
    async fn get(&mut self) -> Option<String>;

    /// Release any held resources.
    async fn stop(&mut self);
}

/// Pick the provider matching the configured source.
pub fn provider_for(settings: &TfaSettings) -> Box<dyn TwoFactorProvider> {
    match settings.source {
        TfaSource::Console => Box::new(ConsoleTfa),
        TfaSource::Imap => Box::new(ImapTfa::new(settings.clone())),
        TfaSource::Relay => Box::new(RelayTfa::new(settings.clone())),
        TfaSource::Push => Box::new(PushTfa),
    }
}

// ── Console ──────────────────────────────────────────────────────────

/// Interactive entry: the user reads the code from wherever the service
/// sent it and types it in.
pub struct ConsoleTfa;

#[async_trait]
impl TwoFactorProvider for ConsoleTfa {
    async fn start(&mut self) -> bool {
        debug!("2fa-console: starting");
        true
    }

    async fn get(&mut self) -> Option<String> {
        debug!("2fa-console: prompting");
        tokio::task::spawn_blocking(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("Enter code")
                .interact_text()
                .ok()
        })
        .await
        .ok()
        .flatten()
    }

    async fn stop(&mut self) {
        debug!("2fa-console: stopping");
    }
}

// ── Push ─────────────────────────────────────────────────────────────

/// Push approval: no code to fetch. The empty string tells the auth
/// engine that the finish-challenge call performs the wait, retried
/// until the user taps approve.
pub struct PushTfa;

#[async_trait]
impl TwoFactorProvider for PushTfa {
    async fn start(&mut self) -> bool {
        debug!("2fa-push: starting");
        true
    }

    async fn get(&mut self) -> Option<String> {
        Some(String::new())
    }

    async fn stop(&mut self) {}
}

// ── IMAP ─────────────────────────────────────────────────────────────

type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

/// Watches an IMAP mailbox for the code mail.
///
/// `start()` connects and records the next-UID watermark so only mail
/// arriving after the challenge started is considered. The code mail is
/// deleted once consumed.
pub struct ImapTfa {
    settings: TfaSettings,
    session: Option<ImapSession>,
    baseline_uid: Option<u32>,
}

impl ImapTfa {
    pub fn new(settings: TfaSettings) -> Self {
        Self { settings, session: None, baseline_uid: None }
    }

    async fn connect(&mut self) -> Result<(), String> {
        let host = self.settings.host.clone().ok_or("imap host not configured")?;
        let username = self.settings.username.clone().ok_or("imap username not configured")?;
        let password = self.settings.password.clone().ok_or("imap password not configured")?;

        let tcp = TcpStream::connect((host.as_str(), self.settings.port))
            .await
            .map_err(|e| format!("imap connect: {e}"))?;
        let connector = tokio_native_tls::TlsConnector::from(
            tokio_native_tls::native_tls::TlsConnector::new()
                .map_err(|e| format!("imap tls: {e}"))?,
        );
        let tls = connector
            .connect(&host, tcp)
            .await
            .map_err(|e| format!("imap handshake: {e}"))?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .login(&username, password.expose_secret())
            .await
            .map_err(|(e, _)| format!("imap login: {e}"))?;
        let mailbox = session
            .select("INBOX")
            .await
            .map_err(|e| format!("imap select: {e}"))?;

        self.baseline_uid = mailbox.uid_next;
        self.session = Some(session);
        Ok(())
    }

    async fn check_mailbox(&mut self) -> Result<Option<String>, String> {
        let baseline = self.baseline_uid;
        let sender = self.settings.sender.clone();
        let session = self.session.as_mut().ok_or("imap session not started")?;

        // Refresh the mailbox view before searching.
        session.noop().await.map_err(|e| format!("imap noop: {e}"))?;

        let query = match baseline {
            Some(uid) => format!("UID {uid}:*"),
            None => "ALL".to_owned(),
        };
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| format!("imap search: {e}"))?;

        // Newest first, and don't trawl the whole mailbox.
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        uids.reverse();
        uids.truncate(10);

        for uid in uids {
            let fetches: Vec<_> = session
                .uid_fetch(uid.to_string(), "BODY[]")
                .await
                .map_err(|e| format!("imap fetch: {e}"))?
                .try_collect()
                .await
                .map_err(|e| format!("imap fetch read: {e}"))?;

            for fetch in &fetches {
                let Some(raw) = fetch.body() else { continue };
                let Some(message) = mail_parser::MessageParser::default().parse(raw) else {
                    continue;
                };

                let from = message
                    .from()
                    .and_then(|a| a.first())
                    .map(|addr| {
                        format!(
                            "{} {}",
                            addr.name.as_deref().unwrap_or_default(),
                            addr.address.as_deref().unwrap_or_default()
                        )
                    })
                    .unwrap_or_default();
                if !from.contains(&sender) {
                    continue;
                }

                let text = message
                    .body_html(0)
                    .or_else(|| message.body_text(0))
                    .unwrap_or_default();
                if let Some(code) = extract_code(&text) {
                    debug!("2fa-imap: code found");
                    // Consume the mail so a stale code is never re-read.
                    let _: Vec<_> = session
                        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
                        .await
                        .map_err(|e| format!("imap store: {e}"))?
                        .try_collect()
                        .await
                        .unwrap_or_default();
                    return Ok(Some(code));
                }
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl TwoFactorProvider for ImapTfa {
    async fn start(&mut self) -> bool {
        debug!("2fa-imap: starting");
        if self.session.is_some() {
            self.stop().await;
        }
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "imap connection failed");
                false
            }
        }
    }

    async fn get(&mut self) -> Option<String> {
        debug!("2fa-imap: waiting for code mail");
        let started = tokio::time::Instant::now();

        loop {
            // Waiting first gives the mail time to arrive.
            tokio::time::sleep(self.settings.poll_interval).await;
            if started.elapsed() > self.settings.total_timeout {
                debug!("2fa-imap: timed out");
                return None;
            }

            match self.check_mailbox().await {
                Ok(Some(code)) => return Some(code),
                Ok(None) => debug!("2fa-imap: no code yet"),
                Err(e) => {
                    warn!(error = %e, "imap read failed");
                    return None;
                }
            }
        }
    }

    async fn stop(&mut self) {
        debug!("2fa-imap: stopping");
        if let Some(mut session) = self.session.take() {
            let _ = session.logout().await;
        }
        self.baseline_uid = None;
    }
}

// ── Relay ────────────────────────────────────────────────────────────

/// Polls a third-party relay service that captures the code mail on our
/// behalf. `start()` clears any stale code; `get()` polls until one
/// appears or the total timeout passes.
pub struct RelayTfa {
    settings: TfaSettings,
    http: reqwest::Client,
}

impl RelayTfa {
    pub fn new(settings: TfaSettings) -> Self {
        Self { settings, http: reqwest::Client::new() }
    }

    fn credentials(&self) -> Option<(String, String, String)> {
        let host = self.settings.host.clone()?;
        let email = self.settings.username.clone()?;
        let token = self.settings.password.as_ref()?.expose_secret().to_owned();
        Some((host, email, token))
    }
}

#[async_trait]
impl TwoFactorProvider for RelayTfa {
    async fn start(&mut self) -> bool {
        debug!("2fa-relay: starting");
        let Some((host, email, token)) = self.credentials() else {
            debug!("2fa-relay: invalid config");
            return false;
        };

        let result = self
            .http
            .get(format!("{host}/clear"))
            .query(&[("email", email), ("token", token)])
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        if !matches!(&result, Ok(r) if r.status().is_success()) {
            debug!("2fa-relay: possible problem clearing");
        }
        true
    }

    async fn get(&mut self) -> Option<String> {
        let (host, email, token) = self.credentials()?;
        let started = tokio::time::Instant::now();

        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            if started.elapsed() > self.settings.total_timeout {
                debug!("2fa-relay: timed out");
                return None;
            }

            debug!("2fa-relay: checking");
            let resp = self
                .http
                .get(format!("{host}/get"))
                .query(&[("email", email.clone()), ("token", token.clone())])
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            if let Ok(resp) = resp {
                if resp.status().is_success() {
                    if let Ok(body) = resp.json::<Value>().await {
                        if let Some(code) = body["data"]["code"].as_str() {
                            debug!("2fa-relay: code found");
                            return Some(code.to_owned());
                        }
                    }
                }
            }
        }
    }

    async fn stop(&mut self) {
        debug!("2fa-relay: stopping");
    }
}

// ── Code extraction ──────────────────────────────────────────────────

/// Find a six-digit code standing alone on a line of the mail body.
fn extract_code(body: &str) -> Option<String> {
    let re = Regex::new(r"^\W*(\d{6})\W*$").ok()?;
    body.lines()
        .find_map(|line| re.captures(line).map(|c| c[1].to_owned()))
}

// ── Tests ────────────────────────────────────────────────────────────
