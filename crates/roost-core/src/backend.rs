// ── Backend façade ──
//
// Orchestrates the wire layer into a running session: drives the auth
// engine to log in, finalizes the session record, starts the event
// channel under a supervisor task that re-logs-in and reconnects
// forever, and exposes the request API external device objects call.
//
// Three long-lived tasks exist per backend: the caller's own tasks
// (which may block on transactions), the scheduler worker (the only
// place listener callbacks run), and the event supervisor (the only
// place the transport is read).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roost_api::auth::AuthEngine;
use roost_api::client::{CloudClient, paths};
use roost_api::events::{EventChannel, EventSink, RunContext, TransportChoice};
use roost_api::session::{SessionDetails, SessionStore};
use roost_api::transport::TransportConfig;

use crate::config::{BackendConfig, TransportPreference};
use crate::dispatcher::{DEFAULT_RESOURCE_TYPES, Dispatcher};
use crate::error::CoreError;
use crate::registry::{EventRegistry, ListenerFn};
use crate::scheduler::{JobFn, Priority, Scheduler};

/// Delay between re-login attempts after the transport drops.
const RELOGIN_BACKOFF: Duration = Duration::from_secs(5);

/// Spacing between startup checks for the first connect signal.
const CONNECT_WAIT_STEP: Duration = Duration::from_secs(1);

/// How long `logout()` waits for the supervisor to wind down.
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ── WaitMode ─────────────────────────────────────────────────────────

/// What a request call blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Perform the HTTP call inline and return its body.
    Response,
    /// Perform the HTTP call, then block until the correlated packet
    /// arrives on the event stream (or the timeout passes).
    Event,
    /// Queue the HTTP call on the scheduler and return immediately.
    Nothing,
}

// ── Backend ──────────────────────────────────────────────────────────

/// The main entry point for consumers. Cheaply cloneable.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    cfg: BackendConfig,
    transport: TransportConfig,
    client: CloudClient,
    store: SessionStore,
    details: std::sync::RwLock<SessionDetails>,
    registry: Arc<EventRegistry>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    channel: EventChannel,
    connected: watch::Sender<bool>,
    multi_location: AtomicBool,
    transport_choice: std::sync::Mutex<Option<TransportChoice>>,
    cancel: CancellationToken,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Log in and build a backend.
    ///
    /// Blocks until the first login attempt completes and fails fast if
    /// it cannot; once constructed, the backend owns retrying silently
    /// in the background. Call
    /// [`start_monitoring()`](Self::start_monitoring) to open the event
    /// channel.
    pub async fn connect(cfg: BackendConfig) -> Result<Self, CoreError> {
        let transport = cfg.transport_config();
        let client = CloudClient::new(&transport, cfg.host.clone(), cfg.auth_host.clone())?;
        let store = SessionStore::new(
            cfg.session_file.clone(),
            cfg.cookies_file.clone(),
            cfg.username.clone(),
            cfg.save_session,
        );

        let mut details = store.load();
        let mut engine = AuthEngine::new(cfg.auth_config(), transport.clone());
        engine.login(&client, &mut details, &store).await?;

        let scheduler = Scheduler::new();
        let registry = Arc::new(EventRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            scheduler.clone(),
            DEFAULT_RESOURCE_TYPES.iter().map(|s| (*s).to_owned()).collect(),
        );
        let channel = EventChannel::new(cfg.event_config(), transport.clone());
        let (connected, _) = watch::channel(false);

        let backend = Self {
            inner: Arc::new(BackendInner {
                cfg,
                transport,
                client,
                store,
                details: std::sync::RwLock::new(details),
                registry,
                scheduler,
                dispatcher,
                channel,
                connected,
                multi_location: AtomicBool::new(false),
                transport_choice: std::sync::Mutex::new(None),
                cancel: CancellationToken::new(),
                supervisor: std::sync::Mutex::new(None),
            }),
        };

        backend.finalize_session().await?;
        info!("logged in");
        Ok(backend)
    }

    // ── Session plumbing ─────────────────────────────────────────────

    /// Set up the post-authentication phase: install the session header
    /// set and read the session record (multi-location support, broker
    /// override).
    async fn finalize_session(&self) -> Result<(), CoreError> {
        let headers = {
            let details = self.inner.details.read().expect("details lock poisoned");
            details.session_headers(&self.inner.cfg.host)
        };
        self.inner.client.set_session_headers(headers);

        let record = self.inner.client.get(paths::SESSION_PATH).await?;

        let multi = record
            .get("supportsMultiLocation")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.inner.multi_location.store(multi, Ordering::Relaxed);
        debug!(multi_location = multi, "session record read");

        // The service may point us at a specific broker instance.
        if let Some(broker) = record.get("brokerUrl").and_then(Value::as_str) {
            match broker.parse() {
                Ok(url) => self.inner.channel.override_broker(&url),
                Err(e) => warn!(error = %e, "unusable broker url in session record"),
            }
        }

        Ok(())
    }

    /// Re-run the full login after the session died. Returns whether
    /// the backend is usable again.
    async fn relogin(&self) -> bool {
        let mut details = self.inner.details.read().expect("details lock poisoned").clone();
        let mut engine = AuthEngine::new(self.inner.cfg.auth_config(), self.inner.transport.clone());

        match engine.login(&self.inner.client, &mut details, &self.inner.store).await {
            Ok(()) => {
                *self.inner.details.write().expect("details lock poisoned") = details;
                match self.finalize_session().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "session finalize failed");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "re-login failed");
                false
            }
        }
    }

    fn run_context(&self) -> RunContext {
        let details = self.inner.details.read().expect("details lock poisoned");
        RunContext {
            headers: details.session_headers(&self.inner.cfg.host),
            user_id: details.user_id.clone().unwrap_or_default(),
            token: details.token.clone().unwrap_or_default(),
        }
    }

    // ── Monitoring ───────────────────────────────────────────────────

    /// Open the event channel and keep it open forever.
    ///
    /// Spawns the supervisor task, then blocks until the first connect
    /// signal (bounded), installs the periodic reconnect job, and in
    /// synchronous mode completes an initial device refresh before
    /// returning.
    pub async fn start_monitoring(&self) -> Result<(), CoreError> {
        let choice = self.select_transport().await;
        *self.inner.transport_choice.lock().expect("choice lock poisoned") = Some(choice);

        let supervisor = tokio::spawn(supervise(self.clone()));
        *self.inner.supervisor.lock().expect("supervisor lock poisoned") = Some(supervisor);

        // Wait for the stream to come up, but don't wait forever -- the
        // supervisor keeps retrying either way.
        let mut connected = self.inner.connected.subscribe();
        for _ in 0..self.inner.cfg.connect_wait_rounds {
            if *connected.borrow_and_update() {
                break;
            }
            debug!("waiting for stream up");
            let _ = tokio::time::timeout(CONNECT_WAIT_STEP, connected.changed()).await;
        }
        if !*self.inner.connected.borrow() {
            warn!("stream not up yet, continuing in background");
        } else {
            debug!("stream up");
        }

        // Proactive reconnect: force the transport closed and let the
        // supervisor log back in and resume.
        if choice == TransportChoice::Stream && !self.inner.cfg.reconnect_interval.is_zero() {
            debug!(interval = ?self.inner.cfg.reconnect_interval, "reconnect timer armed");
            let inner = Arc::clone(&self.inner);
            let job: JobFn = Arc::new(move || {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    debug!("forcing reconnect");
                    inner.channel.stop();
                    Ok(())
                })
            });
            self.inner
                .scheduler
                .submit_every(Priority::Normal, self.inner.cfg.reconnect_interval, job);
        }

        if self.inner.cfg.synchronous_mode {
            let _ = self.devices().await;
        }

        Ok(())
    }

    /// Pick the wire transport, honouring the configured preference.
    async fn select_transport(&self) -> TransportChoice {
        match self.inner.cfg.event_transport {
            TransportPreference::Stream => {
                debug!("configured stream transport");
                TransportChoice::Stream
            }
            TransportPreference::Broker => {
                debug!("configured broker transport");
                TransportChoice::Broker
            }
            TransportPreference::Auto => {
                if self.device_topics().await.is_empty() {
                    debug!("auto chose stream transport");
                    TransportChoice::Stream
                } else {
                    debug!("auto chose broker transport");
                    TransportChoice::Broker
                }
            }
        }
    }

    /// Fetch the device directory.
    ///
    /// Returns the raw device records; the device-object layer on top
    /// of this crate gives them behavior.
    pub async fn devices(&self) -> Option<Value> {
        match self.inner.client.get(paths::DEVICES_PATH).await {
            Ok(devices) => Some(devices),
            Err(e) => {
                warn!(error = %e, "device fetch failed");
                None
            }
        }
    }

    /// The pub/sub topic list the account's devices advertise.
    async fn device_topics(&self) -> Vec<String> {
        let Some(devices) = self.devices().await else {
            return Vec::new();
        };
        devices
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|d| d.get("allowedMqttTopics").and_then(Value::as_array))
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push a new per-device topic list to the running transport.
    pub async fn update_subscriptions(&self) {
        let topics = self.device_topics().await;
        self.inner.channel.update(topics).await;
    }

    // ── Request API ──────────────────────────────────────────────────

    /// Generate a caller-side transaction id.
    pub fn transaction_id() -> String {
        CloudClient::transaction_id()
    }

    /// Send a command notification to a device.
    ///
    /// Notifications are how things get done -- light on, mode change,
    /// start recording. The service replies on the event stream. With
    /// `WaitMode::Event` this call blocks until that reply (or
    /// `timeout`); `Response` returns the immediate HTTP body;
    /// `Nothing` queues the send and returns. `None` picks `Event` in
    /// synchronous mode and `Nothing` otherwise.
    pub async fn notify(
        &self,
        device_id: &str,
        routing_id: Option<&str>,
        mut body: Value,
        wait: Option<WaitMode>,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let wait = wait.unwrap_or(if self.inner.cfg.synchronous_mode {
            WaitMode::Event
        } else {
            WaitMode::Nothing
        });

        let tid = Self::transaction_id();
        self.fill_notify_body(&mut body, device_id, &tid);
        let path = format!("{}{device_id}", paths::NOTIFY_PATH);
        let headers = routing_header(routing_id);

        match wait {
            WaitMode::Event => {
                if let Err(e) = self.inner.registry.begin(&tid) {
                    warn!(error = %e, "transaction not registered");
                    return None;
                }
                if let Err(e) = self.inner.client.post(&path, &body, headers).await {
                    // The reply may still arrive; let the wait decide.
                    warn!(error = %e, "notify send failed");
                }
                let timeout = timeout.unwrap_or(self.inner.cfg.request_timeout);
                self.inner.registry.wait(&tid, timeout).await
            }
            WaitMode::Response => self
                .inner
                .client
                .post(&path, &body, headers)
                .await
                .map_err(|e| warn!(error = %e, "notify failed"))
                .ok(),
            WaitMode::Nothing => {
                let inner = Arc::clone(&self.inner);
                let job: JobFn = Arc::new(move || {
                    let inner = Arc::clone(&inner);
                    let path = path.clone();
                    let body = body.clone();
                    let headers = headers.clone();
                    Box::pin(async move {
                        inner.client.post(&path, &body, headers).await?;
                        Ok(())
                    })
                });
                self.inner.scheduler.submit(Priority::Normal, job);
                None
            }
        }
    }

    fn fill_notify_body(&self, body: &mut Value, device_id: &str, tid: &str) {
        let details = self.inner.details.read().expect("details lock poisoned");
        if let Some(map) = body.as_object_mut() {
            map.insert("to".into(), Value::String(device_id.to_owned()));
            map.entry("from")
                .or_insert_with(|| Value::String(details.web_id.clone().unwrap_or_default()));
            map.insert("transId".into(), Value::String(tid.to_owned()));
        }
    }

    /// GET a service endpoint.
    pub async fn get(&self, path: &str, wait: Option<WaitMode>) -> Option<Value> {
        match wait.unwrap_or(WaitMode::Response) {
            WaitMode::Nothing => {
                let inner = Arc::clone(&self.inner);
                let path = path.to_owned();
                let job: JobFn = Arc::new(move || {
                    let inner = Arc::clone(&inner);
                    let path = path.clone();
                    Box::pin(async move {
                        inner.client.get(&path).await?;
                        Ok(())
                    })
                });
                self.inner.scheduler.submit(Priority::Normal, job);
                None
            }
            _ => self
                .inner
                .client
                .get(path)
                .await
                .map_err(|e| warn!(error = %e, path, "get failed"))
                .ok(),
        }
    }

    /// PUT a service endpoint.
    pub async fn put(&self, path: &str, body: Option<Value>) -> Option<Value> {
        self.inner
            .client
            .put(path, body.as_ref())
            .await
            .map_err(|e| warn!(error = %e, path, "put failed"))
            .ok()
    }

    /// POST a service endpoint.
    ///
    /// With `WaitMode::Event` the call waits for `resource_key` (or the
    /// body's first key) to appear on the event stream -- the way mode
    /// changes report completion. `None` picks `Event` in synchronous
    /// mode and `Response` otherwise.
    pub async fn post(
        &self,
        path: &str,
        body: Value,
        wait: Option<WaitMode>,
        resource_key: Option<&str>,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let wait = wait.unwrap_or(if self.inner.cfg.synchronous_mode {
            WaitMode::Event
        } else {
            WaitMode::Response
        });

        match wait {
            WaitMode::Event => {
                let key = match resource_key {
                    Some(key) => key.to_owned(),
                    None => body
                        .as_object()
                        .and_then(|m| m.keys().next().cloned())
                        .unwrap_or_else(Self::transaction_id),
                };
                if let Err(e) = self.inner.registry.begin(&key) {
                    warn!(error = %e, "transaction not registered");
                    return None;
                }
                if let Err(e) = self.inner.client.post(path, &body, None).await {
                    warn!(error = %e, "post send failed");
                }
                let timeout = timeout.unwrap_or(self.inner.cfg.request_timeout);
                self.inner.registry.wait(&key, timeout).await
            }
            WaitMode::Response => self
                .inner
                .client
                .post(path, &body, None)
                .await
                .map_err(|e| warn!(error = %e, path, "post failed"))
                .ok(),
            WaitMode::Nothing => {
                let inner = Arc::clone(&self.inner);
                let path = path.to_owned();
                let job: JobFn = Arc::new(move || {
                    let inner = Arc::clone(&inner);
                    let path = path.clone();
                    let body = body.clone();
                    Box::pin(async move {
                        inner.client.post(&path, &body, None).await?;
                        Ok(())
                    })
                });
                self.inner.scheduler.submit(Priority::Normal, job);
                None
            }
        }
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Register a callback for one device's events.
    pub fn add_listener(&self, device_id: &str, callback: ListenerFn) {
        self.inner.registry.add_listener(device_id, callback);
    }

    /// Register a callback for every device's events.
    pub fn add_any_listener(&self, callback: ListenerFn) {
        self.inner.registry.add_any_listener(callback);
    }

    /// Feed a packet through the dispatcher as if it arrived on the
    /// event stream (debugging and tests).
    pub fn inject_packet(&self, packet: &Value) {
        self.inner.dispatcher.dispatch(packet);
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch connection state changes.
    pub fn connection_changes(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn multi_location(&self) -> bool {
        self.inner.multi_location.load(Ordering::Relaxed)
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.details.read().expect("details lock poisoned").user_id.clone()
    }

    pub fn sub_id(&self) -> Option<String> {
        self.inner.details.read().expect("details lock poisoned").sub_id.clone()
    }

    /// The scheduler, for collaborators that run their own periodic
    /// work (media indexing, device polling).
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop monitoring and end the session.
    pub async fn logout(&self) {
        debug!("logging out");
        self.inner.cancel.cancel();
        self.inner.channel.stop();

        let _ = self.put(paths::LOGOUT_PATH, None).await;

        let handle = self.inner.supervisor.lock().expect("supervisor lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("event supervisor did not stop in time");
            }
        }

        self.inner.scheduler.stop().await;
        let _ = self.inner.connected.send_replace(false);
    }
}

/// Attach the device-routing header when a routing id is known.
fn routing_header(routing_id: Option<&str>) -> Option<reqwest::header::HeaderMap> {
    let routing_id = routing_id?;
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(value) = reqwest::header::HeaderValue::from_str(routing_id) {
        headers.insert("xcloudid", value);
    }
    Some(headers)
}

// ── Event supervisor ─────────────────────────────────────────────────

/// Keep the event channel open forever: run the transport, and when it
/// closes for any reason, clear the correlation state, re-log-in with a
/// fixed backoff, and reconnect.
async fn supervise(backend: Backend) {
    let inner = &backend.inner;
    let sink: Arc<dyn EventSink> = Arc::new(BackendSink { inner: Arc::clone(&backend.inner) });
    let mut logged_in = true;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        while !logged_in {
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => return,
                () = tokio::time::sleep(RELOGIN_BACKOFF) => {}
            }
            debug!("re-logging in");
            logged_in = backend.relogin().await;
        }

        let choice = inner
            .transport_choice
            .lock()
            .expect("choice lock poisoned")
            .unwrap_or(TransportChoice::Stream);
        inner.channel.setup(choice);
        inner.channel.run(backend.run_context(), Arc::clone(&sink)).await;
        debug!("event loop exited");

        // Any packet that would have resolved these died with the
        // connection; wake the waiters rather than letting them burn
        // their full timeout.
        inner.registry.clear_transactions();
        let _ = inner.connected.send_replace(false);
        logged_in = false;
    }

    debug!("event supervisor exiting");
}

// ── Event sink ───────────────────────────────────────────────────────

/// Feeds transport callbacks into the backend.
struct BackendSink {
    inner: Arc<BackendInner>,
}

#[async_trait]
impl EventSink for BackendSink {
    async fn on_connect(&self) -> Vec<String> {
        let _ = self.inner.connected.send_replace(true);
        debug!("event stream connected");

        // Refresh the device directory on every (re)connect; the
        // broker transport also subscribes to the returned topics.
        let backend = Backend { inner: Arc::clone(&self.inner) };
        backend.device_topics().await
    }

    async fn on_packet(&self, packet: Value) {
        dump_packet(self.inner.cfg.dump_file.as_deref(), &packet);
        self.inner.dispatcher.dispatch(&packet);
    }
}

/// Append a packet to the debug capture file, if configured.
fn dump_packet(path: Option<&std::path::Path>, packet: &Value) {
    use std::io::Write as _;

    let Some(path) = path else { return };
    let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f");
    let line = format!("{stamp}: {packet:#}\n");
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = file.write_all(line.as_bytes());
    }
}
