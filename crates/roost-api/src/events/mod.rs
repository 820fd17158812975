//! Event-stream channel with two interchangeable wire transports.
//!
//! The service pushes device-state events either over a long-lived
//! streamed-push connection ([`sse`]) or through a pub/sub broker
//! ([`mqtt`]). Both hide behind one interface: [`setup`], [`run`]
//! (blocks until the transport closes for any reason), [`stop`], and
//! [`update`] for subscription changes. Exactly one background task
//! drives `run()`; it never executes callbacks itself -- every decoded
//! packet goes to the [`EventSink`], which enqueues work elsewhere, so a
//! slow consumer cannot stall packet ingestion.
//!
//! `run()` never propagates recoverable errors: decode and transport
//! failures are logged and `run()` returns, leaving the caller's outer
//! reconnect loop to decide what happens next.

pub mod mqtt;
pub mod sse;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::transport::TransportConfig;

// ── Seams ────────────────────────────────────────────────────────────

/// Receiver side of the event channel.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Called when the transport reports connected. Returns the
    /// per-device topic list the pub/sub transport should subscribe to
    /// (ignored by the streamed transport).
    async fn on_connect(&self) -> Vec<String>;

    /// Hand one decoded packet over for dispatch.
    async fn on_packet(&self, packet: Value);
}

/// Which wire transport to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    /// Server-push stream over a persistent GET.
    Stream,
    /// Publish/subscribe broker over websocket.
    Broker,
}

/// Transport endpoints and tuning.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// API host carrying the subscribe endpoint.
    pub host: Url,
    /// Force-close the stream after this long without any packet.
    /// Zero means unbounded.
    pub stream_timeout: Duration,
    pub broker_host: String,
    pub broker_port: u16,
    /// Websocket path on the broker host.
    pub broker_path: String,
}

/// Session material the transports need for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Post-auth header set (streamed transport).
    pub headers: HeaderMap,
    /// Broker credentials.
    pub user_id: String,
    pub token: String,
}

// ── EventChannel ─────────────────────────────────────────────────────

#[derive(Default)]
struct RunState {
    choice: Option<TransportChoice>,
    cancel: Option<CancellationToken>,
    broker: Option<rumqttc::AsyncClient>,
}

/// One reconnectable event-stream connection.
pub struct EventChannel {
    config: Mutex<EventConfig>,
    transport: TransportConfig,
    state: Mutex<RunState>,
}

impl EventChannel {
    pub fn new(config: EventConfig, transport: TransportConfig) -> Self {
        Self { config: Mutex::new(config), transport, state: Mutex::new(RunState::default()) }
    }

    /// Point the pub/sub transport at a service-supplied broker URL
    /// (e.g. `wss://broker.example.com:443/mqtt`).
    pub fn override_broker(&self, url: &Url) {
        let mut config = self.config.lock().expect("config lock poisoned");
        if let Some(host) = url.host_str() {
            config.broker_host = host.to_owned();
        }
        config.broker_port = url.port().unwrap_or(443);
        if !url.path().is_empty() && url.path() != "/" {
            config.broker_path = url.path().to_owned();
        }
        debug!(host = %config.broker_host, port = config.broker_port, "broker override");
    }

    /// Prepare a run with the chosen transport.
    pub fn setup(&self, choice: TransportChoice) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.choice = Some(choice);
        state.cancel = Some(CancellationToken::new());
        state.broker = None;
    }

    /// Run the transport until it closes.
    ///
    /// Returns when we closed it, the service closed it, or the
    /// connection failed; the cause is logged, never raised.
    pub async fn run(&self, ctx: RunContext, sink: std::sync::Arc<dyn EventSink>) {
        let (choice, cancel, config) = {
            let state = self.state.lock().expect("state lock poisoned");
            let Some(choice) = state.choice else {
                warn!("event channel run without setup");
                return;
            };
            let cancel = state.cancel.clone().unwrap_or_default();
            let config = self.config.lock().expect("config lock poisoned").clone();
            (choice, cancel, config)
        };

        match choice {
            TransportChoice::Stream => {
                sse::run(&config, &self.transport, &ctx, sink, &cancel).await;
            }
            TransportChoice::Broker => {
                let (client, eventloop) = mqtt::build(&config, &ctx);
                self.state.lock().expect("state lock poisoned").broker = Some(client.clone());
                mqtt::run(client, eventloop, &ctx, sink, &cancel).await;
            }
        }

        let mut state = self.state.lock().expect("state lock poisoned");
        state.broker = None;
        state.cancel = None;
    }

    /// Force the transport closed, which makes `run()` return.
    pub fn stop(&self) {
        let state = self.state.lock().expect("state lock poisoned");
        if let Some(ref cancel) = state.cancel {
            cancel.cancel();
        }
        if let Some(ref broker) = state.broker {
            let _ = broker.try_disconnect();
        }
    }

    /// Update the per-device subscriptions.
    ///
    /// Stream transport carries everything on one feed, so this is a
    /// no-op there.
    pub async fn update(&self, topics: Vec<String>) {
        let broker = {
            let state = self.state.lock().expect("state lock poisoned");
            state.broker.clone()
        };
        match broker {
            Some(client) => mqtt::subscribe_topics(&client, topics).await,
            None => debug!("subscription update ignored on stream transport"),
        }
    }
}
