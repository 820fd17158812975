//! Session engine for the Roost cloud security-camera client.
//!
//! This crate turns the `roost-api` wire layer into a long-lived,
//! self-healing session:
//!
//! - **[`Backend`]** — Central façade. [`connect()`](Backend::connect)
//!   drives the auth engine (failing fast only on the very first
//!   attempt), [`start_monitoring()`](Backend::start_monitoring) opens
//!   the event channel under a supervisor that re-logs-in and
//!   reconnects forever, and the request API
//!   ([`notify`](Backend::notify) / [`get`](Backend::get) /
//!   [`post`](Backend::post)) lets callers choose between waiting for
//!   the HTTP response, waiting for the correlated event-stream packet,
//!   or fire-and-forget.
//!
//! - **[`Scheduler`]** — A single worker task executing every
//!   asynchronous callback in the system, ordered by priority tier then
//!   scheduled time, so the transport-reading task never blocks on
//!   caller code.
//!
//! - **[`Dispatcher`]** — Ordered, deterministic packet classification
//!   and fan-out to per-device listeners and the transaction registry.
//!
//! - **[`EventRegistry`]** — Per-backend transaction table and listener
//!   registry behind one lock, with broadcast-and-recheck waiting.
//!
//! Request calls return `Option<Value>` -- absence on timeout or
//! unresolved transport failure, never a panic or a raised transport
//! error.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod scheduler;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backend::{Backend, WaitMode};
pub use config::{BackendConfig, TransportPreference};
pub use dispatcher::{DEFAULT_RESOURCE_TYPES, Delivery, Dispatcher, classify};
pub use error::CoreError;
pub use registry::{ALL_DEVICES, EventRegistry, ListenerFn};
pub use scheduler::{JobFn, JobId, Priority, Scheduler};

// Wire-layer types callers commonly need alongside the backend.
pub use roost_api::tfa::{TfaSettings, TfaSource};
pub use roost_api::transport::FingerprintProfile;
