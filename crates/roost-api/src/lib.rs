// roost-api: wire layer for the Roost cloud security-camera service.
//
// Owns everything that touches the network: the multi-step
// authentication state machine (`auth`), the second-factor providers
// (`tfa`), session identity and persistence (`session`), the HTTP
// client with the service's envelope conventions (`client`), connection
// fingerprint profiles (`transport`), and the two event-stream
// transports (`events`). `roost-core` orchestrates these into a running
// backend.

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
pub mod session;
pub mod tfa;
pub mod transport;

pub use auth::{AuthConfig, AuthEngine, AuthState};
pub use client::{ApiOutcome, CloudClient};
pub use error::Error;
pub use events::{EventChannel, EventConfig, EventSink, RunContext, TransportChoice};
pub use session::{SessionDetails, SessionStore};
pub use tfa::{TfaSettings, TfaSource, TwoFactorProvider};
pub use transport::{FingerprintProfile, TransportConfig};
