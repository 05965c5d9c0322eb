//! # webcall-core - SIP-over-WebSocket calling client
//!
//! The call-control core of a softphone that registers over a WebSocket
//! signalling connection and places and receives calls with WebRTC-style
//! media. The SIP stack itself and the audio plumbing are collaborators
//! behind the traits in [`engine`] and [`media`]; this crate adds what sits
//! on top of them:
//!
//! - **transport**: registration that survives network loss. The client
//!   moves through `Connecting`, `Connected`, `Dying` and `Recovering`, and
//!   probes the server in bursts while calls are up.
//! - **session**: one race-free state machine per call, with write-once
//!   accept and termination outcomes.
//! - **stats**: MOS estimation from RTP round trip time, jitter and loss.
//! - **subscription**: presence from dialog-event NOTIFYs.
//! - **client**: the facade owning the session registry and the event stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webcall_core::{AcceptOptions, Client, ClientConfig, ClientEvent};
//!
//! # async fn run(engine: Arc<dyn webcall_core::engine::SipEngine>) -> webcall_core::ClientResult<()> {
//! let config = ClientConfig::new("sip:100@example.com", "100", "secret")
//!     .with_ws_server("wss://sip.example.com:7443");
//! let client = Client::builder(config).engine(engine).build().await?;
//! client.connect().await?;
//!
//! let mut events = client.event_iterator();
//! while let Some(event) = events.next().await {
//!     if let ClientEvent::Invite { session } = event {
//!         session.accept(AcceptOptions::default()).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod network;
pub mod probe;
pub mod session;
pub mod stats;
pub mod subscription;
pub mod transport;
pub mod uri;

pub use client::{Client, ClientBuilder, DoNotDisturb};
pub use config::{ClientConfig, DeviceSettings, MediaConfig, ReconnectionConfig};
pub use error::{ClientError, ClientResult};
pub use events::{ClientEvent, EventFilter, EventIterator, EventPriority, EventStream};
pub use network::NetworkMonitor;
pub use session::{
    AcceptOptions, AcceptOutcome, RejectCause, RejectOptions, Session, SessionDirection, SessionStatus,
    TerminateOptions, TerminationCause, TerminationOutcome,
};
pub use stats::{QualitySnapshot, RtpMeasurement, calculate_mos};
pub use subscription::PresenceStatus;
pub use transport::{ClientStatus, ReconnectableTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
