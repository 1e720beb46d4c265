//! Transport and reconciliation engine for AV device drivers
//!
//! This library provides the reusable half of a driver for equipment that
//! speaks an ad-hoc line or binary protocol over TCP or UDP (displays,
//! projectors, amplifiers, DSPs, switchers). A driver supplies only the
//! vendor-specific [`DeviceProtocol`]; the engine handles:
//!
//! - Connection lifecycle with automatic reconnect and connection epochs
//! - Frame splitting (delimited, fixed, length-prefixed, datagram)
//! - Half-duplex request/response correlation with timeouts
//! - Driving the device toward an operator's desired state
//! - Composite state (`On`, `Partially On`, ...) while the device catches up
//! - Contact-based health status with readable "missing since" messages
//! - Event subscriptions and a warm-start snapshot
//!
//! # Quick Start
//!
//! ```no_run
//! use avlink::{
//!     DeviceClient, DeviceProtocol, FrameKind, Framing, Observation, ParseError, Reply,
//!     SessionConfig, Value,
//! };
//!
//! struct Display;
//!
//! impl DeviceProtocol for Display {
//!     fn framing(&self) -> Framing {
//!         Framing::lines()
//!     }
//!
//!     fn classify(&self, frame: &[u8]) -> FrameKind {
//!         if frame.starts_with(b"NOTIFY ") {
//!             FrameKind::Notification
//!         } else {
//!             FrameKind::Response { token: None }
//!         }
//!     }
//!
//!     fn parse_response(&self, _request: &[u8], frame: &[u8]) -> Result<Reply, ParseError> {
//!         let text = std::str::from_utf8(frame).map_err(|e| ParseError::new(e.to_string()))?;
//!         match text.strip_prefix("POWR ") {
//!             Some(v) => Ok(Reply::Observed(vec![Observation::new("Power", v)])),
//!             None => Err(ParseError::new(text)),
//!         }
//!     }
//!
//!     fn parse_notification(&self, frame: &[u8]) -> Result<Vec<Observation>, ParseError> {
//!         let text = String::from_utf8_lossy(frame);
//!         match text.strip_prefix("NOTIFY POWR=") {
//!             Some(v) => Ok(vec![Observation::new("Power", v)]),
//!             None => Err(ParseError::new(text)),
//!         }
//!     }
//!
//!     fn poll_command(&self, attribute: &str) -> Option<Vec<u8>> {
//!         (attribute == "Power").then(|| b"POWR?\n".to_vec())
//!     }
//!
//!     fn set_command(&self, attribute: &str, value: &Value) -> Option<Vec<u8>> {
//!         (attribute == "Power").then(|| format!("POWR {}\n", value).into_bytes())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new("192.168.1.50", 20060).with_attribute("Power");
//!     let client = DeviceClient::spawn(config, Display)?;
//!
//!     client.set_desired("Power", "On").await?;
//!
//!     let mut events = client.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Connection**: one TCP/UDP socket per device, run in its own I/O task
//! - **Correlator**: pairs responses with requests, never interleaving them
//! - **Reconcile**: per-attribute `Idle` / `Converging` / `GivingUp` machine
//! - **Health**: silence classification and status combining
//! - **Session**: the actor owning all of the above for one device
//! - **Client**: cloneable async handle used by the host

mod client;
mod config;
mod connection;
mod correlator;
mod error;
mod framing;
mod health;
mod protocol;
mod reconcile;
mod session;
mod snapshot;
mod store;
mod subscription;
mod types;

// Public exports
pub use client::DeviceClient;
pub use config::{AttributeConfig, SessionConfig, TransportKind};
pub use connection::{CloseReason, LinkEvent, Transition, Transport};
pub use correlator::{Correlator, PendingRequest, Submitted};
pub use error::{LinkError, ParseError, Result};
pub use framing::{FrameBuffer, Framing, DEFAULT_MAX_FRAME_LEN};
pub use health::{combine, format_period, lamp_usage_fault, HealthConfig, HealthMonitor};
pub use protocol::{DeviceProtocol, FrameKind, Reply};
pub use reconcile::{composite, Action, Phase, ReconcileConfig, Reconciler};
pub use snapshot::CompositeSnapshot;
pub use store::{Stamped, StateStore};
pub use subscription::{EventReceiver, SessionEvent};
pub use types::{
    Attribute, Composite, ConnectionState, Epoch, Observation, Status, StatusLevel, Token, Value,
};
