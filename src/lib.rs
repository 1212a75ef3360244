//! Peer-to-peer call signaling over an already-established secure channel.
//!
//! [`CallCoordinator`] runs the per-peer call state machine and exchanges
//! `rtc:*` messages through a [`SecureChannel`]; the transport adapter drives
//! one engine connection per peer (webrtc-rs via [`RtcEngine`], or anything
//! implementing [`TransportEngine`]).

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::CallConfig;
pub use coordinator::CallCoordinator;
pub use error::{CallError, EngineError, Result};
pub use events::CallEvent;
pub use peer::{RtcEngine, TransportEngine};
pub use session::{CallRole, CallSession, CallState, EndReason};
pub use signaling::{InboundSignal, OutboundSignal, SecureChannel, SignalEnvelope, SignalMessage};
