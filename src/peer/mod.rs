pub mod adapter;
pub mod connection;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod state;
pub mod types;

pub use adapter::{TransportAdapter, TransportEvent};
pub use connection::{RtcConnection, RtcEngine, RtcLocalTrack};
pub use engine::{EngineConnection, EngineEvent, LocalTrack, TransportEngine};
pub use types::{
    ConnectivityState, IceCandidate, MediaConstraints, MediaKind, RemoteTrack, SdpType,
    ServerConfig, SessionDescription, SessionStats,
};
