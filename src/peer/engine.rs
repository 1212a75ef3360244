//! Seam between the adapter and the native real-time transport.
//!
//! A binding implements [`TransportEngine`] (capture + connection factory) and
//! [`EngineConnection`] (one negotiated connection). Engine callbacks are pushed
//! into the [`EngineEventSender`] handed to [`TransportEngine::connect`]; the
//! adapter tags them with the peer and forwards them to the coordinator.

use crate::error::EngineError;
use crate::peer::types::{
    ConnectivityState, IceCandidate, MediaConstraints, MediaKind, RemoteTrack,
    SessionDescription, SessionStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events an engine connection reports on its own schedule
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A remote media track arrived
    TrackArrived(RemoteTrack),
    /// A local connectivity candidate was discovered (trickle)
    CandidateDiscovered(IceCandidate),
    /// Overall connectivity changed
    StateChanged(ConnectivityState),
    /// The remote side opened the out-of-band data channel
    DataChannelArrived { label: String },
    /// Payload received on the data channel
    DataMessage { label: String, data: Bytes },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Locally captured track shared by every open connection
pub trait LocalTrack: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Stop capture; the track produces nothing afterwards
    fn stop(&self);
}

#[async_trait]
pub trait EngineConnection: Send + Sync + 'static {
    type Track: LocalTrack;

    async fn add_track(&self, track: Arc<Self::Track>) -> Result<(), EngineError>;
    /// Create an ordered data channel
    async fn create_data_channel(&self, label: &str) -> Result<(), EngineError>;
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn send_data(&self, data: Bytes) -> Result<(), EngineError>;
    async fn stats(&self) -> SessionStats;
    /// Detach local tracks, close the data channel and the connection
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    type Connection: EngineConnection;

    /// Open the capture devices named by `constraints`
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<TrackOf<Self>>>, EngineError>;

    /// Create a connection for `peer_id`; engine callbacks go to `events`
    async fn connect(
        &self,
        peer_id: &str,
        events: EngineEventSender,
    ) -> Result<Self::Connection, EngineError>;
}

/// Local track type of an engine
pub type TrackOf<E> = <<E as TransportEngine>::Connection as EngineConnection>::Track;
