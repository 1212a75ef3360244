use crate::peer::types::{ConnectivityState, RemoteTrack};
use crate::session::{CallState, EndReason};
use bytes::Bytes;

/// Lifecycle notifications for whoever drives the coordinator (UI or otherwise)
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    IncomingCallRequest {
        peer_id: String,
        call_id: String,
    },
    CallAccepted {
        peer_id: String,
        call_id: String,
    },
    CallRejected {
        peer_id: String,
        call_id: String,
        reason: String,
    },
    CallEnded {
        peer_id: String,
        call_id: String,
        reason: EndReason,
    },
    CallStateChanged {
        peer_id: String,
        from: CallState,
        to: CallState,
    },
    ConnectionStateChanged {
        peer_id: String,
        state: ConnectivityState,
    },
    RemoteMediaAvailable {
        peer_id: String,
        track: RemoteTrack,
    },
    RemoteMediaRemoved {
        peer_id: String,
        tracks: Vec<RemoteTrack>,
    },
    DataMessage {
        peer_id: String,
        label: String,
        data: Bytes,
    },
}

impl CallEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            CallEvent::IncomingCallRequest { peer_id, .. }
            | CallEvent::CallAccepted { peer_id, .. }
            | CallEvent::CallRejected { peer_id, .. }
            | CallEvent::CallEnded { peer_id, .. }
            | CallEvent::CallStateChanged { peer_id, .. }
            | CallEvent::ConnectionStateChanged { peer_id, .. }
            | CallEvent::RemoteMediaAvailable { peer_id, .. }
            | CallEvent::RemoteMediaRemoved { peer_id, .. }
            | CallEvent::DataMessage { peer_id, .. } => peer_id,
        }
    }
}
