use crate::session::CallState;
use thiserror::Error;

/// Errors surfaced by the transport adapter and the call coordinator
#[derive(Error, Debug)]
pub enum CallError {
    /// Local capture could not be opened
    #[error("local media unavailable: {0}")]
    MediaAcquisition(String),

    /// A transport session already exists or the engine refused to create one
    #[error("cannot open transport session for {peer_id}: {reason}")]
    SessionCreation { peer_id: String, reason: String },

    /// No transport session for this peer (never opened, closed, or replaced)
    #[error("no transport session for peer {0}")]
    SessionNotFound(String),

    /// The engine rejected an offer or answer
    #[error("negotiation with {peer_id} failed: {reason}")]
    Negotiation { peer_id: String, reason: String },

    /// Operation is not valid in the current state; the session is unaffected
    #[error("invalid state for {peer_id}: {reason}")]
    InvalidState { peer_id: String, reason: String },

    /// A non-terminal call already exists with this peer
    #[error("call with {peer_id} already in progress ({state})")]
    Conflict { peer_id: String, state: CallState },

    /// Media or session setup failed while starting a call
    #[error("transport setup for {peer_id} failed")]
    Transport {
        peer_id: String,
        #[source]
        source: Box<CallError>,
    },

    /// The out-of-band data channel is missing or failed to send
    #[error("data channel to {peer_id} unavailable: {reason}")]
    DataChannel { peer_id: String, reason: String },

    /// The secure channel reports it is not connected
    #[error("secure channel is not open")]
    ChannelClosed,

    /// The secure channel failed to deliver a message
    #[error("secure channel error: {0}")]
    Channel(String),

    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CallError {
    pub(crate) fn invalid_state(peer_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(peer_id: &str, source: CallError) -> Self {
        Self::Transport {
            peer_id: peer_id.to_string(),
            source: Box::new(source),
        }
    }
}

/// Error reported by a transport engine binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<webrtc::Error> for EngineError {
    fn from(e: webrtc::Error) -> Self {
        Self(e.to_string())
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
