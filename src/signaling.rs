//! Signaling messages exchanged over the secure channel.
//!
//! Every message is an envelope `{ "type": "rtc:...", "timestamp": <ms>, ...payload }`.
//! Outbound envelopes are wrapped as `{ "type": "rtc:signal", "to": peer, "data": envelope }`,
//! inbound ones arrive as `{ "from": peer, "data": envelope }`.

use crate::error::Result;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::utils::now_millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Type tag of the outbound wrapper
pub const SIGNAL_TYPE: &str = "rtc:signal";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "rtc:call-request", rename_all = "camelCase")]
    CallRequest { call_id: String },

    #[serde(rename = "rtc:call-accept", rename_all = "camelCase")]
    CallAccept { call_id: String },

    #[serde(rename = "rtc:call-reject", rename_all = "camelCase")]
    CallReject { call_id: String, reason: String },

    #[serde(rename = "rtc:call-end", rename_all = "camelCase")]
    CallEnd { call_id: String },

    #[serde(rename = "rtc:offer", rename_all = "camelCase")]
    Offer {
        sdp: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    #[serde(rename = "rtc:answer", rename_all = "camelCase")]
    Answer {
        sdp: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    #[serde(rename = "rtc:ice-candidate")]
    IceCandidate(IceCandidate),

    /// Any type this crate does not know; ignored on receipt
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::CallRequest { .. } => "rtc:call-request",
            SignalMessage::CallAccept { .. } => "rtc:call-accept",
            SignalMessage::CallReject { .. } => "rtc:call-reject",
            SignalMessage::CallEnd { .. } => "rtc:call-end",
            SignalMessage::Offer { .. } => "rtc:offer",
            SignalMessage::Answer { .. } => "rtc:answer",
            SignalMessage::IceCandidate(_) => "rtc:ice-candidate",
            SignalMessage::Unknown => "unknown",
        }
    }

    /// Offer, answer and candidates need an open transport session
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalMessage::Offer { .. } | SignalMessage::Answer { .. } | SignalMessage::IceCandidate(_)
        )
    }
}

/// `{ type, timestamp, ...payload }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(message: SignalMessage) -> Self {
        Self {
            timestamp: now_millis(),
            message,
        }
    }
}

/// What the coordinator hands to the secure channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    #[serde(rename = "type")]
    pub kind: String,
    pub to: String,
    pub data: SignalEnvelope,
}

impl OutboundSignal {
    pub fn new(to: &str, message: SignalMessage) -> Self {
        Self {
            kind: SIGNAL_TYPE.to_string(),
            to: to.to_string(),
            data: SignalEnvelope::new(message),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What the secure channel delivers to the coordinator
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub from: String,
    pub data: SignalEnvelope,
}

impl InboundSignal {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// The already-established encrypted, ordered, reliable transport
#[async_trait]
pub trait SecureChannel: Send + Sync + 'static {
    /// Connection-open check
    fn is_open(&self) -> bool;

    async fn send(&self, signal: OutboundSignal) -> Result<()>;
}
