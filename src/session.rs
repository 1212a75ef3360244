use crate::peer::types::{ConnectivityState, SessionDescription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one call. `Idle` is the absence of a record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    OutgoingRequested,
    IncomingRinging,
    Negotiating,
    Established,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Allowed edges of the state machine
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (OutgoingRequested, Negotiating | Ended | Failed) => true,
            (IncomingRinging, Negotiating | Ended | Failed) => true,
            (Negotiating, Established | Ended | Failed) => true,
            (Established, Ended | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::OutgoingRequested => "outgoing-requested",
            CallState::IncomingRinging => "incoming-ringing",
            CallState::Negotiating => "negotiating",
            CallState::Established => "established",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Receiver,
}

/// Why a call reached a terminal state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// We declined an incoming request
    Declined(String),
    /// The remote side rejected our request
    Rejected(String),
    ConnectionFailed,
    /// Outgoing call was not established in time
    Timeout,
    /// Setup or negotiation failed locally
    Error(String),
}

/// One call with one peer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallSession {
    pub peer_id: String,
    pub call_id: String,
    pub role: CallRole,
    pub state: CallState,
    pub start_time: Option<DateTime<Utc>>,
    pub established_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub connectivity: Option<ConnectivityState>,
    /// Offer received while still ringing, applied on accept
    #[serde(skip)]
    pub(crate) pending_offer: Option<SessionDescription>,
}

impl CallSession {
    pub fn new(peer_id: &str, call_id: &str, role: CallRole, state: CallState) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            call_id: call_id.to_string(),
            role,
            state,
            start_time: None,
            established_at: None,
            ended_at: None,
            end_reason: None,
            connectivity: None,
            pending_offer: None,
        }
    }

    /// Move along an allowed edge; returns the previous state
    pub fn advance(&mut self, next: CallState) -> Option<CallState> {
        if !self.state.can_transition_to(next) {
            return None;
        }
        let previous = self.state;
        self.state = next;
        let now = Utc::now();
        match next {
            CallState::Negotiating => {
                self.start_time.get_or_insert(now);
            }
            CallState::Established => {
                self.start_time.get_or_insert(now);
                self.established_at = Some(now);
            }
            CallState::Ended | CallState::Failed => {
                self.ended_at = Some(now);
                self.pending_offer = None;
            }
            _ => {}
        }
        Some(previous)
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Time spent established, up to now or the end of the call
    pub fn duration(&self) -> Option<chrono::Duration> {
        let established = self.established_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - established)
    }
}
