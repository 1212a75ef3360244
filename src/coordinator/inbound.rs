//! Inbound signaling dispatch.
//!
//! Handling never fails towards the caller: problems are logged and the
//! affected call, if any, is moved to a terminal state.

use super::{CallCoordinator, Inner, MAX_EARLY_CANDIDATES};
use crate::error::{CallError, Result};
use crate::events::CallEvent;
use crate::peer::engine::TransportEngine;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{CallRole, CallSession, CallState, EndReason};
use crate::signaling::{InboundSignal, SecureChannel, SignalEnvelope, SignalMessage};
use crate::utils::random_id;
use tracing::{debug, info, warn};

impl<E: TransportEngine, C: SecureChannel> CallCoordinator<E, C> {
    /// Parse a raw `{ from, data }` frame from the secure channel and handle it
    pub async fn handle_inbound(&self, raw: &str) {
        match InboundSignal::from_json(raw) {
            Ok(signal) => self.handle_signaling_message(&signal.from, signal.data).await,
            Err(e) => warn!(error = %e, "Dropping malformed inbound signal"),
        }
    }

    pub async fn handle_signaling_message(&self, peer_id: &str, envelope: SignalEnvelope) {
        let message = envelope.message;
        if message == SignalMessage::Unknown {
            debug!(peer_id, "Ignoring signaling message of unknown type");
            return;
        }

        let kind = message.kind();
        debug!(peer_id, kind, timestamp = envelope.timestamp, "Signaling message received");

        let _turn = self.inner.turn(peer_id).await;
        if let Err(e) = self.inner.dispatch(peer_id, message).await {
            warn!(peer_id, kind, error = %e, "Signaling message not applied");
        }
    }
}

impl<E: TransportEngine, C: SecureChannel> Inner<E, C> {
    async fn dispatch(&self, peer_id: &str, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::CallRequest { call_id } => self.on_call_request(peer_id, call_id).await,
            SignalMessage::CallAccept { call_id } => self.on_call_accept(peer_id, &call_id),
            SignalMessage::CallReject { call_id, reason } => {
                self.on_call_reject(peer_id, &call_id, reason).await
            }
            SignalMessage::CallEnd { call_id } => self.on_call_end(peer_id, &call_id).await,
            SignalMessage::Offer { sdp, call_id } => self.on_offer(peer_id, sdp, call_id).await,
            SignalMessage::Answer { sdp, call_id } => self.on_answer(peer_id, sdp, call_id).await,
            SignalMessage::IceCandidate(candidate) => {
                self.on_remote_candidate(peer_id, candidate).await
            }
            SignalMessage::Unknown => Ok(()),
        }
    }

    async fn on_call_request(&self, peer_id: &str, call_id: String) -> Result<()> {
        match self.session(peer_id).filter(CallSession::is_active) {
            Some(current) if current.call_id == call_id => {
                debug!(peer_id, call_id = %call_id, "Duplicate call-request");
                Ok(())
            }
            Some(current)
                if current.role == CallRole::Initiator
                    && current.state == CallState::OutgoingRequested =>
            {
                self.resolve_glare(peer_id, &current, call_id, None).await
            }
            Some(current) => Err(CallError::Conflict {
                peer_id: peer_id.to_string(),
                state: current.state,
            }),
            None => {
                info!(peer_id, call_id = %call_id, "Incoming call");
                // trickle left over from an earlier call must not reach this one
                let stale = self.update(peer_id, |r| std::mem::take(&mut r.early_candidates));
                if !stale.is_empty() {
                    debug!(peer_id, count = stale.len(), "Discarding candidates of a previous call");
                }
                self.record_session(CallSession::new(
                    peer_id,
                    &call_id,
                    CallRole::Receiver,
                    CallState::IncomingRinging,
                ));
                self.emit(CallEvent::IncomingCallRequest {
                    peer_id: peer_id.to_string(),
                    call_id,
                });
                Ok(())
            }
        }
    }

    fn on_call_accept(&self, peer_id: &str, call_id: &str) -> Result<()> {
        let session = self.session(peer_id);
        match session {
            Some(s) if s.role == CallRole::Initiator && s.is_active() => {
                self.check_call_id(peer_id, &s, call_id)?;
                match s.state {
                    CallState::OutgoingRequested => {
                        self.transition(peer_id, CallState::Negotiating);
                        self.emit(CallEvent::CallAccepted {
                            peer_id: peer_id.to_string(),
                            call_id: s.call_id,
                        });
                    }
                    // the answer got here first
                    _ => debug!(peer_id, state = %s.state, "call-accept after negotiation started"),
                }
                Ok(())
            }
            _ => Err(CallError::invalid_state(peer_id, "unexpected call-accept")),
        }
    }

    async fn on_call_reject(&self, peer_id: &str, call_id: &str, reason: String) -> Result<()> {
        match self.session(peer_id) {
            Some(s) if matches!(s.state, CallState::OutgoingRequested | CallState::Negotiating) => {
                self.check_call_id(peer_id, &s, call_id)?;
                info!(peer_id, call_id, reason = %reason, "Call rejected by peer");
                self.emit(CallEvent::CallRejected {
                    peer_id: peer_id.to_string(),
                    call_id: s.call_id,
                    reason: reason.clone(),
                });
                self.finish(peer_id, CallState::Ended, EndReason::Rejected(reason), false)
                    .await;
                Ok(())
            }
            _ => Err(CallError::invalid_state(peer_id, "unexpected call-reject")),
        }
    }

    async fn on_call_end(&self, peer_id: &str, call_id: &str) -> Result<()> {
        match self.session(peer_id).filter(CallSession::is_active) {
            Some(s) => {
                self.check_call_id(peer_id, &s, call_id)?;
                info!(peer_id, call_id, "Call ended by peer");
                self.finish(peer_id, CallState::Ended, EndReason::RemoteHangup, false)
                    .await;
            }
            None => debug!(peer_id, call_id, "call-end for no active call"),
        }
        Ok(())
    }

    async fn on_offer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
        call_id: Option<String>,
    ) -> Result<()> {
        let Some(current) = self.session(peer_id).filter(CallSession::is_active) else {
            let finished = self
                .session(peer_id)
                .filter(|s| call_id.as_deref() == Some(s.call_id.as_str()));
            if let Some(finished) = finished {
                info!(peer_id, call_id = %finished.call_id, state = %finished.state, "Dropping offer of a finished call");
                self.update(peer_id, |r| r.early_candidates.clear());
                return Ok(());
            }
            let call_id = call_id.unwrap_or_else(random_id);
            return self.accept_implicitly(peer_id, &call_id, offer).await;
        };
        if let Some(call_id) = call_id.as_deref() {
            if current.role == CallRole::Receiver {
                self.check_call_id(peer_id, &current, call_id)?;
            }
        }

        match (current.role, current.state) {
            (_, CallState::IncomingRinging) => {
                let replaced = self.update(peer_id, |r| {
                    r.session
                        .as_mut()
                        .and_then(|s| s.pending_offer.replace(offer))
                });
                if replaced.is_some() {
                    warn!(peer_id, "Replacing an offer that was never applied");
                }
                debug!(peer_id, "Offer stored until the call is accepted");
                Ok(())
            }
            (CallRole::Receiver, CallState::Negotiating) => {
                let result = self.answer_offer(peer_id, offer).await;
                self.fail_on_negotiation(peer_id, result).await
            }
            (CallRole::Initiator, CallState::OutgoingRequested) => {
                let call_id = call_id.unwrap_or_else(random_id);
                self.resolve_glare(peer_id, &current, call_id, Some(offer))
                    .await
            }
            (_, state) => Err(CallError::invalid_state(
                peer_id,
                format!("unexpected offer while {state}"),
            )),
        }
    }

    async fn on_answer(
        &self,
        peer_id: &str,
        answer: SessionDescription,
        call_id: Option<String>,
    ) -> Result<()> {
        let session = self.session(peer_id).filter(|s| {
            s.role == CallRole::Initiator
                && matches!(s.state, CallState::OutgoingRequested | CallState::Negotiating)
        });
        let Some(session) = session else {
            return Err(CallError::invalid_state(peer_id, "unexpected answer"));
        };
        if let Some(call_id) = call_id.as_deref() {
            self.check_call_id(peer_id, &session, call_id)?;
        }

        let result = self.adapter.apply_remote_answer(peer_id, answer).await;
        self.fail_on_negotiation(peer_id, result).await?;

        // an answer doubles as acceptance when call-accept was lost or is late
        if session.state == CallState::OutgoingRequested {
            self.transition(peer_id, CallState::Negotiating);
            self.emit(CallEvent::CallAccepted {
                peer_id: peer_id.to_string(),
                call_id: session.call_id,
            });
        }
        Ok(())
    }

    async fn on_remote_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        if self.adapter.has_session(peer_id) {
            return self.adapter.add_remote_candidate(peer_id, candidate).await;
        }
        let buffered = self.update(peer_id, |r| {
            if r.early_candidates.len() >= MAX_EARLY_CANDIDATES {
                return None;
            }
            r.early_candidates.push(candidate);
            Some(r.early_candidates.len())
        });
        match buffered {
            Some(buffered) => {
                debug!(peer_id, buffered, "No transport session yet, buffering candidate")
            }
            None => warn!(peer_id, limit = MAX_EARLY_CANDIDATES, "Early candidate buffer full, dropping candidate"),
        }
        Ok(())
    }

    /// Offer without a preceding call-request: answer right away
    async fn accept_implicitly(
        &self,
        peer_id: &str,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<()> {
        info!(peer_id, call_id, "Offer without call-request, answering directly");
        let mut session =
            CallSession::new(peer_id, call_id, CallRole::Receiver, CallState::IncomingRinging);
        session.pending_offer = Some(offer);
        self.record_session(session);

        if let Err(e) = self.start_incoming(peer_id, call_id).await {
            self.finish(peer_id, CallState::Failed, EndReason::Error(e.to_string()), true)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Both sides requested a call at once. The lexicographically lower peer
    /// id keeps its outgoing call; the other side drops its own and answers.
    async fn resolve_glare(
        &self,
        peer_id: &str,
        ours: &CallSession,
        their_call_id: String,
        their_offer: Option<SessionDescription>,
    ) -> Result<()> {
        let Some(local_id) = self.config.local_peer_id.as_deref() else {
            warn!(peer_id, "Simultaneous call requests but no local peer id configured, keeping ours");
            return Ok(());
        };
        if local_id < peer_id {
            info!(peer_id, call_id = %ours.call_id, "Simultaneous call requests, keeping our call");
            return Ok(());
        }

        info!(peer_id, ours = %ours.call_id, theirs = %their_call_id, "Simultaneous call requests, yielding");
        self.adapter.close_session(peer_id).await;

        let mut session = CallSession::new(
            peer_id,
            &their_call_id,
            CallRole::Receiver,
            CallState::IncomingRinging,
        );
        session.pending_offer = their_offer;
        self.record_session(session);

        if let Err(e) = self.start_incoming(peer_id, &their_call_id).await {
            self.finish(peer_id, CallState::Failed, EndReason::Error(e.to_string()), true)
                .await;
            return Err(e);
        }
        self.emit(CallEvent::CallAccepted {
            peer_id: peer_id.to_string(),
            call_id: their_call_id,
        });
        Ok(())
    }

    fn check_call_id(&self, peer_id: &str, session: &CallSession, call_id: &str) -> Result<()> {
        if session.call_id == call_id {
            return Ok(());
        }
        warn!(peer_id, expected = %session.call_id, got = call_id, "Message for another call");
        Err(CallError::invalid_state(
            peer_id,
            format!("call id {call_id} does not match {}", session.call_id),
        ))
    }
}
