//! Call signaling coordinator.
//!
//! Owns one [`CallSession`] per peer and drives it from local intents, inbound
//! signaling messages and transport events. Everything that touches one peer
//! runs inside that peer's *turn* (a FIFO async lock), so intents, messages
//! and engine events for the same peer are applied one at a time in the order
//! they were observed. Different peers never wait for each other's turn.

mod inbound;
mod transport_events;

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::events::CallEvent;
use crate::logger::dump_selected_pair;
use crate::peer::adapter::TransportAdapter;
use crate::peer::engine::TransportEngine;
use crate::peer::types::{IceCandidate, MediaKind, RemoteTrack, SessionDescription, SessionStats};
use crate::session::{CallRole, CallSession, CallState, EndReason};
use crate::signaling::{OutboundSignal, SecureChannel, SignalMessage};
use crate::utils::random_id;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the coordinator knows about one peer
#[derive(Default)]
struct PeerRecord {
    session: Option<CallSession>,
    /// Candidates that arrived while no transport session existed
    early_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
    /// Отложенная задача для graceful disconnect
    disconnect_task: Option<JoinHandle<()>>,
    request_task: Option<JoinHandle<()>>,
}

impl PeerRecord {
    fn abort_timers(&mut self) {
        for task in [self.disconnect_task.take(), self.request_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// Candidates kept per peer while no transport session exists
const MAX_EARLY_CANDIDATES: usize = 64;

type TurnMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive access to one peer. The lock entry is removed again when the
/// last holder or waiter lets go.
struct Turn<'a> {
    turns: &'a TurnMap,
    peer_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut turns = self.turns.lock();
        if turns
            .get(&self.peer_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            turns.remove(&self.peer_id);
        }
    }
}

struct Inner<E: TransportEngine, C: SecureChannel> {
    config: CallConfig,
    adapter: TransportAdapter<E>,
    channel: C,
    peers: Mutex<HashMap<String, PeerRecord>>,
    turns: TurnMap,
    events: broadcast::Sender<CallEvent>,
}

/// Cheap to clone; clones share the same sessions.
pub struct CallCoordinator<E: TransportEngine, C: SecureChannel> {
    inner: Arc<Inner<E, C>>,
}

impl<E: TransportEngine, C: SecureChannel> Clone for CallCoordinator<E, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TransportEngine, C: SecureChannel> CallCoordinator<E, C> {
    /// Must be called from within a tokio runtime: the transport event pump is
    /// spawned here.
    pub fn new(config: CallConfig, engine: E, channel: C) -> Self {
        let (adapter, transport_rx) =
            TransportAdapter::new(engine, config.data_channel_label.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(Inner {
            config,
            adapter,
            channel,
            peers: Mutex::new(HashMap::new()),
            turns: Mutex::new(HashMap::new()),
            events,
        });
        transport_events::spawn_pump(Arc::downgrade(&inner), transport_rx);
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn adapter(&self) -> &TransportAdapter<E> {
        &self.inner.adapter
    }

    /// Open the capture devices ahead of the first call
    pub async fn acquire_local_media(&self) -> Result<()> {
        self.inner
            .adapter
            .acquire_local_media(&self.inner.config.media)
            .await
    }

    /// Start a call to `peer_id`; returns the call id used
    pub async fn initiate_call(&self, peer_id: &str, call_id: Option<String>) -> Result<String> {
        let inner = &self.inner;
        let _turn = inner.turn(peer_id).await;

        if let Some(session) = inner.session(peer_id).filter(CallSession::is_active) {
            return Err(CallError::Conflict {
                peer_id: peer_id.to_string(),
                state: session.state,
            });
        }
        if !inner.channel.is_open() {
            return Err(CallError::transport(peer_id, CallError::ChannelClosed));
        }

        let call_id = call_id.unwrap_or_else(random_id);
        info!(peer_id, call_id = %call_id, "Initiating call");

        if let Err(e) = inner.start_outgoing(peer_id, &call_id).await {
            error!(peer_id, call_id = %call_id, error = %e, "Call setup failed, cleaning up");
            inner
                .finish(peer_id, CallState::Failed, EndReason::Error(e.to_string()), true)
                .await;
            // open_session may have succeeded before the record existed
            inner.adapter.close_session(peer_id).await;
            return Err(CallError::transport(peer_id, e));
        }

        inner.schedule_request_timeout(peer_id, &call_id);
        Ok(call_id)
    }

    /// Accept a ringing call
    pub async fn accept_call(&self, peer_id: &str, call_id: &str) -> Result<()> {
        let inner = &self.inner;
        let _turn = inner.turn(peer_id).await;
        inner.expect_ringing(peer_id, call_id, "accept")?;

        info!(peer_id, call_id, "Accepting call");
        if let Err(e) = inner.start_incoming(peer_id, call_id).await {
            error!(peer_id, call_id, error = %e, "Accepting call failed, cleaning up");
            inner
                .finish(peer_id, CallState::Failed, EndReason::Error(e.to_string()), true)
                .await;
            return Err(CallError::transport(peer_id, e));
        }
        Ok(())
    }

    /// Decline a ringing call; no transport session is created
    pub async fn reject_call(&self, peer_id: &str, call_id: &str, reason: &str) -> Result<()> {
        let inner = &self.inner;
        let _turn = inner.turn(peer_id).await;
        inner.expect_ringing(peer_id, call_id, "reject")?;

        info!(peer_id, call_id, reason, "Rejecting call");
        let reject = SignalMessage::CallReject {
            call_id: call_id.to_string(),
            reason: reason.to_string(),
        };
        if let Err(e) = inner.send(peer_id, reject).await {
            warn!(peer_id, error = %e, "Failed to send call-reject");
        }
        inner
            .finish(
                peer_id,
                CallState::Ended,
                EndReason::Declined(reason.to_string()),
                false,
            )
            .await;
        Ok(())
    }

    /// Hang up. Sends `call-end` and releases the transport; a no-op when
    /// there is no active call with `peer_id`.
    pub async fn end_call(&self, peer_id: &str) -> Result<()> {
        let inner = &self.inner;
        let _turn = inner.turn(peer_id).await;
        match inner.session(peer_id) {
            Some(session) if session.is_active() => {
                info!(peer_id, call_id = %session.call_id, state = %session.state, "Ending call");
                inner
                    .finish(peer_id, CallState::Ended, EndReason::LocalHangup, true)
                    .await;
            }
            _ => debug!(peer_id, "end_call: no active call"),
        }
        Ok(())
    }

    pub fn toggle_audio(&self, enabled: bool) {
        self.inner
            .adapter
            .set_local_media_enabled(MediaKind::Audio, enabled);
    }

    pub fn toggle_video(&self, enabled: bool) {
        self.inner
            .adapter
            .set_local_media_enabled(MediaKind::Video, enabled);
    }

    pub async fn stats(&self, peer_id: &str) -> Result<SessionStats> {
        let stats = self.inner.adapter.stats(peer_id).await?;
        dump_selected_pair(peer_id, &stats, "ON-DEMAND");
        Ok(stats)
    }

    /// Send a payload over the out-of-band data channel of an active call
    pub async fn send_data(&self, peer_id: &str, data: Bytes) -> Result<()> {
        self.inner.adapter.send_data(peer_id, data).await
    }

    pub fn session(&self, peer_id: &str) -> Option<CallSession> {
        self.inner.session(peer_id)
    }

    pub fn active_sessions(&self) -> Vec<CallSession> {
        self.inner
            .peers
            .lock()
            .values()
            .filter_map(|r| r.session.clone())
            .filter(CallSession::is_active)
            .collect()
    }

    /// End every active call and release the local capture
    pub async fn shutdown(&self) {
        let peers: Vec<String> = self
            .active_sessions()
            .into_iter()
            .map(|s| s.peer_id)
            .collect();
        for peer_id in peers {
            let _ = self.end_call(&peer_id).await;
        }
        self.inner.adapter.release_local_media();
        info!("Call coordinator shut down");
    }
}

impl<E: TransportEngine, C: SecureChannel> Inner<E, C> {
    /// Wait for exclusive access to `peer_id`
    async fn turn(&self, peer_id: &str) -> Turn<'_> {
        let lock = Arc::clone(self.turns.lock().entry(peer_id.to_string()).or_default());
        let guard = lock.lock_owned().await;
        Turn {
            turns: &self.turns,
            peer_id: peer_id.to_string(),
            guard: Some(guard),
        }
    }

    fn session(&self, peer_id: &str) -> Option<CallSession> {
        self.peers
            .lock()
            .get(peer_id)
            .and_then(|r| r.session.clone())
    }

    fn update<R>(&self, peer_id: &str, f: impl FnOnce(&mut PeerRecord) -> R) -> R {
        let mut peers = self.peers.lock();
        f(peers.entry(peer_id.to_string()).or_default())
    }

    fn emit(&self, event: CallEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Replace the record's session with a fresh one
    fn record_session(&self, session: CallSession) {
        let peer_id = session.peer_id.clone();
        self.update(&peer_id, |r| {
            r.remote_tracks.clear();
            r.abort_timers();
            r.session = Some(session);
        });
    }

    /// Move the session along an allowed edge and announce it
    fn transition(&self, peer_id: &str, to: CallState) -> bool {
        let from = self.update(peer_id, |r| r.session.as_mut().and_then(|s| s.advance(to)));
        match from {
            Some(from) => {
                info!(peer_id, %from, %to, "Call state transition");
                self.emit(CallEvent::CallStateChanged {
                    peer_id: peer_id.to_string(),
                    from,
                    to,
                });
                true
            }
            None => {
                warn!(peer_id, %to, "Ignoring disallowed call state transition");
                false
            }
        }
    }

    fn expect_ringing(&self, peer_id: &str, call_id: &str, operation: &str) -> Result<()> {
        match self.session(peer_id) {
            Some(s) if s.state == CallState::IncomingRinging && s.call_id == call_id => Ok(()),
            Some(s) if s.state == CallState::IncomingRinging => {
                warn!(peer_id, expected = %s.call_id, got = call_id, "{operation}: call id mismatch");
                Err(CallError::invalid_state(
                    peer_id,
                    format!("{operation}: no ringing call with id {call_id}"),
                ))
            }
            other => {
                let state = other.map_or_else(|| "idle".to_string(), |s| s.state.to_string());
                warn!(peer_id, state = %state, "{operation} ignored: call is not ringing");
                Err(CallError::invalid_state(
                    peer_id,
                    format!("{operation} while {state}"),
                ))
            }
        }
    }

    async fn send(&self, peer_id: &str, message: SignalMessage) -> Result<()> {
        if !self.channel.is_open() {
            return Err(CallError::ChannelClosed);
        }
        if message.is_negotiation() && !self.adapter.has_session(peer_id) {
            warn!(peer_id, kind = message.kind(), "Not sending negotiation message without a transport session");
            return Err(CallError::SessionNotFound(peer_id.to_string()));
        }
        debug!(peer_id, kind = message.kind(), "Sending signaling message");
        self.channel.send(OutboundSignal::new(peer_id, message)).await
    }

    async fn ensure_local_media(&self) -> Result<()> {
        if self.adapter.has_local_media() {
            return Ok(());
        }
        self.adapter.acquire_local_media(&self.config.media).await
    }

    /// Initiator side: transport, call-request, offer
    async fn start_outgoing(&self, peer_id: &str, call_id: &str) -> Result<()> {
        self.ensure_local_media().await?;
        self.adapter.open_session(peer_id, true).await?;

        self.record_session(CallSession::new(
            peer_id,
            call_id,
            CallRole::Initiator,
            CallState::OutgoingRequested,
        ));
        self.update(peer_id, |r| r.early_candidates.clear());

        self.send(
            peer_id,
            SignalMessage::CallRequest {
                call_id: call_id.to_string(),
            },
        )
        .await?;

        let offer = self.adapter.generate_offer(peer_id).await?;
        self.send(
            peer_id,
            SignalMessage::Offer {
                sdp: offer,
                call_id: Some(call_id.to_string()),
            },
        )
        .await
    }

    /// Receiver side after accepting: transport, call-accept, and the offer if
    /// it already arrived
    async fn start_incoming(&self, peer_id: &str, call_id: &str) -> Result<()> {
        self.ensure_local_media().await?;
        self.adapter.open_session(peer_id, false).await?;

        self.send(
            peer_id,
            SignalMessage::CallAccept {
                call_id: call_id.to_string(),
            },
        )
        .await?;
        self.transition(peer_id, CallState::Negotiating);
        self.flush_early_candidates(peer_id).await;

        let pending = self.update(peer_id, |r| {
            r.session.as_mut().and_then(|s| s.pending_offer.take())
        });
        if let Some(offer) = pending {
            self.answer_offer(peer_id, offer).await?;
        }
        Ok(())
    }

    /// Apply a remote offer and send the answer back
    async fn answer_offer(&self, peer_id: &str, offer: SessionDescription) -> Result<()> {
        let answer = self
            .adapter
            .apply_remote_offer_and_answer(peer_id, offer)
            .await?;
        let call_id = self.session(peer_id).map(|s| s.call_id);
        self.send(peer_id, SignalMessage::Answer { sdp: answer, call_id })
            .await
    }

    /// Hand buffered candidates to the transport session, in arrival order
    async fn flush_early_candidates(&self, peer_id: &str) {
        let buffered = self.update(peer_id, |r| std::mem::take(&mut r.early_candidates));
        if buffered.is_empty() {
            return;
        }
        debug!(peer_id, count = buffered.len(), "Handing early candidates to transport");
        for candidate in buffered {
            if let Err(e) = self.adapter.add_remote_candidate(peer_id, candidate).await {
                warn!(peer_id, error = %e, "Dropping early candidate");
            }
        }
    }

    /// Drive an active session to a terminal state and release its transport.
    /// Does nothing if the session is already terminal.
    async fn finish(&self, peer_id: &str, state: CallState, reason: EndReason, notify_remote: bool) {
        let Some(session) = self.session(peer_id).filter(CallSession::is_active) else {
            return;
        };

        if notify_remote {
            let end = SignalMessage::CallEnd {
                call_id: session.call_id.clone(),
            };
            if let Err(e) = self.send(peer_id, end).await {
                warn!(peer_id, error = %e, "Failed to send call-end");
            }
        }

        self.adapter.close_session(peer_id).await;

        let tracks = self.update(peer_id, |r| {
            r.early_candidates.clear();
            r.abort_timers();
            if let Some(s) = r.session.as_mut() {
                s.end_reason = Some(reason.clone());
            }
            std::mem::take(&mut r.remote_tracks)
        });
        self.transition(peer_id, state);

        if !tracks.is_empty() {
            self.emit(CallEvent::RemoteMediaRemoved {
                peer_id: peer_id.to_string(),
                tracks,
            });
        }
        let duration = self
            .session(peer_id)
            .and_then(|s| s.duration())
            .map(|d| d.num_seconds());
        info!(peer_id, call_id = %session.call_id, ?reason, ?duration, "Call finished");
        self.emit(CallEvent::CallEnded {
            peer_id: peer_id.to_string(),
            call_id: session.call_id,
            reason,
        });
    }

    /// Turn negotiation failures into a failed call; other errors leave the session alone
    async fn fail_on_negotiation<T>(&self, peer_id: &str, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if matches!(e, CallError::Negotiation { .. }) => {
                self.finish(peer_id, CallState::Failed, EndReason::Error(e.to_string()), true)
                    .await;
                Err(e)
            }
            other => other,
        }
    }
}
