//! Per-peer wrapper around engine connections.
//!
//! The adapter owns one [`TransportSession`] per peer plus the shared local
//! capture. Engine events are tagged with the peer and the session id and
//! pushed to the receiver returned by [`TransportAdapter::new`]; events of a
//! connection that is no longer current are dropped.

use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::peer::engine::{EngineConnection, EngineEvent, LocalTrack, TrackOf, TransportEngine};
use crate::peer::ice::analyze_candidates;
use crate::peer::state::{LocalMedia, TransportSession};
use crate::peer::types::{
    IceCandidate, MediaConstraints, MediaKind, SdpType, SessionDescription, SessionStats,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine event tagged with the peer it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub peer_id: String,
    pub session_id: u64,
    pub event: EngineEvent,
}

type Sessions<C> = Arc<Mutex<HashMap<String, TransportSession<C>>>>;

pub struct TransportAdapter<E: TransportEngine> {
    engine: E,
    data_channel_label: String,
    sessions: Sessions<E::Connection>,
    local_media: Mutex<Option<Arc<LocalMedia<TrackOf<E>>>>>,
    next_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl<E: TransportEngine> TransportAdapter<E> {
    pub fn new(
        engine: E,
        data_channel_label: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let adapter = Self {
            engine,
            data_channel_label: data_channel_label.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            local_media: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events_tx,
        };
        (adapter, events_rx)
    }

    /// Open the capture devices. A second call replaces (and stops) the previous capture.
    pub async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<()> {
        if constraints.kinds().is_empty() {
            return Err(CallError::MediaAcquisition(
                "no media kinds requested".to_string(),
            ));
        }

        let tracks = self
            .engine
            .acquire_local_media(constraints)
            .await
            .map_err(|e| CallError::MediaAcquisition(e.to_string()))?;
        info!(tracks = tracks.len(), "Local media acquired");

        let previous = self
            .local_media
            .lock()
            .replace(Arc::new(LocalMedia::new(tracks)));
        if let Some(previous) = previous {
            if !self.sessions.lock().is_empty() {
                warn!("Local media replaced while transport sessions are open");
            }
            previous.stop_all();
        }
        Ok(())
    }

    pub fn has_local_media(&self) -> bool {
        self.local_media.lock().is_some()
    }

    /// Stop and drop the local capture
    pub fn release_local_media(&self) {
        if let Some(media) = self.local_media.lock().take() {
            media.stop_all();
            info!("Local media released");
        }
    }

    /// Toggle every local track of `kind`; returns how many were switched
    pub fn set_local_media_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        match self.local_media.lock().as_ref() {
            Some(media) => media.set_enabled(kind, enabled),
            None => {
                debug!(%kind, enabled, "No local media to toggle");
                0
            }
        }
    }

    /// Create the connection for `peer_id`, attach local tracks and, for the
    /// initiator, the data channel.
    pub async fn open_session(&self, peer_id: &str, is_initiator: bool) -> Result<u64> {
        let creation_error = |reason: String| CallError::SessionCreation {
            peer_id: peer_id.to_string(),
            reason,
        };

        if self.sessions.lock().contains_key(peer_id) {
            return Err(creation_error("session already exists".to_string()));
        }
        let media = self
            .local_media
            .lock()
            .clone()
            .ok_or_else(|| creation_error("local media not acquired".to_string()))?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(
            self.engine
                .connect(peer_id, engine_tx)
                .await
                .map_err(|e| creation_error(e.to_string()))?,
        );

        let mut attached = Vec::with_capacity(media.tracks().len());
        for track in media.tracks() {
            if let Err(e) = connection.add_track(Arc::clone(track)).await {
                let _ = connection.close().await;
                return Err(creation_error(format!("attaching {} track: {e}", track.kind())));
            }
            attached.push(track.id().to_string());
        }

        let data_channel = if is_initiator {
            if let Err(e) = connection.create_data_channel(&self.data_channel_label).await {
                let _ = connection.close().await;
                return Err(creation_error(format!("creating data channel: {e}")));
            }
            Some(self.data_channel_label.clone())
        } else {
            None
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inserted = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(peer_id) {
                false
            } else {
                let mut session =
                    TransportSession::new(id, peer_id, Arc::clone(&connection), is_initiator);
                session.attached_tracks = attached;
                session.data_channel = data_channel;
                sessions.insert(peer_id.to_string(), session);
                true
            }
        };
        if !inserted {
            let _ = connection.close().await;
            return Err(creation_error("session already exists".to_string()));
        }

        self.spawn_forwarder(peer_id, id, engine_rx);
        info!(peer_id, session_id = id, is_initiator, "Transport session opened");
        Ok(id)
    }

    /// Create and locally commit an offer
    pub async fn generate_offer(&self, peer_id: &str) -> Result<SessionDescription> {
        let (connection, id) = self.checked(peer_id, |s| {
            if !s.is_initiator {
                Err("offers are generated on initiator sessions only")
            } else if s.local_description_committed {
                Err("local offer already committed")
            } else {
                Ok(())
            }
        })?;

        let offer = connection
            .create_offer()
            .await
            .map_err(|e| negotiation(peer_id, "create offer", e))?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation(peer_id, "commit local offer", e))?;
        self.with_current(peer_id, id, |s| s.local_description_committed = true)?;

        debug!(peer_id, sdp_len = offer.sdp.len(), "Local offer committed");
        Ok(offer)
    }

    /// Commit a remote offer, drain queued candidates, create and commit the answer
    pub async fn apply_remote_offer_and_answer(
        &self,
        peer_id: &str,
        remote: SessionDescription,
    ) -> Result<SessionDescription> {
        if remote.kind != SdpType::Offer {
            return Err(CallError::invalid_state(peer_id, "expected a remote offer"));
        }
        let (connection, id) = self.checked(peer_id, |s| {
            if s.is_initiator {
                Err("remote offers are applied on receiver sessions only")
            } else if s.remote_description_applied {
                Err("session already negotiated")
            } else {
                Ok(())
            }
        })?;

        connection
            .set_remote_description(remote)
            .await
            .map_err(|e| negotiation(peer_id, "apply remote offer", e))?;
        self.with_current(peer_id, id, |s| s.remote_description_applied = true)?;
        self.drain_candidates(peer_id, id, &connection).await?;

        let answer = connection
            .create_answer()
            .await
            .map_err(|e| negotiation(peer_id, "create answer", e))?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation(peer_id, "commit local answer", e))?;
        self.with_current(peer_id, id, |s| s.local_description_committed = true)?;

        debug!(peer_id, sdp_len = answer.sdp.len(), "Local answer committed");
        Ok(answer)
    }

    /// Commit the remote answer on an initiator session that already sent its offer
    pub async fn apply_remote_answer(&self, peer_id: &str, remote: SessionDescription) -> Result<()> {
        if remote.kind != SdpType::Answer {
            return Err(CallError::invalid_state(peer_id, "expected a remote answer"));
        }
        let (connection, id) = self.checked(peer_id, |s| {
            if !s.is_initiator {
                Err("answers are applied on initiator sessions only")
            } else if !s.local_description_committed {
                Err("no local offer committed")
            } else if s.remote_description_applied {
                Err("remote answer already applied")
            } else {
                Ok(())
            }
        })?;

        connection
            .set_remote_description(remote)
            .await
            .map_err(|e| negotiation(peer_id, "apply remote answer", e))?;
        self.with_current(peer_id, id, |s| s.remote_description_applied = true)?;
        self.drain_candidates(peer_id, id, &connection).await?;

        debug!(peer_id, "Remote answer applied");
        Ok(())
    }

    /// Hand one remote candidate to the engine, or queue it until the remote
    /// description is applied. Engine failures are logged only.
    pub async fn add_remote_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let (connection, ready) = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(peer_id)
                .ok_or_else(|| CallError::SessionNotFound(peer_id.to_string()))?;
            (Arc::clone(&session.connection), session.candidates.offer(candidate))
        };

        match ready {
            Some(candidate) => apply_candidate(peer_id, connection.as_ref(), candidate).await,
            None => debug!(peer_id, "Remote description not set yet, queuing candidate"),
        }
        Ok(())
    }

    /// Close the connection and forget the session. Unknown peers are a no-op.
    pub async fn close_session(&self, peer_id: &str) -> bool {
        let session = self.sessions.lock().remove(peer_id);
        let Some(session) = session else {
            debug!(peer_id, "close_session: nothing to close");
            return false;
        };

        if let Err(e) = session.connection.close().await {
            warn!(peer_id, error = %e, "Engine reported an error while closing");
        }
        info!(
            peer_id,
            session_id = session.id,
            released_tracks = session.attached_tracks.len(),
            dropped_candidates = session.candidates.len(),
            "Transport session closed"
        );
        true
    }

    pub async fn stats(&self, peer_id: &str) -> Result<SessionStats> {
        let (connection, _) = self.checked(peer_id, |_| Ok(()))?;
        Ok(connection.stats().await)
    }

    /// Send a payload over the out-of-band data channel
    pub async fn send_data(&self, peer_id: &str, data: Bytes) -> Result<()> {
        let data_error = |reason: String| CallError::DataChannel {
            peer_id: peer_id.to_string(),
            reason,
        };
        let connection = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(peer_id)
                .ok_or_else(|| CallError::SessionNotFound(peer_id.to_string()))?;
            if session.data_channel.is_none() {
                return Err(data_error("no data channel yet".to_string()));
            }
            Arc::clone(&session.connection)
        };
        connection
            .send_data(data)
            .await
            .map_err(|e| data_error(e.to_string()))
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.lock().contains_key(peer_id)
    }

    /// Both the local and the remote description are committed
    pub fn is_negotiated(&self, peer_id: &str) -> bool {
        self.sessions
            .lock()
            .get(peer_id)
            .is_some_and(|s| s.is_negotiated())
    }

    pub fn session_id(&self, peer_id: &str) -> Option<u64> {
        self.sessions.lock().get(peer_id).map(|s| s.id)
    }

    pub fn queued_candidates(&self, peer_id: &str) -> usize {
        self.sessions
            .lock()
            .get(peer_id)
            .map_or(0, |s| s.candidates.len())
    }

    pub fn attached_tracks(&self, peer_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .get(peer_id)
            .map(|s| s.attached_tracks.clone())
            .unwrap_or_default()
    }

    pub fn data_channel(&self, peer_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(peer_id)
            .and_then(|s| s.data_channel.clone())
    }

    /// Connection handle and id, after `check` accepted the session
    fn checked(
        &self,
        peer_id: &str,
        check: impl FnOnce(&TransportSession<E::Connection>) -> std::result::Result<(), &'static str>,
    ) -> Result<(Arc<E::Connection>, u64)> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(peer_id)
            .ok_or_else(|| CallError::SessionNotFound(peer_id.to_string()))?;
        check(session).map_err(|reason| CallError::invalid_state(peer_id, reason))?;
        Ok((Arc::clone(&session.connection), session.id))
    }

    /// Run `f` on the session if it is still the one with `id`. A session that
    /// was closed or replaced while an engine step was in flight yields
    /// `SessionNotFound` and the step's result is discarded.
    fn with_current<R>(
        &self,
        peer_id: &str,
        id: u64,
        f: impl FnOnce(&mut TransportSession<E::Connection>) -> R,
    ) -> Result<R> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(peer_id) {
            Some(session) if session.id == id => Ok(f(session)),
            _ => {
                debug!(peer_id, session_id = id, "Discarding result for a torn-down session");
                Err(CallError::SessionNotFound(peer_id.to_string()))
            }
        }
    }

    async fn drain_candidates(
        &self,
        peer_id: &str,
        id: u64,
        connection: &Arc<E::Connection>,
    ) -> Result<()> {
        if !self.with_current(peer_id, id, |s| s.candidates.begin_drain())? {
            return Ok(());
        }

        let mut applied = 0usize;
        loop {
            let batch = self.with_current(peer_id, id, |s| s.candidates.next_batch())?;
            if batch.is_empty() {
                break;
            }
            analyze_candidates(peer_id, &batch);
            for candidate in batch {
                apply_candidate(peer_id, connection.as_ref(), candidate).await;
                applied += 1;
            }
        }
        debug!(peer_id, applied, "Pending candidates drained");
        Ok(())
    }

    fn spawn_forwarder(&self, peer_id: &str, id: u64, mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>) {
        let sessions: Weak<_> = Arc::downgrade(&self.sessions);
        let events_tx = self.events_tx.clone();
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                let Some(sessions) = sessions.upgrade() else {
                    break;
                };
                let current = {
                    let mut sessions = sessions.lock();
                    match sessions.get_mut(&peer_id) {
                        Some(session) if session.id == id => {
                            if let EngineEvent::DataChannelArrived { label } = &event {
                                session.data_channel = Some(label.clone());
                            }
                            true
                        }
                        _ => false,
                    }
                };
                if !current {
                    debug!(peer_id = %peer_id, session_id = id, ?event, "Dropping event of a closed session");
                    continue;
                }
                let tagged = TransportEvent {
                    peer_id: peer_id.clone(),
                    session_id: id,
                    event,
                };
                if events_tx.send(tagged).is_err() {
                    break;
                }
            }
            debug!(peer_id = %peer_id, session_id = id, "Engine event forwarder finished");
        });
    }
}

async fn apply_candidate<C: EngineConnection>(peer_id: &str, connection: &C, candidate: IceCandidate) {
    dump_candidate("REMOTE", peer_id, &candidate);
    if let Err(e) = connection.add_ice_candidate(candidate).await {
        warn!(peer_id, error = %e, "Failed to add ICE candidate");
    }
}

fn negotiation(peer_id: &str, step: &str, e: crate::error::EngineError) -> CallError {
    CallError::Negotiation {
        peer_id: peer_id.to_string(),
        reason: format!("{step}: {e}"),
    }
}
