//! Engine events and timers feeding back into the call state machine.

use super::Inner;
use crate::events::CallEvent;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::adapter::TransportEvent;
use crate::peer::engine::{EngineEvent, TransportEngine};
use crate::peer::types::ConnectivityState;
use crate::session::{CallState, EndReason};
use crate::signaling::{SecureChannel, SignalMessage};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Route engine events to one worker per peer. A worker applies its peer's
/// events in arrival order, so a peer whose turn is held up delays only itself.
pub(super) fn spawn_pump<E: TransportEngine, C: SecureChannel>(
    inner: Weak<Inner<E, C>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    tokio::spawn(async move {
        let mut workers: HashMap<String, mpsc::UnboundedSender<TransportEvent>> = HashMap::new();
        while let Some(event) = events.recv().await {
            let Some(strong) = inner.upgrade() else {
                break;
            };
            let worker = workers
                .entry(event.peer_id.clone())
                .or_insert_with(|| spawn_worker(Weak::clone(&inner), &event.peer_id));
            if let Err(mpsc::error::SendError(event)) = worker.send(event) {
                debug!(peer_id = %event.peer_id, "Event worker gone, dropping event");
            }
            // without a transport session everything still queued is stale;
            // the worker drains it and exits once its sender is dropped
            workers.retain(|peer_id, _| strong.adapter.has_session(peer_id));
        }
        debug!("Transport event pump finished");
    });
}

fn spawn_worker<E: TransportEngine, C: SecureChannel>(
    inner: Weak<Inner<E, C>>,
    peer_id: &str,
) -> mpsc::UnboundedSender<TransportEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<TransportEvent>();
    let peer = peer_id.to_string();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.on_transport_event(event).await;
        }
        debug!(peer_id = %peer, "Transport event worker finished");
    });
    tx
}

impl<E: TransportEngine, C: SecureChannel> Inner<E, C> {
    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let TransportEvent {
            peer_id,
            session_id,
            event,
        } = event;
        let _turn = self.turn(&peer_id).await;

        // the session may have been closed while the event waited for its turn
        if self.adapter.session_id(&peer_id) != Some(session_id) {
            debug!(peer_id = %peer_id, session_id, ?event, "Dropping event of a closed session");
            return;
        }

        match event {
            EngineEvent::CandidateDiscovered(candidate) => {
                dump_candidate("LOCAL", &peer_id, &candidate);
                if let Err(e) = self
                    .send(&peer_id, SignalMessage::IceCandidate(candidate))
                    .await
                {
                    warn!(peer_id = %peer_id, error = %e, "Failed to send local candidate");
                }
            }
            EngineEvent::StateChanged(state) => {
                self.on_connectivity(&peer_id, session_id, state).await
            }
            EngineEvent::TrackArrived(track) => {
                info!(peer_id = %peer_id, track_id = %track.id, kind = %track.kind, "Remote track");
                self.update(&peer_id, |r| r.remote_tracks.push(track.clone()));
                self.emit(CallEvent::RemoteMediaAvailable {
                    peer_id: peer_id.clone(),
                    track,
                });
            }
            EngineEvent::DataChannelArrived { label } => {
                info!(peer_id = %peer_id, label = %label, "Data channel ready");
            }
            EngineEvent::DataMessage { label, data } => {
                debug!(peer_id = %peer_id, label = %label, len = data.len(), "Data message");
                self.emit(CallEvent::DataMessage {
                    peer_id: peer_id.clone(),
                    label,
                    data,
                });
            }
        }
    }

    async fn on_connectivity(self: &Arc<Self>, peer_id: &str, session_id: u64, state: ConnectivityState) {
        info!(peer_id, %state, "Connectivity changed");
        self.update(peer_id, |r| {
            if let Some(session) = r.session.as_mut() {
                session.connectivity = Some(state);
            }
        });
        self.emit(CallEvent::ConnectionStateChanged {
            peer_id: peer_id.to_string(),
            state,
        });

        let Some(session) = self.session(peer_id).filter(|s| s.is_active()) else {
            return;
        };

        match state {
            ConnectivityState::Connected => {
                self.cancel_disconnect_check(peer_id);
                match session.state {
                    CallState::Negotiating if self.adapter.is_negotiated(peer_id) => {
                        self.transition(peer_id, CallState::Established);
                        if let Ok(stats) = self.adapter.stats(peer_id).await {
                            dump_selected_pair(peer_id, &stats, "ON-CONNECT");
                        }
                    }
                    CallState::Established => info!(peer_id, "Connection recovered"),
                    other => debug!(peer_id, state = %other, "Connected before negotiation finished"),
                }
            }
            ConnectivityState::Disconnected => {
                let grace = self.config.disconnect_grace();
                if grace.is_zero() {
                    self.finish(peer_id, CallState::Failed, EndReason::ConnectionFailed, false)
                        .await;
                } else {
                    self.schedule_disconnect_check(peer_id, session_id, grace);
                }
            }
            ConnectivityState::Failed | ConnectivityState::Closed => {
                warn!(peer_id, %state, "Connection lost");
                self.finish(peer_id, CallState::Failed, EndReason::ConnectionFailed, false)
                    .await;
            }
            ConnectivityState::New | ConnectivityState::Connecting => {}
        }
    }

    /// Fail the call unless the connection recovers within `grace`
    fn schedule_disconnect_check(self: &Arc<Self>, peer_id: &str, session_id: u64, grace: Duration) {
        let pending = self.update(peer_id, |r| {
            r.disconnect_task.as_ref().is_some_and(|t| !t.is_finished())
        });
        if pending {
            debug!(peer_id, "Disconnect check already scheduled");
            return;
        }

        info!(peer_id, grace_secs = grace.as_secs(), "Connection disconnected, waiting for recovery");
        let weak = Arc::downgrade(self);
        let peer = peer_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let _turn = inner.turn(&peer).await;
            // finish() aborts the scheduled task, which is this one
            drop(inner.update(&peer, |r| r.disconnect_task.take()));
            let still_down = inner.adapter.session_id(&peer) == Some(session_id)
                && inner
                    .session(&peer)
                    .is_some_and(|s| s.connectivity == Some(ConnectivityState::Disconnected));
            if still_down {
                warn!(peer_id = %peer, "Connection did not recover");
                inner
                    .finish(&peer, CallState::Failed, EndReason::ConnectionFailed, false)
                    .await;
            }
        });
        self.update(peer_id, |r| r.disconnect_task = Some(task));
    }

    fn cancel_disconnect_check(&self, peer_id: &str) {
        let task = self.update(peer_id, |r| r.disconnect_task.take());
        if let Some(task) = task {
            task.abort();
            debug!(peer_id, "Disconnect check cancelled");
        }
    }

    /// End an outgoing call that is still not established after the configured timeout
    pub(super) fn schedule_request_timeout(self: &Arc<Self>, peer_id: &str, call_id: &str) {
        let Some(timeout) = self.config.request_timeout() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let peer = peer_id.to_string();
        let call_id = call_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let _turn = inner.turn(&peer).await;
            drop(inner.update(&peer, |r| r.request_task.take()));
            let pending = inner.session(&peer).is_some_and(|s| {
                s.call_id == call_id
                    && matches!(s.state, CallState::OutgoingRequested | CallState::Negotiating)
            });
            if pending {
                warn!(peer_id = %peer, call_id = %call_id, "Call not established in time, cancelling");
                inner
                    .finish(&peer, CallState::Ended, EndReason::Timeout, true)
                    .await;
            }
        });
        let previous = self.update(peer_id, |r| r.request_task.replace(task));
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
