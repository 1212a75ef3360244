//! Scripted engine and recording secure channel for tests.
//!
//! Enabled for this crate's unit tests and, through the `test-util` feature,
//! for integration tests and downstream crates.

use crate::error::{CallError, EngineError, Result};
use crate::events::CallEvent;
use crate::peer::engine::{
    EngineConnection, EngineEvent, EngineEventSender, LocalTrack, TrackOf, TransportEngine,
};
use crate::peer::types::{
    ConnectivityState, IceCandidate, MediaConstraints, MediaKind, SessionDescription,
    SessionStats,
};
use crate::signaling::{OutboundSignal, SecureChannel, SignalMessage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Every call the coordinator made on a scripted connection
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Connect,
    AddTrack(String),
    CreateDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    SendData(Bytes),
    Close,
}

#[derive(Debug)]
pub struct ScriptedTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl ScriptedTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for ScriptedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Script {
    calls: Mutex<HashMap<String, Vec<EngineCall>>>,
    senders: Mutex<HashMap<String, EngineEventSender>>,
    tracks: Mutex<Vec<Arc<ScriptedTrack>>>,
    capture_error: Mutex<Option<String>>,
    connect_error: Mutex<Option<String>>,
    offer_error: Mutex<Option<String>>,
    answer_error: Mutex<Option<String>>,
    reject_candidates: AtomicBool,
    hold_offers: AtomicBool,
    offer_held: Notify,
    offer_release: Notify,
    counter: AtomicU64,
}

impl Script {
    fn record(&self, peer_id: &str, call: EngineCall) {
        self.calls
            .lock()
            .entry(peer_id.to_string())
            .or_default()
            .push(call);
    }
}

/// In-memory engine whose connections record calls and succeed unless told otherwise
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, peer_id: &str) -> Vec<EngineCall> {
        self.script
            .calls
            .lock()
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn applied_candidates(&self, peer_id: &str) -> Vec<IceCandidate> {
        self.calls(peer_id)
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self, peer_id: &str) -> usize {
        self.calls(peer_id)
            .iter()
            .filter(|c| matches!(c, EngineCall::Close))
            .count()
    }

    pub fn connect_count(&self, peer_id: &str) -> usize {
        self.calls(peer_id)
            .iter()
            .filter(|c| matches!(c, EngineCall::Connect))
            .count()
    }

    pub fn tracks(&self) -> Vec<Arc<ScriptedTrack>> {
        self.script.tracks.lock().clone()
    }

    pub fn track_enabled(&self, kind: MediaKind) -> bool {
        self.script
            .tracks
            .lock()
            .iter()
            .filter(|t| t.kind == kind)
            .all(|t| t.is_enabled())
    }

    /// Push an engine event on the newest connection to `peer_id`
    pub fn emit(&self, peer_id: &str, event: EngineEvent) {
        if let Some(tx) = self.script.senders.lock().get(peer_id) {
            let _ = tx.send(event);
        }
    }

    pub fn set_state(&self, peer_id: &str, state: ConnectivityState) {
        self.emit(peer_id, EngineEvent::StateChanged(state));
    }

    pub fn fail_capture(&self, reason: &str) {
        *self.script.capture_error.lock() = Some(reason.to_string());
    }

    pub fn fail_connect(&self, reason: &str) {
        *self.script.connect_error.lock() = Some(reason.to_string());
    }

    pub fn fail_next_offer(&self, reason: &str) {
        *self.script.offer_error.lock() = Some(reason.to_string());
    }

    pub fn fail_next_answer(&self, reason: &str) {
        *self.script.answer_error.lock() = Some(reason.to_string());
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.script.reject_candidates.store(reject, Ordering::SeqCst);
    }

    /// Make `create_offer` park until [`release_offers`](Self::release_offers)
    pub fn hold_offers(&self, hold: bool) {
        self.script.hold_offers.store(hold, Ordering::SeqCst);
    }

    pub async fn wait_for_held_offer(&self) {
        self.script.offer_held.notified().await;
    }

    pub fn release_offers(&self) {
        self.script.hold_offers.store(false, Ordering::SeqCst);
        self.script.offer_release.notify_one();
    }
}

#[async_trait]
impl TransportEngine for ScriptedEngine {
    type Connection = ScriptedConnection;

    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<TrackOf<Self>>>, EngineError> {
        if let Some(reason) = self.script.capture_error.lock().clone() {
            return Err(EngineError::new(reason));
        }
        let tracks: Vec<_> = constraints
            .kinds()
            .into_iter()
            .map(|kind| {
                Arc::new(ScriptedTrack {
                    id: format!("local-{kind}"),
                    kind,
                    enabled: AtomicBool::new(true),
                    stopped: AtomicBool::new(false),
                })
            })
            .collect();
        *self.script.tracks.lock() = tracks.clone();
        Ok(tracks)
    }

    async fn connect(
        &self,
        peer_id: &str,
        events: EngineEventSender,
    ) -> Result<ScriptedConnection, EngineError> {
        self.script.record(peer_id, EngineCall::Connect);
        if let Some(reason) = self.script.connect_error.lock().take() {
            return Err(EngineError::new(reason));
        }
        self.script
            .senders
            .lock()
            .insert(peer_id.to_string(), events);
        Ok(ScriptedConnection {
            peer_id: peer_id.to_string(),
            script: Arc::clone(&self.script),
        })
    }
}

pub struct ScriptedConnection {
    peer_id: String,
    script: Arc<Script>,
}

impl ScriptedConnection {
    fn record(&self, call: EngineCall) {
        self.script.record(&self.peer_id, call);
    }

    fn next_sdp(&self, what: &str) -> String {
        let n = self.script.counter.fetch_add(1, Ordering::SeqCst);
        format!("v=0 {what} {} {n}", self.peer_id)
    }
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    type Track = ScriptedTrack;

    async fn add_track(&self, track: Arc<ScriptedTrack>) -> Result<(), EngineError> {
        self.record(EngineCall::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), EngineError> {
        self.record(EngineCall::CreateDataChannel(label.to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        if self.script.hold_offers.load(Ordering::SeqCst) {
            self.script.offer_held.notify_one();
            self.script.offer_release.notified().await;
        }
        if let Some(reason) = self.script.offer_error.lock().take() {
            return Err(EngineError::new(reason));
        }
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        if let Some(reason) = self.script.answer_error.lock().take() {
            return Err(EngineError::new(reason));
        }
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocal(desc));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemote(desc));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddCandidate(candidate));
        if self.script.reject_candidates.load(Ordering::SeqCst) {
            return Err(EngineError::new("candidate rejected"));
        }
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<(), EngineError> {
        self.record(EngineCall::SendData(data));
        Ok(())
    }

    async fn stats(&self) -> SessionStats {
        SessionStats::default()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        Ok(())
    }
}

#[derive(Default)]
struct ChannelLog {
    sent: Mutex<Vec<OutboundSignal>>,
    closed: AtomicBool,
    failing: AtomicBool,
}

/// Secure channel that keeps everything it is asked to send
#[derive(Clone, Default)]
pub struct RecordingChannel {
    log: Arc<ChannelLog>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open(&self, open: bool) {
        self.log.closed.store(!open, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.log.failing.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.log.sent.lock().clone()
    }

    /// Hand over everything sent so far, e.g. to relay it to the other side
    pub fn take(&self) -> Vec<OutboundSignal> {
        std::mem::take(&mut *self.log.sent.lock())
    }

    pub fn messages(&self) -> Vec<SignalMessage> {
        self.sent().into_iter().map(|s| s.data.message).collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages().iter().map(SignalMessage::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl SecureChannel for RecordingChannel {
    fn is_open(&self) -> bool {
        !self.log.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        if self.log.failing.load(Ordering::SeqCst) {
            return Err(CallError::Channel("scripted send failure".to_string()));
        }
        self.log.sent.lock().push(signal);
        Ok(())
    }
}

/// Next event matching `pred`, skipping everything else. Panics after five seconds.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    let next = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream broke: {e}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .expect("timed out waiting for call event")
}
