use crate::peer::engine::LocalTrack;
use crate::peer::ice::CandidateQueue;
use crate::peer::types::MediaKind;
use std::sync::Arc;
use tracing::debug;

/// Период ожидания перед принудительным отключением (default grace period, seconds)
pub const GRACE_PERIOD_SECS: u64 = 0;

/// Метка data channel по умолчанию
pub const DATA_CHANNEL_LABEL: &str = "ssc-data";

/// Bookkeeping for one engine connection
pub struct TransportSession<C> {
    /// Distinguishes this connection from earlier ones to the same peer
    pub id: u64,
    pub peer_id: String,
    pub connection: Arc<C>,
    pub is_initiator: bool,
    pub local_description_committed: bool,
    pub remote_description_applied: bool,
    pub candidates: CandidateQueue,
    pub attached_tracks: Vec<String>,
    pub data_channel: Option<String>,
}

impl<C> TransportSession<C> {
    pub fn new(id: u64, peer_id: &str, connection: Arc<C>, is_initiator: bool) -> Self {
        Self {
            id,
            peer_id: peer_id.to_string(),
            connection,
            is_initiator,
            local_description_committed: false,
            remote_description_applied: false,
            candidates: CandidateQueue::new(),
            attached_tracks: Vec::new(),
            data_channel: None,
        }
    }

    /// Both descriptions committed
    pub fn is_negotiated(&self) -> bool {
        self.local_description_committed && self.remote_description_applied
    }
}

/// The single local capture, shared by all transport sessions
pub struct LocalMedia<T> {
    tracks: Vec<Arc<T>>,
}

impl<T: LocalTrack> LocalMedia<T> {
    pub fn new(tracks: Vec<Arc<T>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<T>] {
        &self.tracks
    }

    /// Returns how many tracks were switched
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        let mut switched = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            switched += 1;
        }
        debug!(%kind, enabled, switched, "Local tracks toggled");
        switched
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
