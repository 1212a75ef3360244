//! webrtc-rs binding of the transport engine.
//!
//! There is no capture device access here: local tracks are sample tracks the
//! host feeds with encoded frames through [`RtcLocalTrack::write_sample`].

use crate::config::CallConfig;
use crate::error::EngineError;
use crate::peer::data_channel::attach_dc;
use crate::peer::engine::{EngineConnection, EngineEvent, EngineEventSender, LocalTrack, TransportEngine};
use crate::peer::types::{
    CandidatePairStats, ConnectivityState, IceCandidate, MediaConstraints, MediaKind, RemoteTrack,
    SdpType, ServerConfig, SessionDescription, SessionStats,
};
use crate::utils::{add_ice_url_scheme, random_id};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Engine backed by `webrtc::api::API`
pub struct RtcEngine {
    api: API,
    ice_servers: Vec<ServerConfig>,
}

impl RtcEngine {
    pub fn new(config: &CallConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    /// Создает конфигурацию для peer connection
    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.ice_servers),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// ServerConfig -> RTCIceServer, adding the url scheme where it is missing
pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl TransportEngine for RtcEngine {
    type Connection = RtcConnection;

    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<RtcLocalTrack>>, EngineError> {
        let stream_id = format!("ssc-{}", random_id());
        let tracks = constraints
            .kinds()
            .into_iter()
            .map(|kind| Arc::new(RtcLocalTrack::new(kind, &stream_id)))
            .collect();
        Ok(tracks)
    }

    async fn connect(
        &self,
        peer_id: &str,
        events: EngineEventSender,
    ) -> Result<RtcConnection, EngineError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);
        let data_channel = Arc::new(Mutex::new(None));
        install_handlers(peer_id, &pc, &events, &data_channel);
        debug!(peer_id, "Peer connection created");

        Ok(RtcConnection {
            peer_id: peer_id.to_string(),
            pc,
            events,
            data_channel,
        })
    }
}

fn install_handlers(
    peer_id: &str,
    pc: &Arc<RTCPeerConnection>,
    events: &EngineEventSender,
    data_channel: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand.map(|c| c.to_json()) {
            Some(Ok(init)) => {
                let _ = tx.send(EngineEvent::CandidateDiscovered(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                }));
            }
            Some(Err(e)) => warn!(error = %e, "Failed to serialize local candidate"),
            // cand == None означает конец сбора
            None => debug!("ICE candidate gathering completed"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    let peer = peer_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(peer_id = %peer, "Peer connection state changed to: {st:?}");
        if let Some(state) = connectivity(st) {
            let _ = tx.send(EngineEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            let _ = tx.send(EngineEvent::TrackArrived(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    let slot = Arc::clone(data_channel);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        attach_dc(&dc, tx.clone());
        *slot.lock() = Some(dc);
        Box::pin(async {})
    }));
}

fn connectivity(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

/// One `RTCPeerConnection` and its data channel
pub struct RtcConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    events: EngineEventSender,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

#[async_trait]
impl EngineConnection for RtcConnection {
    type Track = RtcLocalTrack;

    async fn add_track(&self, track: Arc<RtcLocalTrack>) -> Result<(), EngineError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.sample_track();
        self.pc.add_track(local).await?;
        debug!(peer_id = %self.peer_id, track_id = track.id(), "Local track attached");
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), EngineError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        attach_dc(&dc, self.events.clone());
        *self.data_channel.lock() = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<(), EngineError> {
        let dc = self
            .data_channel
            .lock()
            .clone()
            .ok_or_else(|| EngineError::new("data channel not open"))?;
        dc.send(&data).await?;
        Ok(())
    }

    async fn stats(&self) -> SessionStats {
        let report = self.pc.get_stats().await;
        let mut stats = SessionStats::default();
        for (_, v) in report.reports {
            if let StatsReportType::CandidatePair(pair) = v {
                stats.bytes_sent += pair.bytes_sent;
                stats.bytes_received += pair.bytes_received;
                if pair.nominated {
                    stats.selected_pair = Some(CandidatePairStats {
                        local_candidate_id: pair.local_candidate_id,
                        remote_candidate_id: pair.remote_candidate_id,
                        state: format!("{:?}", pair.state),
                        bytes_sent: pair.bytes_sent,
                        bytes_received: pair.bytes_received,
                    });
                }
            }
        }
        stats
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.data_channel.lock().take();
        self.pc.close().await?;
        info!(peer_id = %self.peer_id, "Peer connection closed");
        Ok(())
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(EngineError::new(format!(
            "unsupported session description type: {other}"
        ))),
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

/// Sample-fed local track. Muted or stopped tracks swallow samples.
pub struct RtcLocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    fn new(kind: MediaKind, stream_id: &str) -> Self {
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{kind}-{}", random_id()),
            stream_id.to_string(),
        ));
        Self {
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Push one encoded frame to every connection the track is attached to
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Relaxed) || !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl LocalTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
