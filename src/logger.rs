use crate::config::CallConfig;
use crate::peer::types::{IceCandidate, SessionStats};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. Honors `RUST_LOG`; otherwise logs this crate at
/// debug level when logging is enabled and nothing at all when it is not.
/// Calling it twice (or after the host installed its own subscriber) is harmless.
pub fn init(config: &CallConfig) {
    let default_directive = if config.logging { "ssc_call=debug,webrtc=warn" } else { "off" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, peer_id: &str, cand: &IceCandidate) {
    debug!(
        peer_id,
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// Быстрый снимок getStats → выбранная пара
pub fn dump_selected_pair(peer_id: &str, stats: &SessionStats, moment: &str) {
    match &stats.selected_pair {
        Some(pair) => debug!(
            peer_id,
            "STATS {moment}: {}:{} bytes={}/{} state={}",
            pair.local_candidate_id,
            pair.remote_candidate_id,
            pair.bytes_sent,
            pair.bytes_received,
            pair.state
        ),
        None => debug!(peer_id, "STATS {moment}: no nominated candidate pair"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::CandidatePairStats;

    #[test]
    fn init_twice_is_harmless() {
        let config = CallConfig::default();
        init(&config);
        init(&config);
        dump_selected_pair("bob", &SessionStats::default(), "TEST");
        dump_selected_pair(
            "bob",
            &SessionStats {
                selected_pair: Some(CandidatePairStats {
                    local_candidate_id: "l".into(),
                    remote_candidate_id: "r".into(),
                    state: "Succeeded".into(),
                    bytes_sent: 1,
                    bytes_received: 2,
                }),
                bytes_sent: 1,
                bytes_received: 2,
            },
            "TEST",
        );
    }
}
