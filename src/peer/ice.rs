use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Remote description not applied yet, everything is queued
    AwaitingRemote,
    /// Remote description applied, queued candidates are being handed over
    Draining,
    /// Queue drained, candidates go straight to the engine
    Live,
}

/// Candidates received before the remote description was applied.
///
/// Arrival order is preserved across the whole lifetime of the queue: while a
/// drain is in progress newly offered candidates are appended behind the ones
/// still pending, so the engine always sees them in the order they arrived.
#[derive(Debug)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    phase: Phase,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            phase: Phase::AwaitingRemote,
        }
    }

    /// Returns the candidate back when it may be applied right away
    pub fn offer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.phase {
            Phase::Live => Some(candidate),
            Phase::AwaitingRemote | Phase::Draining => {
                self.pending.push_back(candidate);
                None
            }
        }
    }

    /// Switch to draining. Only the first call succeeds.
    pub fn begin_drain(&mut self) -> bool {
        if self.phase != Phase::AwaitingRemote {
            return false;
        }
        self.phase = Phase::Draining;
        true
    }

    /// Take everything queued so far. An empty batch ends the drain.
    pub fn next_batch(&mut self) -> Vec<IceCandidate> {
        if self.phase != Phase::Draining {
            return Vec::new();
        }
        if self.pending.is_empty() {
            self.phase = Phase::Live;
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }
}

/// Count candidate types in a batch and log a warning when no relay is present
pub fn analyze_candidates(peer_id: &str, candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(
        peer_id,
        host = host_count,
        srflx = srflx_count,
        relay = relay_count,
        "Remote candidate analysis"
    );

    if relay_count == 0 && !candidates.is_empty() {
        warn!(peer_id, "No TURN relay candidates from remote, connection through NAT may fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 UDP 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn queues_until_remote_description() {
        let mut q = CandidateQueue::new();
        assert!(q.offer(cand(1)).is_none());
        assert!(q.offer(cand(2)).is_none());
        assert_eq!(q.len(), 2);
        assert!(!q.is_live());
    }

    #[test]
    fn drains_in_arrival_order_exactly_once() {
        let mut q = CandidateQueue::new();
        for n in 1..=3 {
            q.offer(cand(n));
        }
        assert!(q.begin_drain());
        assert!(!q.begin_drain());

        let batch = q.next_batch();
        assert_eq!(batch, vec![cand(1), cand(2), cand(3)]);

        // arrived mid-drain: queued behind, not returned for immediate use
        assert!(q.offer(cand(4)).is_none());
        assert_eq!(q.next_batch(), vec![cand(4)]);
        assert!(q.next_batch().is_empty());
        assert!(q.is_live());

        assert_eq!(q.offer(cand(5)), Some(cand(5)));
        assert!(q.is_empty());
    }

    #[test]
    fn batch_before_drain_is_empty() {
        let mut q = CandidateQueue::new();
        q.offer(cand(1));
        assert!(q.next_batch().is_empty());
        assert_eq!(q.len(), 1);
    }
}
