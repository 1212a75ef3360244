use ssc_call::peer::{ConnectivityState, EngineEvent, IceCandidate, MediaKind, RemoteTrack};
use ssc_call::testing::{wait_for_event, EngineCall, RecordingChannel, ScriptedEngine};
use ssc_call::{
    CallConfig, CallCoordinator, CallEvent, CallRole, CallState, EndReason, InboundSignal,
    SignalMessage,
};
use bytes::Bytes;
use std::time::Duration;

type Coordinator = CallCoordinator<ScriptedEngine, RecordingChannel>;

struct Party {
    id: &'static str,
    coordinator: Coordinator,
    engine: ScriptedEngine,
    channel: RecordingChannel,
}

impl Party {
    fn new(id: &'static str) -> Self {
        let engine = ScriptedEngine::new();
        let channel = RecordingChannel::new();
        let config = CallConfig {
            logging: false,
            ..CallConfig::default()
        }
        .with_local_peer_id(id);
        let coordinator = CallCoordinator::new(config, engine.clone(), channel.clone());
        Self {
            id,
            coordinator,
            engine,
            channel,
        }
    }

    /// Deliver everything `self` sent so far to `to`, as raw JSON frames
    async fn relay_to(&self, to: &Party) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        for signal in self.channel.take() {
            assert_eq!(signal.to, to.id);
            kinds.push(signal.data.message.kind());
            let inbound = InboundSignal {
                from: self.id.to_string(),
                data: signal.data,
            };
            let raw = serde_json::to_string(&inbound).unwrap();
            to.coordinator.handle_inbound(&raw).await;
        }
        kinds
    }
}

fn cand(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 UDP 1686052607 203.0.113.{n} 40000 typ srflx"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// alice calls bob, bob accepts, both connect
async fn established_call(alice: &Party, bob: &Party) -> String {
    let mut alice_events = alice.coordinator.subscribe();
    let mut bob_events = bob.coordinator.subscribe();

    let call_id = alice.coordinator.initiate_call("bob", None).await.unwrap();
    assert_eq!(
        alice.relay_to(bob).await,
        vec!["rtc:call-request", "rtc:offer"]
    );
    match wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::IncomingCallRequest { .. })
    })
    .await
    {
        CallEvent::IncomingCallRequest { peer_id, call_id: id } => {
            assert_eq!(peer_id, "alice");
            assert_eq!(id, call_id);
        }
        other => panic!("unexpected {other:?}"),
    }

    bob.coordinator.accept_call("alice", &call_id).await.unwrap();
    assert_eq!(
        bob.relay_to(alice).await,
        vec!["rtc:call-accept", "rtc:answer"]
    );
    wait_for_event(&mut alice_events, |e| {
        matches!(e, CallEvent::CallAccepted { .. })
    })
    .await;

    alice.engine.set_state("bob", ConnectivityState::Connected);
    bob.engine.set_state("alice", ConnectivityState::Connected);
    for events in [&mut alice_events, &mut bob_events] {
        wait_for_event(events, |e| {
            matches!(
                e,
                CallEvent::CallStateChanged {
                    to: CallState::Established,
                    ..
                }
            )
        })
        .await;
    }
    call_id
}

#[tokio::test]
async fn call_is_established_end_to_end() {
    let alice = Party::new("alice");
    let bob = Party::new("bob");
    let call_id = established_call(&alice, &bob).await;

    let a = alice.coordinator.session("bob").unwrap();
    let b = bob.coordinator.session("alice").unwrap();
    assert_eq!(a.call_id, call_id);
    assert_eq!(b.call_id, call_id);
    assert_eq!(a.role, CallRole::Initiator);
    assert_eq!(b.role, CallRole::Receiver);
    assert_eq!(a.state, CallState::Established);
    assert_eq!(b.state, CallState::Established);
    assert!(a.start_time.is_some() && b.start_time.is_some());

    // bob answered exactly the offer alice committed
    let offer = alice
        .engine
        .calls("bob")
        .into_iter()
        .find_map(|c| match c {
            EngineCall::SetLocal(desc) => Some(desc),
            _ => None,
        })
        .unwrap();
    assert!(bob.engine.calls("alice").contains(&EngineCall::SetRemote(offer)));
    assert_eq!(alice.coordinator.active_sessions().len(), 1);
}

#[tokio::test]
async fn trickled_candidates_cross_over() {
    let alice = Party::new("alice");
    let bob = Party::new("bob");
    let mut alice_events = alice.coordinator.subscribe();

    alice.coordinator.initiate_call("bob", None).await.unwrap();
    alice
        .engine
        .emit("bob", EngineEvent::CandidateDiscovered(cand(1)));
    alice
        .engine
        .emit("bob", EngineEvent::CandidateDiscovered(cand(2)));
    alice.engine.set_state("bob", ConnectivityState::Connecting);
    wait_for_event(&mut alice_events, |e| {
        matches!(e, CallEvent::ConnectionStateChanged { .. })
    })
    .await;

    // bob is still ringing: candidates wait in the coordinator, not the engine
    assert_eq!(
        alice.relay_to(&bob).await,
        vec![
            "rtc:call-request",
            "rtc:offer",
            "rtc:ice-candidate",
            "rtc:ice-candidate"
        ]
    );
    assert!(bob.engine.calls("alice").is_empty());

    let call_id = bob.coordinator.session("alice").unwrap().call_id;
    bob.coordinator.accept_call("alice", &call_id).await.unwrap();
    assert_eq!(bob.engine.applied_candidates("alice"), vec![cand(1), cand(2)]);

    // late candidates go straight to the engine
    alice
        .engine
        .emit("bob", EngineEvent::CandidateDiscovered(cand(3)));
    eventually("third candidate", || alice.channel.count("rtc:ice-candidate") == 1).await;
    alice.relay_to(&bob).await;
    assert_eq!(bob.engine.applied_candidates("alice").len(), 3);
}

#[tokio::test]
async fn early_candidates_before_bare_offer() {
    let bob = Party::new("bob");
    for n in 1..=3 {
        let raw = serde_json::json!({
            "from": "alice",
            "data": {
                "type": "rtc:ice-candidate",
                "timestamp": 1,
                "candidate": cand(n).candidate,
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        });
        bob.coordinator.handle_inbound(&raw.to_string()).await;
    }
    let offer = serde_json::json!({
        "from": "alice",
        "data": { "type": "rtc:offer", "timestamp": 2, "sdp": { "type": "offer", "sdp": "v=0 alice" } }
    });
    bob.coordinator.handle_inbound(&offer.to_string()).await;

    assert_eq!(
        bob.engine.applied_candidates("alice"),
        vec![cand(1), cand(2), cand(3)]
    );
    assert_eq!(bob.channel.kinds(), vec!["rtc:call-accept", "rtc:answer"]);
    assert_eq!(
        bob.coordinator.session("alice").map(|s| s.state),
        Some(CallState::Negotiating)
    );
}

#[tokio::test]
async fn hanging_up_an_established_call() {
    let alice = Party::new("alice");
    let bob = Party::new("bob");
    let call_id = established_call(&alice, &bob).await;
    let mut alice_events = alice.coordinator.subscribe();
    let mut bob_events = bob.coordinator.subscribe();

    bob.engine.emit(
        "alice",
        EngineEvent::TrackArrived(RemoteTrack {
            id: "alice-video".into(),
            stream_id: "alice-stream".into(),
            kind: MediaKind::Video,
        }),
    );
    wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::RemoteMediaAvailable { .. })
    })
    .await;

    alice.coordinator.end_call("bob").await.unwrap();
    alice.coordinator.end_call("bob").await.unwrap();
    assert_eq!(alice.relay_to(&bob).await, vec!["rtc:call-end"]);
    assert_eq!(alice.engine.close_count("bob"), 1);

    match wait_for_event(&mut alice_events, |e| matches!(e, CallEvent::CallEnded { .. })).await {
        CallEvent::CallEnded { reason, call_id: id, .. } => {
            assert_eq!(reason, EndReason::LocalHangup);
            assert_eq!(id, call_id);
        }
        other => panic!("unexpected {other:?}"),
    }
    wait_for_event(&mut bob_events, |e| {
        matches!(e, CallEvent::RemoteMediaRemoved { tracks, .. } if tracks.len() == 1)
    })
    .await;
    match wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::CallEnded { .. })).await {
        CallEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::RemoteHangup),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(bob.engine.close_count("alice"), 1);
    assert_eq!(bob.channel.count("rtc:call-end"), 0);
    let ended = alice.coordinator.session("bob").unwrap();
    assert_eq!(ended.state, CallState::Ended);
    assert!(ended.ended_at.is_some());
    assert!(ended.duration().is_some());
    assert!(alice.coordinator.active_sessions().is_empty());

    // a new call to the same peer starts from scratch
    alice.coordinator.initiate_call("bob", None).await.unwrap();
    assert_eq!(alice.engine.connect_count("bob"), 2);
}

#[tokio::test]
async fn declined_call_never_opens_transport() {
    let alice = Party::new("alice");
    let bob = Party::new("bob");
    let mut alice_events = alice.coordinator.subscribe();

    let call_id = alice.coordinator.initiate_call("bob", None).await.unwrap();
    alice.relay_to(&bob).await;
    bob.coordinator
        .reject_call("alice", &call_id, "busy")
        .await
        .unwrap();
    assert_eq!(bob.relay_to(&alice).await, vec!["rtc:call-reject"]);

    match wait_for_event(&mut alice_events, |e| {
        matches!(e, CallEvent::CallRejected { .. })
    })
    .await
    {
        CallEvent::CallRejected { reason, .. } => assert_eq!(reason, "busy"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(bob.engine.connect_count("alice"), 0);
    assert_eq!(alice.engine.close_count("bob"), 1);
    assert_eq!(
        alice.coordinator.session("bob").unwrap().end_reason,
        Some(EndReason::Rejected("busy".into()))
    );
}

#[tokio::test]
async fn simultaneous_calls_settle_on_one() {
    let alice = Party::new("alice");
    let bob = Party::new("bob");

    let alice_call = alice.coordinator.initiate_call("bob", None).await.unwrap();
    bob.coordinator.initiate_call("alice", None).await.unwrap();

    // both requests cross on the wire
    alice.relay_to(&bob).await;
    bob.relay_to(&alice).await;
    // bob yielded and answered alice's offer
    assert_eq!(
        bob.relay_to(&alice).await,
        Vec::<&str>::new(),
        "nothing left from the first relay"
    );
    alice.relay_to(&bob).await;

    let a = alice.coordinator.session("bob").unwrap();
    let b = bob.coordinator.session("alice").unwrap();
    assert_eq!(a.call_id, alice_call);
    assert_eq!(b.call_id, alice_call);
    assert_eq!(a.role, CallRole::Initiator);
    assert_eq!(b.role, CallRole::Receiver);
    assert_eq!(a.state, CallState::Negotiating);
    assert_eq!(b.state, CallState::Negotiating);
}

#[tokio::test]
async fn data_channel_payloads_surface_as_events() {
    let alice = Party::new("alice");
    let bob = Party::new("bob");
    established_call(&alice, &bob).await;
    let mut bob_events = bob.coordinator.subscribe();

    alice
        .coordinator
        .send_data("bob", Bytes::from_static(b"ping"))
        .await
        .unwrap();
    assert!(alice
        .engine
        .calls("bob")
        .contains(&EngineCall::SendData(Bytes::from_static(b"ping"))));

    // receiver learns about the channel from the engine
    bob.engine.emit(
        "alice",
        EngineEvent::DataChannelArrived {
            label: "ssc-data".into(),
        },
    );
    bob.engine.emit(
        "alice",
        EngineEvent::DataMessage {
            label: "ssc-data".into(),
            data: Bytes::from_static(b"ping"),
        },
    );
    match wait_for_event(&mut bob_events, |e| matches!(e, CallEvent::DataMessage { .. })).await {
        CallEvent::DataMessage { data, label, .. } => {
            assert_eq!(label, "ssc-data");
            assert_eq!(&data[..], b"ping");
        }
        other => panic!("unexpected {other:?}"),
    }
    bob.coordinator
        .send_data("alice", Bytes::from_static(b"pong"))
        .await
        .unwrap();
}

#[tokio::test]
async fn signaling_to_closed_channel_fails_fast() {
    let alice = Party::new("alice");
    alice.channel.set_open(false);
    let err = alice.coordinator.initiate_call("bob", None).await.unwrap_err();
    assert!(matches!(err, ssc_call::CallError::Transport { .. }));
    assert_eq!(alice.engine.connect_count("bob"), 0);
    assert!(!SignalMessage::CallEnd { call_id: "x".into() }.is_negotiation());
}
