use super::*;
use crate::link::LinkState;
use crate::test_utils::{GatedCaptureDevice, LinkCall, MockConnector, MockLink};
use pretty_assertions::assert_eq;
use std::time::Duration;
use test_log::test;
use tokio_tungstenite::tungstenite;
use vidlink_protocol::MessageKind;
use vidlink_signaling::client::SignalingClient;
use vidlink_signaling::test_utils::{AwaitTungsteniteMessageExt, MockRelay};
use vidlink_signaling::transport::mock::MockTransport;
use vidlink_webrtc::{CaptureFeed, MediaKind, RemoteTrackInfo};

const TIMEOUT: Duration = Duration::from_millis(500);
const QUIET_PERIOD: Duration = Duration::from_millis(100);

struct Party {
    id: &'static str,
    handle: CallHandle,
    device: Arc<GatedCaptureDevice>,
    feed: CaptureFeed,
    connector: Arc<MockConnector>,
    transport: MockTransport,
    outgoing: broadcast::Receiver<tungstenite::Message>,
    events: broadcast::Receiver<SessionEvent>,
    controller_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Party {
    async fn join(relay: &MockRelay, id: &'static str, shutdown_token: &CancellationToken) -> Self {
        Self::join_gated(relay, id, true, shutdown_token).await
    }

    /// Joins with capture requests held until [`GatedCaptureDevice::open`] if `media_ready` is false.
    async fn join_gated(
        relay: &MockRelay,
        id: &'static str,
        media_ready: bool,
        shutdown_token: &CancellationToken,
    ) -> Self {
        let transport = relay.transport(id);
        let outgoing = transport.subscribe_outgoing();
        let client = SignalingClient::new(
            transport.clone(),
            id,
            shutdown_token.child_token(),
            &tokio::runtime::Handle::current(),
        );
        let gateway = SignalingGateway::new(client);
        gateway.connect().await.unwrap();

        let (device, feed) = GatedCaptureDevice::new(media_ready);
        let connector = Arc::new(MockConnector::new());
        let controller_token = shutdown_token.child_token();
        let (handle, task) = CallController::spawn(
            &SessionConfig::default(),
            gateway,
            MediaSourceProvider::new(device.clone()),
            connector.clone(),
            controller_token.clone(),
        );
        let events = handle.subscribe();

        Self {
            id,
            handle,
            device,
            feed,
            connector,
            transport,
            outgoing,
            events,
            controller_token,
            task,
        }
    }

    /// Injects an envelope as if the signaling server delivered it.
    fn deliver(&self, from: &str, message: SignalingMessage) {
        self.transport
            .deliver(&Envelope::new(from, self.id, message));
    }

    async fn wait_for_phase(&self, phase: CallPhase) -> CallSnapshot {
        let mut snapshot_rx = self.handle.subscribe_snapshot();
        let snapshot = tokio::time::timeout(TIMEOUT, snapshot_rx.wait_for(|s| s.phase == phase))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} did not reach {phase}, last snapshot: {:?}",
                    self.id,
                    self.handle.snapshot()
                )
            })
            .unwrap()
            .clone();
        snapshot
    }

    async fn expect_sent(&mut self, kind: MessageKind) -> Envelope {
        let result = self
            .outgoing
            .recv_envelope_with_timeout(TIMEOUT, |envelope| envelope.kind() == kind)
            .await;
        result.unwrap_or_else(|err| panic!("{} did not send {kind}: {err}", self.id))
    }

    async fn assert_not_sent(&mut self, kind: MessageKind) {
        let result = self
            .outgoing
            .recv_envelope_with_timeout(QUIET_PERIOD, |envelope| envelope.kind() == kind)
            .await;
        assert!(result.is_err(), "{} unexpectedly sent {result:?}", self.id);
    }

    async fn expect_event<F>(&mut self, predicate: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        let events = &mut self.events;
        let result = tokio::time::timeout(TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => continue,
                    Err(err) => panic!("Session events closed: {err}"),
                }
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("{} did not emit the expected event", self.id))
    }

    async fn link(&self, index: usize) -> Arc<MockLink> {
        self.connector.wait_for_link(index, TIMEOUT).await.unwrap()
    }
}

async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{what} did not happen in time"));
}

fn ended_with(reason: EndReason) -> impl Fn(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::CallEnded { reason: r, .. } if *r == reason)
}

fn is_answer(call: &LinkCall) -> bool {
    matches!(call, LinkCall::SetRemote(RemoteDescription::Answer(_)))
}

/// Drives `caller` and `callee` into an active call and returns their peer links.
async fn establish(caller: &mut Party, callee: &mut Party) -> (Arc<MockLink>, Arc<MockLink>) {
    caller.handle.place_call(callee.id).await.unwrap();
    callee.wait_for_phase(CallPhase::Incoming).await;
    callee.handle.accept_incoming().await.unwrap();

    caller.expect_sent(MessageKind::Offer).await;
    callee.expect_sent(MessageKind::Answer).await;
    let caller_link = caller.link(0).await;
    let callee_link = callee.link(0).await;
    caller_link
        .wait_for_calls(TIMEOUT, |calls| calls.iter().any(is_answer))
        .await
        .unwrap();

    caller_link.emit_state(LinkState::Connected);
    callee_link.emit_state(LinkState::Connected);
    caller.wait_for_phase(CallPhase::Active).await;
    callee.wait_for_phase(CallPhase::Active).await;

    (caller_link, callee_link)
}

#[test(tokio::test)]
async fn call_reaches_active_on_both_sides() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    alice.handle.place_call("bob").await.unwrap();
    assert_eq!(alice.handle.snapshot().phase, CallPhase::Outgoing);
    assert_eq!(
        alice.expect_sent(MessageKind::CallInitiated).await,
        Envelope::new("alice", "bob", SignalingMessage::CallInitiated)
    );

    let snapshot = bob.wait_for_phase(CallPhase::Incoming).await;
    assert_eq!(snapshot.remote_party_id.as_deref(), Some("alice"));
    assert!(!snapshot.has_peer_link);
    assert_eq!(
        bob.expect_event(|event| matches!(event, SessionEvent::IncomingCall { .. }))
            .await,
        SessionEvent::IncomingCall {
            from: "alice".to_string()
        }
    );

    bob.handle.accept_incoming().await.unwrap();
    assert_eq!(bob.handle.snapshot().phase, CallPhase::IncomingAccepted);
    assert_eq!(
        bob.expect_sent(MessageKind::CallAccepted).await,
        Envelope::new("bob", "alice", SignalingMessage::CallAccepted)
    );
    let bob_link = bob.link(0).await;
    assert!(bob.feed.is_capturing(MediaKind::Audio));
    assert!(bob.feed.is_capturing(MediaKind::Video));

    alice.wait_for_phase(CallPhase::OutgoingAccepted).await;
    assert_eq!(
        alice.expect_sent(MessageKind::Offer).await,
        Envelope::new(
            "alice",
            "bob",
            SignalingMessage::Offer {
                sdp: "offer-0".to_string()
            }
        )
    );
    let alice_link = alice.link(0).await;

    assert_eq!(
        bob.expect_sent(MessageKind::Answer).await,
        Envelope::new(
            "bob",
            "alice",
            SignalingMessage::Answer {
                sdp: "answer-0".to_string()
            }
        )
    );
    assert_eq!(
        bob_link.calls(),
        vec![
            LinkCall::SetRemote(RemoteDescription::Offer("offer-0".to_string())),
            LinkCall::CreateAnswer,
        ]
    );
    alice_link
        .wait_for_calls(TIMEOUT, |calls| calls.iter().any(is_answer))
        .await
        .unwrap();
    assert_eq!(
        alice_link.calls(),
        vec![
            LinkCall::CreateOffer,
            LinkCall::SetRemote(RemoteDescription::Answer("answer-0".to_string())),
        ]
    );

    alice_link.emit_local_candidate("candidate-a");
    assert_eq!(
        alice.expect_sent(MessageKind::IceCandidate).await,
        Envelope::new(
            "alice",
            "bob",
            SignalingMessage::IceCandidate {
                candidate: "candidate-a".to_string()
            }
        )
    );
    bob_link
        .wait_for_calls(TIMEOUT, |calls| {
            calls.contains(&LinkCall::AddCandidate("candidate-a".to_string()))
        })
        .await
        .unwrap();

    alice_link.emit_state(LinkState::Connected);
    bob_link.emit_state(LinkState::Connected);
    let snapshot = alice.wait_for_phase(CallPhase::Active).await;
    assert!(snapshot.has_peer_link);
    assert!(snapshot.local_media.is_some());
    bob.wait_for_phase(CallPhase::Active).await;
    assert_eq!(
        bob.expect_event(|event| matches!(event, SessionEvent::Established { .. }))
            .await,
        SessionEvent::Established {
            remote_party_id: "alice".to_string()
        }
    );

    let track = RemoteTrackInfo {
        id: "remote-video".to_string(),
        stream_id: "remote-stream".to_string(),
        kind: MediaKind::Video,
    };
    bob_link.emit_remote_track(track.clone());
    bob.expect_event(|event| matches!(event, SessionEvent::RemoteTrack { .. }))
        .await;
    eventually("remote track in snapshot", || {
        bob.handle.snapshot().remote_tracks == vec![track.clone()]
    })
    .await;
}

#[test(tokio::test)]
async fn rejecting_incoming_call_never_acquires_media() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    alice.handle.place_call("bob").await.unwrap();
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.reject_incoming().await.unwrap();

    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    assert_eq!(
        bob.expect_sent(MessageKind::CallRejected).await,
        Envelope::new("bob", "alice", SignalingMessage::CallRejected)
    );
    bob.expect_event(ended_with(EndReason::Rejected)).await;

    alice.wait_for_phase(CallPhase::Idle).await;
    alice.expect_event(ended_with(EndReason::RemoteRejected)).await;

    assert_eq!(bob.device.requests(), 0);
    assert_eq!(bob.connector.link_count(), 0);
    assert_eq!(alice.device.requests(), 0);
    assert_eq!(alice.connector.link_count(), 0);
}

#[test(tokio::test)]
async fn connection_failure_tears_down_silently() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    alice.handle.place_call("bob").await.unwrap();
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();
    alice.expect_sent(MessageKind::Offer).await;
    let alice_link = alice.link(0).await;
    assert_eq!(alice.handle.snapshot().phase, CallPhase::OutgoingAccepted);

    alice_link.emit_state(LinkState::Failed);

    let snapshot = alice.wait_for_phase(CallPhase::Idle).await;
    assert!(!snapshot.has_peer_link);
    assert_eq!(snapshot.local_media, None);
    assert!(alice_link.is_closed());
    assert!(alice_link.tracks_stopped());
    alice.expect_event(ended_with(EndReason::ConnectionLost)).await;
    alice.assert_not_sent(MessageKind::EndCall).await;

    // The remote party was not told, it keeps its accepted session.
    assert_eq!(bob.handle.snapshot().phase, CallPhase::IncomingAccepted);
}

#[test(tokio::test)]
async fn hang_up_while_acquiring_media_discards_the_result() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join_gated(&relay, "bob", false, &shutdown_token).await;

    alice.handle.place_call("bob").await.unwrap();
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();
    eventually("capture request", || bob.device.requests() == 1).await;

    bob.handle.hang_up().await.unwrap();
    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    bob.expect_event(ended_with(EndReason::HungUp)).await;

    bob.device.open();
    tokio::time::sleep(QUIET_PERIOD).await;
    eventually("capture to end", || {
        !bob.feed.is_capturing(MediaKind::Audio) && !bob.feed.is_capturing(MediaKind::Video)
    })
    .await;
    assert_eq!(bob.connector.link_count(), 0);
    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    bob.assert_not_sent(MessageKind::EndCall).await;
}

#[test(tokio::test)]
async fn hang_up_notifies_remote_once() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;
    let (alice_link, bob_link) = establish(&mut alice, &mut bob).await;

    alice.handle.hang_up().await.unwrap();
    alice.handle.hang_up().await.unwrap();

    assert_eq!(alice.handle.snapshot(), CallSnapshot::default());
    assert_eq!(
        alice.expect_sent(MessageKind::EndCall).await,
        Envelope::new("alice", "bob", SignalingMessage::EndCall)
    );
    alice.assert_not_sent(MessageKind::EndCall).await;
    assert!(alice_link.is_closed());
    assert!(alice_link.tracks_stopped());
    alice.expect_event(ended_with(EndReason::HungUp)).await;

    bob.wait_for_phase(CallPhase::Idle).await;
    bob.expect_event(ended_with(EndReason::RemoteEnded)).await;
    assert!(bob_link.is_closed());
    bob.assert_not_sent(MessageKind::EndCall).await;
}

#[test(tokio::test)]
async fn stale_sender_is_ignored() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let bob = Party::join(&relay, "bob", &shutdown_token).await;

    alice.handle.place_call("bob").await.unwrap();
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();
    alice.expect_sent(MessageKind::Offer).await;
    let alice_link = alice.link(0).await;
    let calls = alice_link.calls();

    alice.deliver(
        "mallory",
        SignalingMessage::Answer {
            sdp: "forged".to_string(),
        },
    );
    alice.deliver(
        "mallory",
        SignalingMessage::IceCandidate {
            candidate: "forged".to_string(),
        },
    );
    alice.deliver("mallory", SignalingMessage::EndCall);
    tokio::time::sleep(QUIET_PERIOD).await;

    let snapshot = alice.handle.snapshot();
    assert_eq!(snapshot.phase, CallPhase::OutgoingAccepted);
    assert!(snapshot.has_peer_link);
    assert_eq!(alice_link.calls(), calls);
}

#[test(tokio::test)]
async fn invalid_intents_are_rejected() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;

    assert!(matches!(
        alice.handle.place_call("alice").await,
        Err(CallError::SelfCall)
    ));
    assert!(matches!(
        alice.handle.place_call("  ").await,
        Err(CallError::InvalidPartyId(_))
    ));
    assert!(matches!(
        alice.handle.accept_incoming().await,
        Err(CallError::InvalidPhase {
            intent: CallIntent::AcceptIncoming,
            phase: CallPhase::Idle
        })
    ));
    alice.handle.hang_up().await.unwrap();

    alice.handle.place_call("bob").await.unwrap();
    assert!(matches!(
        alice.handle.place_call("carol").await,
        Err(CallError::InvalidPhase {
            intent: CallIntent::PlaceCall,
            phase: CallPhase::Outgoing
        })
    ));
    assert!(matches!(
        alice.handle.reject_incoming().await,
        Err(CallError::InvalidPhase {
            intent: CallIntent::RejectIncoming,
            phase: CallPhase::Outgoing
        })
    ));

    alice.expect_sent(MessageKind::CallInitiated).await;
    alice.assert_not_sent(MessageKind::CallInitiated).await;
}

#[test(tokio::test)]
async fn incoming_call_ignored_while_busy() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let bob = Party::join(&relay, "bob", &shutdown_token).await;

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.deliver("carol", SignalingMessage::CallInitiated);
    tokio::time::sleep(QUIET_PERIOD).await;

    assert_eq!(
        bob.handle.snapshot().remote_party_id.as_deref(),
        Some("alice")
    );
}

#[test(tokio::test)]
async fn end_call_right_after_invitation_ends_session() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.deliver("alice", SignalingMessage::EndCall);

    bob.expect_event(ended_with(EndReason::RemoteEnded)).await;
    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    assert_eq!(bob.device.requests(), 0);

    // The next caller is not blocked by a leftover session.
    bob.deliver("carol", SignalingMessage::CallInitiated);
    let snapshot = bob.wait_for_phase(CallPhase::Incoming).await;
    assert_eq!(snapshot.remote_party_id.as_deref(), Some("carol"));
}

#[test(tokio::test)]
async fn failed_acceptance_tears_down_silently() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.transport.disconnect_token().cancel();
    tokio::time::sleep(QUIET_PERIOD).await;

    assert!(matches!(
        bob.handle.accept_incoming().await,
        Err(CallError::Signaling(_))
    ));
    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    bob.expect_event(ended_with(EndReason::NegotiationFailed))
        .await;
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(bob.device.requests(), 0);
    assert_eq!(bob.connector.link_count(), 0);
}

#[test(tokio::test)]
async fn offer_creation_failure_tears_down_silently() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let bob = Party::join(&relay, "bob", &shutdown_token).await;
    alice.connector.fail_next_negotiation();

    alice.handle.place_call("bob").await.unwrap();
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();

    let event = alice
        .expect_event(ended_with(EndReason::NegotiationFailed))
        .await;
    assert!(matches!(event, SessionEvent::CallEnded { reason, .. } if reason.is_failure()));
    let link = alice.link(0).await;
    assert!(link.is_closed());
    assert!(link.tracks_stopped());
    assert_eq!(link.calls(), vec![LinkCall::CreateOffer, LinkCall::Close]);
    assert_eq!(alice.handle.snapshot(), CallSnapshot::default());
    alice.assert_not_sent(MessageKind::Offer).await;
    alice.assert_not_sent(MessageKind::EndCall).await;
}

#[test(tokio::test)]
async fn answer_creation_failure_tears_down_silently() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;
    bob.connector.fail_next_negotiation();

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();
    let link = bob.link(0).await;

    bob.deliver(
        "alice",
        SignalingMessage::Offer {
            sdp: "offer-alice".to_string(),
        },
    );

    bob.expect_event(ended_with(EndReason::NegotiationFailed))
        .await;
    assert!(link.is_closed());
    assert!(link.tracks_stopped());
    assert_eq!(
        link.calls(),
        vec![
            LinkCall::SetRemote(RemoteDescription::Offer("offer-alice".to_string())),
            LinkCall::CreateAnswer,
            LinkCall::Close,
        ]
    );
    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    bob.assert_not_sent(MessageKind::Answer).await;
    bob.assert_not_sent(MessageKind::EndCall).await;
}

#[test(tokio::test)]
async fn rejected_candidate_keeps_call_alive() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();
    let link = bob.link(0).await;
    link.reject_candidate("malformed");

    bob.deliver(
        "alice",
        SignalingMessage::Offer {
            sdp: "offer-alice".to_string(),
        },
    );
    bob.expect_sent(MessageKind::Answer).await;
    for candidate in ["malformed", "host"] {
        bob.deliver(
            "alice",
            SignalingMessage::IceCandidate {
                candidate: candidate.to_string(),
            },
        );
    }
    link.wait_for_calls(TIMEOUT, |calls| {
        calls.contains(&LinkCall::AddCandidate("host".to_string()))
    })
    .await
    .unwrap();
    assert!(link.calls().contains(&LinkCall::AddCandidate("malformed".to_string())));
    assert!(!link.is_closed());

    let snapshot = bob.handle.snapshot();
    assert_eq!(snapshot.phase, CallPhase::IncomingAccepted);
    assert!(snapshot.has_peer_link);

    link.emit_state(LinkState::Connected);
    bob.wait_for_phase(CallPhase::Active).await;
    bob.assert_not_sent(MessageKind::EndCall).await;
}

#[test(tokio::test)]
async fn duplicate_offer_is_answered_once() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();
    let link = bob.link(0).await;

    let offer = SignalingMessage::Offer {
        sdp: "offer-alice".to_string(),
    };
    bob.deliver("alice", offer.clone());
    bob.deliver("alice", offer);
    bob.expect_sent(MessageKind::Answer).await;
    bob.assert_not_sent(MessageKind::Answer).await;

    assert_eq!(
        link.calls(),
        vec![
            LinkCall::SetRemote(RemoteDescription::Offer("offer-alice".to_string())),
            LinkCall::CreateAnswer,
        ]
    );
}

#[test(tokio::test)]
async fn offer_and_candidates_before_link_are_replayed() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join_gated(&relay, "bob", false, &shutdown_token).await;

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();

    bob.deliver(
        "alice",
        SignalingMessage::Offer {
            sdp: "offer-alice".to_string(),
        },
    );
    for candidate in ["c1", "c2"] {
        bob.deliver(
            "alice",
            SignalingMessage::IceCandidate {
                candidate: candidate.to_string(),
            },
        );
    }
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(bob.connector.link_count(), 0);

    bob.device.open();
    let link = bob.link(0).await;
    bob.expect_sent(MessageKind::Answer).await;
    link.wait_for_calls(TIMEOUT, |calls| calls.len() == 4)
        .await
        .unwrap();
    assert_eq!(
        link.calls(),
        vec![
            LinkCall::SetRemote(RemoteDescription::Offer("offer-alice".to_string())),
            LinkCall::CreateAnswer,
            LinkCall::AddCandidate("c1".to_string()),
            LinkCall::AddCandidate("c2".to_string()),
        ]
    );
}

#[test(tokio::test)]
async fn denied_media_tears_down_silently() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;
    bob.feed.set_permission(false);

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();

    let event = bob.expect_event(ended_with(EndReason::MediaUnavailable)).await;
    assert!(matches!(event, SessionEvent::CallEnded { reason, .. } if reason.is_failure()));
    bob.wait_for_phase(CallPhase::Idle).await;
    assert_eq!(bob.connector.link_count(), 0);
    bob.assert_not_sent(MessageKind::EndCall).await;
}

#[test(tokio::test)]
async fn link_creation_failure_releases_media() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;
    bob.connector.fail_create();

    bob.deliver("alice", SignalingMessage::CallInitiated);
    bob.wait_for_phase(CallPhase::Incoming).await;
    bob.handle.accept_incoming().await.unwrap();

    bob.expect_event(ended_with(EndReason::NegotiationFailed))
        .await;
    assert_eq!(bob.handle.snapshot(), CallSnapshot::default());
    eventually("capture to end", || !bob.feed.is_capturing(MediaKind::Audio)).await;
}

#[test(tokio::test)]
async fn snapshots_keep_link_invariant() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;

    let mut snapshot_rx = alice.handle.subscribe_snapshot();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while snapshot_rx.changed().await.is_ok() {
            seen.push(snapshot_rx.borrow_and_update().clone());
        }
        seen
    });

    establish(&mut alice, &mut bob).await;
    alice.handle.hang_up().await.unwrap();
    alice.controller_token.cancel();
    tokio::time::timeout(TIMEOUT, &mut alice.task)
        .await
        .unwrap()
        .unwrap();
    drop(alice);

    let seen = tokio::time::timeout(TIMEOUT, observer)
        .await
        .unwrap()
        .unwrap();
    assert!(seen.iter().any(|s| s.phase == CallPhase::Active));
    for snapshot in seen {
        assert!(
            !snapshot.has_peer_link || snapshot.phase.is_linked(),
            "peer link in {snapshot:?}"
        );
        assert!(
            snapshot.local_media.is_none() || snapshot.phase != CallPhase::Idle,
            "local media in {snapshot:?}"
        );
    }
}

#[test(tokio::test)]
async fn shutdown_ends_active_call() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let mut alice = Party::join(&relay, "alice", &shutdown_token).await;
    let mut bob = Party::join(&relay, "bob", &shutdown_token).await;
    let (alice_link, _) = establish(&mut alice, &mut bob).await;

    alice.controller_token.cancel();
    tokio::time::timeout(TIMEOUT, &mut alice.task)
        .await
        .unwrap()
        .unwrap();

    assert!(alice_link.is_closed());
    assert_eq!(
        alice.expect_sent(MessageKind::EndCall).await,
        Envelope::new("alice", "bob", SignalingMessage::EndCall)
    );
    bob.wait_for_phase(CallPhase::Idle).await;
    assert!(matches!(
        alice.handle.hang_up().await,
        Err(CallError::ControllerClosed)
    ));
}

#[test(tokio::test)]
async fn dropping_all_handles_stops_controller() {
    let relay = MockRelay::new();
    let shutdown_token = CancellationToken::new();
    let alice = Party::join(&relay, "alice", &shutdown_token).await;

    let Party { handle, task, .. } = alice;
    drop(handle);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
}
