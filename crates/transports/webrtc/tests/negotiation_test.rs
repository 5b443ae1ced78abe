//! Two dispatchers negotiating over an in-memory signaling network

mod harness;

use harness::{init_logging, settle, Node};
use peermux_webrtc::testing::SignalingNetwork;
use peermux_webrtc::{IceConnectionState, NegotiationState, PeerState, Role, SignalingMessage};
use std::time::Duration;

const A: &str = "100.64.0.1";
const B: &str = "100.64.0.2";

#[tokio::test(start_paused = true)]
async fn test_offer_and_answer_each_sent_once() {
    init_logging();
    let network = SignalingNetwork::new();
    let a = Node::join(&network, A, 200);
    let b = Node::join(&network, B, 100);

    a.sees_online(&[&b]).await;
    b.sees_online(&[&a]).await;
    settle().await;

    let a_conn = a.dispatcher.connection(&b.address).expect("A connects to B");
    let b_conn = b.dispatcher.connection(&a.address).expect("B connects to A");
    assert_eq!(a_conn.role(), Role::Offerer);
    assert_eq!(b_conn.role(), Role::Answerer);
    assert_eq!(b_conn.state(), NegotiationState::WaitingForOffer);

    // Offerer gathers two candidates; the offer goes out once gathering completes
    let a_rtc = a.rtc.last().unwrap();
    a_rtc.gather("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host");
    a_rtc.gather("candidate:2 1 udp 1686052607 203.0.113.1 50001 typ srflx");
    settle().await;
    assert_eq!(network.count(&a.address, &b.address, "offer-with-candidates"), 0);
    a_rtc.complete_gathering();
    settle().await;

    let b_rtc = b.rtc.last().expect("answerer built a connection for the offer");
    assert_eq!(b_rtc.remote_candidates().len(), 2);
    assert_eq!(b_conn.state(), NegotiationState::Negotiating);

    b_rtc.gather("candidate:3 1 udp 2122260223 10.0.0.2 50002 typ host");
    b_rtc.complete_gathering();
    settle().await;

    assert_eq!(a_rtc.remote_candidates().len(), 1);
    assert!(a_rtc.remote_description().is_some());

    a_rtc.set_ice_state(IceConnectionState::Connected);
    b_rtc.set_ice_state(IceConnectionState::Connected);
    settle().await;

    assert_eq!(network.count(&a.address, &b.address, "offer-with-candidates"), 1);
    assert_eq!(network.count(&b.address, &a.address, "answer-with-candidates"), 1);
    assert_eq!(a_conn.state(), NegotiationState::Connected);
    assert_eq!(b_conn.state(), NegotiationState::Connected);
    assert_eq!(
        a.dispatcher.status().get(&b.address).unwrap().state,
        PeerState::Connected
    );
    assert!(a.dispatcher.status().get(&b.address).unwrap().is_offerer);
    assert!(!b.dispatcher.status().get(&a.address).unwrap().is_offerer);
}

#[tokio::test(start_paused = true)]
async fn test_early_offer_replayed_once() {
    init_logging();
    let network = SignalingNetwork::new();
    let a = Node::join(&network, A, 200);
    let b = Node::join(&network, B, 100);

    // Only A has seen B come online; B has no connection when the offer lands
    a.sees_online(&[&b]).await;
    settle().await;
    let a_rtc = a.rtc.last().unwrap();
    a_rtc.gather("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host");
    a_rtc.complete_gathering();
    settle().await;

    assert!(b.dispatcher.connection(&a.address).is_none());
    assert!(matches!(
        b.dispatcher.pending_message(&a.address),
        Some(SignalingMessage::OfferWithCandidates { .. })
    ));
    assert!(b.rtc.created().is_empty());

    b.sees_online(&[&a]).await;
    settle().await;

    assert!(b.dispatcher.pending_message(&a.address).is_none());
    assert_eq!(b.rtc.created().len(), 1);
    let b_rtc = b.rtc.last().unwrap();
    assert_eq!(b_rtc.remote_candidates().len(), 1);

    b_rtc.complete_gathering();
    settle().await;
    assert_eq!(network.count(&b.address, &a.address, "answer-with-candidates"), 1);
    assert_eq!(b.rtc.created().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_equal_identifiers_fall_back_to_address() {
    init_logging();
    let network = SignalingNetwork::new();
    let a = Node::join(&network, A, 7);
    let b = Node::join(&network, B, 7);

    a.sees_online(&[&b]).await;
    b.sees_online(&[&a]).await;
    settle().await;

    let a_role = a.dispatcher.connection(&b.address).unwrap().role();
    let b_role = b.dispatcher.connection(&a.address).unwrap().role();
    assert_ne!(a_role, b_role);
    assert_eq!(b_role, Role::Offerer);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_answerer_gets_new_offer() {
    init_logging();
    let network = SignalingNetwork::new();
    let a = Node::join(&network, A, 200);
    let b = Node::join(&network, B, 100);

    a.sees_online(&[&b]).await;
    b.sees_online(&[&a]).await;
    settle().await;

    let a_rtc = a.rtc.last().unwrap();
    a_rtc.complete_gathering();
    settle().await;
    let b_rtc = b.rtc.last().unwrap();
    b_rtc.complete_gathering();
    settle().await;

    b_rtc.set_ice_state(IceConnectionState::Failed);
    settle().await;
    let b_conn = b.dispatcher.connection(&a.address).unwrap();
    assert_eq!(b_conn.state(), NegotiationState::Reconnecting);
    assert_eq!(network.count(&b.address, &a.address, "ask-offer"), 0);

    tokio::time::advance(Duration::from_secs(6)).await;
    settle().await;

    assert_eq!(network.count(&b.address, &a.address, "ask-offer"), 1);
    assert_eq!(a.rtc.created().len(), 2);
    assert!(a_rtc.is_closed());

    // The restarted round reaches B as a fresh offer
    a.rtc.last().unwrap().complete_gathering();
    settle().await;
    assert_eq!(network.count(&a.address, &b.address, "offer-with-candidates"), 2);
    assert_eq!(b.rtc.created().len(), 2);
    assert!(b_rtc.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_peer_offline_closes_both_sides_independently() {
    init_logging();
    let network = SignalingNetwork::new();
    let a = Node::join(&network, A, 200);
    let b = Node::join(&network, B, 100);

    a.sees_online(&[&b]).await;
    b.sees_online(&[&a]).await;
    settle().await;

    a.sees_online(&[]).await;
    settle().await;

    assert!(a.dispatcher.connection(&b.address).is_none());
    assert!(a.dispatcher.status().get(&b.address).is_none());
    assert!(a.rtc.last().unwrap().is_closed());
    assert!(b.dispatcher.connection(&a.address).is_some());
}
