//! Integration tests for request dispatch against the mock engine
//!
//! Each test drives the dispatcher with raw JSON bodies, the way the HTTP
//! front end does, and checks both the response and what the engine saw.

use std::sync::Arc;
use std::time::{Duration, Instant};

use streamcast_signaling::engine::mock::{MockBehavior, MockEngine, MockGate};
use streamcast_signaling::{
    Dispatcher, NegotiationState, ResponseMessage, SessionId, SessionRegistry,
};

const OFFER_SDP: &str = "v=0\r\no=- 46117317 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn dispatcher(engine: &MockEngine, answer_timeout: Duration) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        Arc::new(SessionRegistry::new(64, 128)),
        Arc::new(engine.clone()),
        answer_timeout,
    ))
}

fn offer(session_id: &str) -> Vec<u8> {
    serde_json::json!({ "type": "offer", "sessionId": session_id, "sdp": OFFER_SDP })
        .to_string()
        .into_bytes()
}

fn ice(session_id: &str, candidate: &str) -> Vec<u8> {
    serde_json::json!({
        "type": "ice-candidate",
        "sessionId": session_id,
        "candidate": candidate,
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
    .to_string()
    .into_bytes()
}

fn close(session_id: &str) -> Vec<u8> {
    serde_json::json!({ "type": "close", "sessionId": session_id })
        .to_string()
        .into_bytes()
}

fn poll(session_id: &str) -> Vec<u8> {
    serde_json::json!({ "type": "poll", "sessionId": session_id })
        .to_string()
        .into_bytes()
}

fn expect_answer(response: &ResponseMessage, session_id: &str) -> String {
    match response {
        ResponseMessage::Answer { sdp, session_id: id } => {
            assert_eq!(id.as_str(), session_id);
            sdp.clone()
        }
        other => panic!("expected answer for {}, got {:?}", session_id, other),
    }
}

fn expect_error(response: &ResponseMessage, fragment: &str) {
    match response {
        ResponseMessage::Error { message, .. } => {
            assert!(
                message.contains(fragment),
                "error {:?} does not mention {:?}",
                message,
                fragment
            );
        }
        other => panic!("expected error, got {:?}", other),
    }
}

/// Spin until the session shows up in the given state
async fn wait_for_state(dispatcher: &Dispatcher, session_id: &str, state: NegotiationState) {
    let id = SessionId::from(session_id);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(context) = dispatcher.registry().find(&id) {
            if context.state() == state {
                return;
            }
        }
        assert!(Instant::now() < deadline, "session {} never reached {}", session_id, state);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_fresh_offer_yields_one_answer() {
    init_logging();
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let response = dispatcher.handle_body(&offer("viewer-1")).await;
    let sdp = expect_answer(&response, "viewer-1");
    assert!(sdp.contains("a=session:viewer-1"));

    assert_eq!(engine.connections_created(), 1);
    let context = dispatcher.registry().find(&SessionId::from("viewer-1")).unwrap();
    assert_eq!(context.state(), NegotiationState::Connected);
}

#[tokio::test]
async fn test_offer_without_session_id_generates_one() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let body = serde_json::json!({ "type": "offer", "sdp": OFFER_SDP }).to_string();
    let response = dispatcher.handle_body(body.as_bytes()).await;
    let session_id = response.session_id().cloned().unwrap();
    assert!(!session_id.as_str().is_empty());
    expect_answer(&response, session_id.as_str());
    assert!(dispatcher.registry().find(&session_id).is_some());
}

#[tokio::test]
async fn test_repeated_offer_reuses_connection() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let first = expect_answer(&dispatcher.handle_body(&offer("retry")).await, "retry");
    let second = expect_answer(&dispatcher.handle_body(&offer("retry")).await, "retry");

    assert_eq!(first, second);
    assert_eq!(engine.connections_for(&SessionId::from("retry")), 1);
    assert_eq!(dispatcher.registry().len(), 1);
}

#[tokio::test]
async fn test_concurrent_offers_same_session_create_one_connection() {
    let engine = MockEngine::new();
    engine.set_default_behavior(MockBehavior::default().with_create_delay(Duration::from_millis(50)));
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let responses = futures::future::join_all(
        (0..4).map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.handle_body(&offer("shared")).await }
        }),
    )
    .await;

    for response in &responses {
        expect_answer(response, "shared");
    }
    assert_eq!(engine.connections_created(), 1);
    assert_eq!(dispatcher.registry().len(), 1);
}

#[tokio::test]
async fn test_candidates_before_remote_description_flush_in_order() {
    init_logging();
    let engine = MockEngine::new();
    let gate = MockGate::new();
    engine.set_behavior("trickle", MockBehavior::default().with_remote_gate(gate.clone()));
    let dispatcher = dispatcher(&engine, Duration::from_secs(5));

    let pending_offer = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.handle_body(&offer("trickle")).await }
    });
    wait_for_state(&dispatcher, "trickle", NegotiationState::OfferReceived).await;

    let candidates = [
        "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host",
        "candidate:2 1 udp 1694498815 203.0.113.7 50001 typ srflx",
        "candidate:3 1 udp 16777215 198.51.100.9 50002 typ relay",
    ];
    for candidate in candidates {
        let response = dispatcher.handle_body(&ice("trickle", candidate)).await;
        assert_eq!(response, ResponseMessage::ack(SessionId::from("trickle")));
    }

    let id = SessionId::from("trickle");
    assert!(engine.candidates_for(&id).is_empty());
    assert_eq!(dispatcher.registry().find(&id).unwrap().pending_candidate_count(), 3);

    gate.open();
    expect_answer(&pending_offer.await.unwrap(), "trickle");

    assert_eq!(engine.candidates_for(&id), candidates.to_vec());
    assert_eq!(dispatcher.registry().find(&id).unwrap().pending_candidate_count(), 0);

    // Post-negotiation candidates go straight through
    let late = "candidate:4 1 udp 2130706430 192.168.1.2 50003 typ host";
    dispatcher.handle_body(&ice("trickle", late)).await;
    assert_eq!(engine.candidates_for(&id).last().map(String::as_str), Some(late));
}

#[tokio::test]
async fn test_ice_for_unknown_session() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let response = dispatcher
        .handle_body(&ice("nobody", "candidate:1 1 udp 1 10.0.0.1 1 typ host"))
        .await;
    expect_error(&response, "Unknown session");
    assert_eq!(response.session_id().map(SessionId::as_str), Some("nobody"));
    assert!(dispatcher.registry().is_empty());
}

#[tokio::test]
async fn test_close_then_everything_is_unknown() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));
    let id = SessionId::from("gone");

    expect_answer(&dispatcher.handle_body(&offer("gone")).await, "gone");
    assert_eq!(
        dispatcher.handle_body(&close("gone")).await,
        ResponseMessage::ack(id.clone())
    );
    assert!(engine.is_closed(&id));
    assert!(dispatcher.registry().is_empty());

    expect_error(
        &dispatcher.handle_body(&ice("gone", "candidate:1 1 udp 1 10.0.0.1 1 typ host")).await,
        "Unknown session",
    );
    expect_error(&dispatcher.handle_body(&close("gone")).await, "Unknown session");
    expect_error(&dispatcher.handle_body(&poll("gone")).await, "Unknown session");
    expect_error(&dispatcher.handle_body(&offer("gone")).await, "Unknown session");
    assert_eq!(engine.connections_created(), 1);
}

#[tokio::test]
async fn test_close_wakes_pending_offer() {
    let engine = MockEngine::new();
    let gate = MockGate::new();
    engine.set_behavior("stuck", MockBehavior::default().with_local_gate(gate.clone()));
    let dispatcher = dispatcher(&engine, Duration::from_secs(30));

    let pending_offer = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.handle_body(&offer("stuck")).await }
    });
    wait_for_state(&dispatcher, "stuck", NegotiationState::AnsweringInProgress).await;

    let started = Instant::now();
    dispatcher.handle_body(&close("stuck")).await;
    let response = tokio::time::timeout(Duration::from_secs(2), pending_offer)
        .await
        .expect("close did not wake the waiting offer")
        .unwrap();

    expect_error(&response, "Session closed");
    assert!(started.elapsed() < Duration::from_secs(2));

    // Late completion after close is dropped
    gate.open();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dispatcher.registry().find(&SessionId::from("stuck")).is_none());
}

#[tokio::test]
async fn test_timeout_returns_processing_then_poll_answers() {
    let engine = MockEngine::new();
    let gate = MockGate::new();
    engine.set_behavior("slow", MockBehavior::default().with_local_gate(gate.clone()));
    let dispatcher = dispatcher(&engine, Duration::from_millis(100));

    let response = dispatcher.handle_body(&offer("slow")).await;
    assert!(
        matches!(&response, ResponseMessage::Processing { session_id, .. } if session_id.as_str() == "slow"),
        "expected processing, got {:?}",
        response
    );

    gate.open();
    let answer = expect_answer(&dispatcher.handle_body(&poll("slow")).await, "slow");
    assert!(answer.contains("a=session:slow"));

    // Answer stays available to a client that lost the response
    let again = expect_answer(&dispatcher.handle_body(&poll("slow")).await, "slow");
    assert_eq!(answer, again);
}

#[tokio::test]
async fn test_slow_session_does_not_delay_others() {
    let engine = MockEngine::new();
    engine.set_behavior(
        "slow",
        MockBehavior::default().with_callback_delay(Duration::from_millis(600)),
    );
    let dispatcher = dispatcher(&engine, Duration::from_secs(5));

    let slow = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.handle_body(&offer("slow")).await }
    });
    wait_for_state(&dispatcher, "slow", NegotiationState::OfferReceived).await;

    let started = Instant::now();
    expect_answer(&dispatcher.handle_body(&offer("fast")).await, "fast");
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "fast session took {:?}",
        started.elapsed()
    );
    assert!(!slow.is_finished());

    expect_answer(&slow.await.unwrap(), "slow");
}

#[tokio::test]
async fn test_engine_rejection_reports_failure() {
    let engine = MockEngine::new();
    engine.set_behavior("bad-sdp", MockBehavior::default().failing_remote("unsupported codec"));
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let response = dispatcher.handle_body(&offer("bad-sdp")).await;
    expect_error(&response, "unsupported codec");

    let context = dispatcher.registry().find(&SessionId::from("bad-sdp")).unwrap();
    assert_eq!(context.state(), NegotiationState::Failed);

    // Further offers report the recorded failure without a new connection
    expect_error(&dispatcher.handle_body(&offer("bad-sdp")).await, "unsupported codec");
    assert_eq!(engine.connections_created(), 1);

    // Close still works from Failed
    assert!(!dispatcher.handle_body(&close("bad-sdp")).await.is_error());
}

#[tokio::test]
async fn test_connection_setup_failure_discards_session() {
    let engine = MockEngine::new();
    engine.set_behavior("flaky", MockBehavior::default().failing_create("no ports"));
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    expect_error(&dispatcher.handle_body(&offer("flaky")).await, "no ports");
    assert!(dispatcher.registry().is_empty());

    // The id was never retired, so a retry can succeed
    engine.set_behavior("flaky", MockBehavior::default());
    expect_answer(&dispatcher.handle_body(&offer("flaky")).await, "flaky");
}

#[tokio::test]
async fn test_malformed_requests_leave_registry_unchanged() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));
    expect_answer(&dispatcher.handle_body(&offer("existing")).await, "existing");

    let missing_type = serde_json::json!({ "sessionId": "fresh", "sdp": OFFER_SDP }).to_string();
    let response = dispatcher.handle_body(missing_type.as_bytes()).await;
    expect_error(&response, "Malformed message");
    assert_eq!(response.session_id().map(SessionId::as_str), Some("fresh"));

    let bodies: [&[u8]; 5] = [
        b"",
        b"not json",
        br#"{"type":"renegotiate","sessionId":"fresh"}"#,
        br#"{"type":"offer","sessionId":"fresh"}"#,
        br#"{"type":"ice-candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 1 typ host"}"#,
    ];
    for body in bodies {
        assert!(dispatcher.handle_body(body).await.is_error());
    }

    assert_eq!(dispatcher.registry().len(), 1);
    assert_eq!(engine.connections_created(), 1);
}

#[tokio::test]
async fn test_empty_sdp_rejected_without_session() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    let body = serde_json::json!({ "type": "offer", "sessionId": "blank", "sdp": "  " }).to_string();
    expect_error(&dispatcher.handle_body(body.as_bytes()).await, "empty");
    assert!(dispatcher.registry().is_empty());
    assert_eq!(engine.connections_created(), 0);
}

#[tokio::test]
async fn test_session_limit() {
    let engine = MockEngine::new();
    let dispatcher = Dispatcher::new(
        Arc::new(SessionRegistry::new(2, 128)),
        Arc::new(engine.clone()),
        Duration::from_secs(2),
    );

    expect_answer(&dispatcher.handle_body(&offer("one")).await, "one");
    expect_answer(&dispatcher.handle_body(&offer("two")).await, "two");
    expect_error(&dispatcher.handle_body(&offer("three")).await, "Session limit");

    dispatcher.handle_body(&close("one")).await;
    expect_answer(&dispatcher.handle_body(&offer("three")).await, "three");
}

#[tokio::test]
async fn test_poll_before_offer_is_an_error() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));

    expect_error(&dispatcher.handle_body(&poll("never")).await, "Unknown session");
    expect_error(
        &dispatcher.handle_body(br#"{"type":"poll"}"#).await,
        "requires sessionId",
    );
}

#[tokio::test]
async fn test_peer_state_reported_by_engine() {
    let engine = MockEngine::new();
    let dispatcher = dispatcher(&engine, Duration::from_secs(2));
    let id = SessionId::from("observed");

    expect_answer(&dispatcher.handle_body(&offer("observed")).await, "observed");
    let observer = engine.observer_for(&id).unwrap();
    observer.on_peer_state_change(streamcast_signaling::PeerState::Connected);

    let context = dispatcher.registry().find(&id).unwrap();
    assert_eq!(context.peer_state(), Some(streamcast_signaling::PeerState::Connected));
    // Peer link state is observational only
    assert_eq!(context.state(), NegotiationState::Connected);
}
