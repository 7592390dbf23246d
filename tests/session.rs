//! Session tests over the in-process loopback transport.
//!
//! Every test drives the real writer task, reader task and dispatch loop;
//! the [`MemoryPeer`] plays the server.

use std::sync::Arc;
use std::time::Duration;

use deribit_wire::api::channels;
use deribit_wire::transport::memory::{self, MemoryPeer};
use deribit_wire::{
    CallOptions, ChannelKind, OrderType, PushEvent, Session, SessionError, SessionState,
    TransportConfig,
};
use serde_json::json;
use tokio::sync::mpsc;

const TICKER: &str = "ticker.BTC-PERPETUAL.100ms";

fn start() -> (Arc<Session>, MemoryPeer) {
    let (conn, peer) = memory::pair(TransportConfig::default());
    let session = Session::builder().attach(conn).unwrap();
    (Arc::new(session), peer)
}

/// Run the handshake against the peer and return once authenticated.
async fn authenticate(session: &Arc<Session>, peer: &mut MemoryPeer) {
    let s = session.clone();
    let task = tokio::spawn(async move { s.authenticate("client", "secret").await });

    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "public/auth");
    peer.respond(
        req.id,
        json!({"access_token": "tok-1", "expires_in": 900, "scope": "session:test"}),
    );

    task.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let (session, mut peer) = start();

    let s = session.clone();
    let a = tokio::spawn(async move { s.call("public/get_time", json!({}), false).await });
    let s = session.clone();
    let b = tokio::spawn(async move { s.call("public/get_currencies", json!({}), false).await });

    let first = peer.next_request().await.unwrap();
    let second = peer.next_request().await.unwrap();
    assert_ne!(first.id, second.id);

    let (req_a, req_b) = if first.method == "public/get_time" {
        (first, second)
    } else {
        (second, first)
    };

    // B answered first
    peer.respond(req_b.id, json!(["BTC", "ETH"]));
    peer.respond(req_a.id, json!(1700000000000u64));

    assert_eq!(a.await.unwrap().unwrap(), json!(1700000000000u64));
    assert_eq!(b.await.unwrap().unwrap(), json!(["BTC", "ETH"]));
    assert_eq!(session.pending_calls(), 0);
}

#[tokio::test]
async fn test_identifiers_strictly_increase() {
    let (session, mut peer) = start();

    let mut last = 0;
    for _ in 0..3 {
        let s = session.clone();
        let task = tokio::spawn(async move { s.get_time().await });
        let req = peer.next_request().await.unwrap();
        assert!(req.id > last);
        last = req.id;
        peer.respond(req.id, json!(1));
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_privileged_call_without_auth_sends_nothing() {
    let (session, mut peer) = start();

    let err = session
        .call("private/get_positions", json!({"currency": "BTC"}), true)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::NotAuthenticated));
    assert_eq!(session.frames_sent(), 0);
    assert_eq!(session.pending_calls(), 0);
    assert!(peer.try_next_request().is_none());
}

#[tokio::test]
async fn test_private_subscribe_without_auth_sends_nothing() {
    let (session, mut peer) = start();

    let err = session
        .subscribe("user.orders.BTC-PERPETUAL.raw")
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::NotAuthenticated));
    assert_eq!(session.frames_sent(), 0);
    assert!(peer.try_next_request().is_none());
    assert!(session.list_active_subscriptions().is_empty());
    // No inactive leftover either
    assert!(session.subscriptions().is_empty());
}

#[tokio::test]
async fn test_concurrent_authenticate_sends_one_handshake() {
    let (session, mut peer) = start();

    let s = session.clone();
    let t1 = tokio::spawn(async move { s.authenticate("client", "secret").await });
    let s = session.clone();
    let t2 = tokio::spawn(async move { s.authenticate("client", "secret").await });

    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "public/auth");
    assert_eq!(req.params["grant_type"], "client_credentials");
    assert_eq!(req.params["client_id"], "client");
    assert_eq!(req.params["client_secret"], "secret");
    peer.respond(req.id, json!({"access_token": "tok-1", "expires_in": 900}));

    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    assert_eq!(session.frames_sent(), 1);
    assert!(peer.try_next_request().is_none());
    assert!(session.is_authenticated());
    assert_eq!(session.access_token().unwrap().token(), "tok-1");
}

#[tokio::test]
async fn test_queued_authenticate_shares_rejection() {
    let (session, mut peer) = start();

    let s = session.clone();
    let t1 = tokio::spawn(async move { s.authenticate("client", "wrong").await });
    let s = session.clone();
    let t2 = tokio::spawn(async move { s.authenticate("client", "wrong").await });

    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "public/auth");
    peer.respond_error(req.id, 13004, "invalid_credentials");

    for task in [t1, t2] {
        match task.await.unwrap() {
            Err(SessionError::AuthRejected(reason)) => {
                assert!(reason.contains("invalid_credentials"))
            }
            other => panic!("expected AuthRejected, got {other:?}"),
        }
    }

    assert_eq!(session.frames_sent(), 1);
    assert!(peer.try_next_request().is_none());
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let (session, mut peer) = start();

    let s = session.clone();
    let task = tokio::spawn(async move { s.authenticate("client", "wrong").await });

    let req = peer.next_request().await.unwrap();
    peer.respond_error(req.id, 13004, "invalid_credentials");

    match task.await.unwrap() {
        Err(SessionError::AuthRejected(reason)) => assert!(reason.contains("invalid_credentials")),
        other => panic!("expected AuthRejected, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Connected);

    let err = session
        .call("private/get_account_summary", json!({"currency": "BTC"}), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotAuthenticated));
}

#[tokio::test]
async fn test_handshake_without_token_is_rejected() {
    let (session, mut peer) = start();

    let s = session.clone();
    let task = tokio::spawn(async move { s.authenticate("client", "secret").await });

    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!({"expires_in": 900}));

    assert!(matches!(
        task.await.unwrap(),
        Err(SessionError::AuthRejected(_))
    ));
    assert!(!session.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_authenticate_timeout_then_late_token_ignored() {
    let (conn, mut peer) = memory::pair(TransportConfig::default());
    let session = Arc::new(
        Session::builder()
            .auth_timeout(Duration::from_millis(50))
            .attach(conn)
            .unwrap(),
    );

    let s = session.clone();
    let task = tokio::spawn(async move { s.authenticate("client", "secret").await });
    let req = peer.next_request().await.unwrap();

    assert!(matches!(
        task.await.unwrap(),
        Err(SessionError::Timeout { .. })
    ));
    assert_eq!(session.state(), SessionState::Connected);

    peer.respond(req.id, json!({"access_token": "late"}));

    // Round trip so the late frame has been dispatched
    let s = session.clone();
    let probe = tokio::spawn(async move { s.get_time().await });
    let next = peer.next_request().await.unwrap();
    peer.respond(next.id, json!(1));
    probe.await.unwrap().unwrap();

    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_access_token_injected_into_privileged_calls() {
    let (session, mut peer) = start();
    authenticate(&session, &mut peer).await;

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_positions("BTC").await });

    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "private/get_positions");
    assert_eq!(req.params["access_token"], "tok-1");
    assert_eq!(req.params["currency"], "BTC");
    peer.respond(req.id, json!([]));

    assert_eq!(task.await.unwrap().unwrap(), json!([]));
}

#[tokio::test]
async fn test_public_calls_carry_no_token() {
    let (session, mut peer) = start();
    authenticate(&session, &mut peer).await;

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_order_book("BTC-PERPETUAL", 5).await });

    let req = peer.next_request().await.unwrap();
    assert!(req.params.get("access_token").is_none());
    assert_eq!(req.params["depth"], 5);
    peer.respond(req.id, json!({"bids": [], "asks": []}));
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_limit_buy_parameters() {
    let (session, mut peer) = start();
    authenticate(&session, &mut peer).await;

    let s = session.clone();
    let task = tokio::spawn(async move {
        s.buy("BTC-PERPETUAL", 10.0, OrderType::Limit { price: 50000.0 })
            .await
    });

    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "private/buy");
    assert_eq!(req.params["type"], "limit");
    assert_eq!(req.params["time_in_force"], "good_til_cancelled");
    peer.respond(req.id, json!({"order": {"order_id": "ETH-1"}}));

    let result = task.await.unwrap().unwrap();
    assert_eq!(result["order"]["order_id"], "ETH-1");
}

#[tokio::test]
async fn test_subscribe_twice_one_active_entry() {
    let (session, mut peer) = start();

    for _ in 0..2 {
        let s = session.clone();
        let task = tokio::spawn(async move { s.subscribe(TICKER).await });

        let req = peer.next_request().await.unwrap();
        assert_eq!(req.method, "public/subscribe");
        assert_eq!(req.params["channels"], json!([TICKER]));
        peer.respond(req.id, json!([TICKER]));

        task.await.unwrap().unwrap();
    }

    assert_eq!(session.list_active_subscriptions(), vec![TICKER.to_string()]);
    assert_eq!(session.subscriptions().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_then_resubscribe() {
    let (session, mut peer) = start();
    let channel = channels::book("BTC-PERPETUAL");

    let subscribe = |session: Arc<Session>, channel: String| {
        tokio::spawn(async move { session.subscribe(&channel).await })
    };

    let task = subscribe(session.clone(), channel.clone());
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!([channel]));
    task.await.unwrap().unwrap();

    let s = session.clone();
    let ch = channel.clone();
    let task = tokio::spawn(async move { s.unsubscribe(&ch).await });
    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "public/unsubscribe");
    peer.respond(req.id, json!([channel]));
    task.await.unwrap().unwrap();

    assert!(session.list_active_subscriptions().is_empty());
    assert_eq!(session.subscriptions().len(), 1);

    let task = subscribe(session.clone(), channel.clone());
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!([channel]));
    task.await.unwrap().unwrap();

    assert_eq!(session.list_active_subscriptions(), vec![channel]);
}

#[tokio::test]
async fn test_subscribe_not_acknowledged() {
    let (session, mut peer) = start();

    let s = session.clone();
    let task = tokio::spawn(async move { s.subscribe(TICKER).await });
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!([]));

    match task.await.unwrap() {
        Err(SessionError::SubscriptionRejected(channel)) => assert_eq!(channel, TICKER),
        other => panic!("expected SubscriptionRejected, got {other:?}"),
    }
    assert!(session.list_active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_private_channel_uses_private_subscribe() {
    let (session, mut peer) = start();
    authenticate(&session, &mut peer).await;
    let channel = "user.orders.BTC-PERPETUAL.raw";

    let s = session.clone();
    let task = tokio::spawn(async move { s.subscribe(channel).await });
    let req = peer.next_request().await.unwrap();
    assert_eq!(req.method, "private/subscribe");
    assert_eq!(req.params["access_token"], "tok-1");
    peer.respond(req.id, json!([channel]));
    task.await.unwrap().unwrap();

    assert_eq!(session.list_active_subscriptions(), vec![channel.to_string()]);
}

#[tokio::test]
async fn test_push_events_reach_sinks() {
    let (conn, mut peer) = memory::pair(TransportConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<PushEvent>();
    let session = Arc::new(
        Session::builder()
            .on_push_event(move |event| {
                let _ = tx.send(event.clone());
            })
            .attach(conn)
            .unwrap(),
    );

    let s = session.clone();
    let task = tokio::spawn(async move { s.subscribe(TICKER).await });
    let req = peer.next_request().await.unwrap();

    // An event ahead of the acknowledgment already activates the channel
    peer.push(TICKER, json!({"last_price": 42000.5}));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.channel, TICKER);
    assert_eq!(event.data["last_price"], 42000.5);
    assert_eq!(ChannelKind::classify(&event.channel), ChannelKind::Ticker);
    assert!(session.subscriptions().is_active(TICKER));

    peer.respond(req.id, json!([TICKER]));
    task.await.unwrap().unwrap();
    assert_eq!(session.list_active_subscriptions(), vec![TICKER.to_string()]);
}

#[tokio::test]
async fn test_panicking_sink_does_not_stop_dispatch() {
    let (session, mut peer) = start();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    session.on_push_event(|_| panic!("sink failure"));
    session.on_push_event(move |event| {
        let _ = tx.send(event.channel.clone());
    });

    peer.push(TICKER, json!({}));
    assert_eq!(rx.recv().await.unwrap(), TICKER);

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_time().await });
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!(7));
    assert_eq!(task.await.unwrap().unwrap(), json!(7));
}

#[tokio::test]
async fn test_malformed_and_orphaned_frames_are_survived() {
    let (session, mut peer) = start();

    peer.send_raw("{not json");
    peer.send_raw(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{}}"#);
    peer.respond(999, json!("nobody asked"));

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_time().await });
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!(1700000000000u64));

    assert_eq!(task.await.unwrap().unwrap(), json!(1700000000000u64));
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_duplicate_response_is_ignored() {
    let (session, mut peer) = start();

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_time().await });
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!(1));
    peer.respond(req.id, json!(2));
    assert_eq!(task.await.unwrap().unwrap(), json!(1));

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_time().await });
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!(3));
    assert_eq!(task.await.unwrap().unwrap(), json!(3));
}

#[tokio::test]
async fn test_remote_error_is_surfaced() {
    let (session, mut peer) = start();
    authenticate(&session, &mut peer).await;

    let s = session.clone();
    let task = tokio::spawn(async move { s.sell("BTC-PERPETUAL", 10.0, OrderType::Market).await });
    let req = peer.next_request().await.unwrap();
    assert_eq!(req.params["type"], "market");
    peer.respond_error(req.id, 10009, "not_enough_funds");

    match task.await.unwrap() {
        Err(SessionError::Remote { code, message }) => {
            assert_eq!(code, 10009);
            assert_eq!(message, "not_enough_funds");
        }
        other => panic!("expected Remote error, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_zero_deadline_times_out_and_late_response_is_dropped() {
    let (session, mut peer) = start();

    let err = session
        .call_with(
            "public/get_time",
            json!({}),
            CallOptions::public().with_timeout(Duration::ZERO),
        )
        .await
        .unwrap_err();

    let id = match &err {
        SessionError::Timeout { id, method } => {
            assert_eq!(method, "public/get_time");
            *id
        }
        other => panic!("expected Timeout, got {other:?}"),
    };
    assert!(err.is_retryable());
    assert_eq!(session.pending_calls(), 0);

    let req = peer.next_request().await.unwrap();
    assert_eq!(req.id, id);
    peer.respond(id, json!(1));

    let s = session.clone();
    let task = tokio::spawn(async move { s.get_time().await });
    let req = peer.next_request().await.unwrap();
    peer.respond(req.id, json!(2));
    assert_eq!(task.await.unwrap().unwrap(), json!(2));
}

#[tokio::test]
async fn test_disconnect_fails_every_pending_call() {
    let (conn, mut peer) = memory::pair(TransportConfig::default());
    let session = Arc::new(Session::builder().no_call_timeout().attach(conn).unwrap());

    let s = session.clone();
    let a = tokio::spawn(async move { s.get_time().await });
    let s = session.clone();
    let b = tokio::spawn(async move { s.get_currencies().await });

    peer.next_request().await.unwrap();
    peer.next_request().await.unwrap();
    assert_eq!(session.pending_calls(), 2);

    peer.disconnect();

    assert!(matches!(a.await.unwrap(), Err(SessionError::SessionClosed)));
    assert!(matches!(b.await.unwrap(), Err(SessionError::SessionClosed)));
    assert_eq!(session.state(), SessionState::Closed);

    let err = session.get_time().await.unwrap_err();
    assert!(matches!(err, SessionError::SessionClosed));
}

#[tokio::test]
async fn test_close_sends_close_frame_and_drains() {
    let (session, mut peer) = start();

    let s = session.clone();
    let pending = tokio::spawn(async move { s.get_time().await });
    peer.next_request().await.unwrap();

    session.close("client shutdown").await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(SessionError::SessionClosed)
    ));
    assert_eq!(session.state(), SessionState::Closed);

    match peer.next_message().await {
        Some(tokio_tungstenite::tungstenite::Message::Close(Some(frame))) => {
            assert_eq!(frame.reason.as_str(), "client shutdown");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    // Closing twice is a no-op
    session.close("again").await;
}

#[tokio::test]
async fn test_concurrent_close_waits_for_drain() {
    let (session, mut peer) = start();

    let s = session.clone();
    let pending = tokio::spawn(async move { s.get_time().await });
    peer.next_request().await.unwrap();

    let s = session.clone();
    let first = tokio::spawn(async move { s.close("first").await });
    tokio::task::yield_now().await;

    // Returns only after the pending call has been failed
    session.close("second").await;
    assert_eq!(session.pending_calls(), 0);
    assert_eq!(session.state(), SessionState::Closed);

    first.await.unwrap();
    assert!(matches!(
        pending.await.unwrap(),
        Err(SessionError::SessionClosed)
    ));
}
