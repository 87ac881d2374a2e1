use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::testkit::{
    self,
    transport::{MockEndpoint, MockTransport},
};

// -- Harness --------------------------------------------------------------

struct Harness {
    conn: Arc<Connection>,
    endpoint: Arc<MockEndpoint>,
    events_rx: mpsc::Receiver<PoolEvent>,
    lifecycle_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

fn harness_with(
    ping_cfg: StreamPingConfig,
    configure: impl FnOnce(&mut EndpointConfig),
) -> Harness {
    let transport = MockTransport::new();
    let endpoint = transport.endpoint("mock://conn");
    let mut endpoint_cfg = testkit::config::endpoint("mock://conn");
    configure(&mut endpoint_cfg);

    let (event_tx, events_rx) = mpsc::channel(256);
    let counters = Arc::new(PoolCounters::new());
    let events = EventSink::new(event_tx, Arc::clone(&counters));
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
    let dedup = SignatureCache::new(&testkit::config::dedup(30_000));

    let conn = Connection::new(
        endpoint_cfg,
        0,
        transport,
        ping_cfg,
        testkit::config::breaker(),
        events,
        lifecycle_tx,
        dedup,
        counters,
    );
    Harness {
        conn,
        endpoint,
        events_rx,
        lifecycle_rx,
    }
}

fn harness() -> Harness {
    harness_with(testkit::config::ping_disabled(), |_| {})
}

async fn wait_healthy(conn: &Arc<Connection>) {
    for _ in 0..400 {
        if conn.is_healthy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("connection never became healthy");
}

async fn wait_for(
    rx: &mut mpsc::Receiver<PoolEvent>,
    pred: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// -- Lifecycle ------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let h = harness();

    h.conn.start();
    h.conn.start();
    wait_healthy(&h.conn).await;

    assert_eq!(h.endpoint.connect_count(), 1);
    assert_eq!(h.conn.status(), ConnectionStatus::Connected);
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_initial_probe_failures_are_retried() {
    let h = harness();
    h.endpoint.script_probe_results(vec![
        Err(Error::Transport("not ready".to_string())),
        Err(Error::Transport("not ready".to_string())),
    ]);

    h.conn.start();
    wait_healthy(&h.conn).await;

    // One client construction, three probes (two failed attempts).
    assert_eq!(h.endpoint.connect_count(), 1);
    assert_eq!(h.endpoint.probe_count(), 3);
    assert_eq!(h.conn.metrics().reconnect_attempts, 0);
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_skip_ping_endpoint_never_probes() {
    let h = harness_with(testkit::config::ping(2_000, 1_000, 3), |cfg| {
        cfg.skip_ping = true;
    });

    h.conn.start();
    wait_healthy(&h.conn).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(h.endpoint.probe_count(), 0);
    assert_eq!(h.endpoint.ping_count(), 0);
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_client_and_allows_restart() {
    let mut h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    h.conn.stop().await;
    assert_eq!(h.conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.endpoint.release_count(), 1);
    assert_eq!(h.endpoint.cancel_count(), 1);

    drain(&mut h.events_rx);
    h.conn.start();
    wait_healthy(&h.conn).await;
    assert_eq!(h.endpoint.connect_count(), 2);
    h.conn.stop().await;
}

// -- Streams --------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_open_stream_requires_a_connected_client() {
    let h = harness();

    let result = h
        .conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await;

    assert!(matches!(result, Err(Error::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_reopening_replaces_the_stream() {
    let h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;

    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    assert_eq!(h.endpoint.open_count(), 2);
    assert_eq!(h.endpoint.cancel_count(), 1, "prior stream cancelled first");
    assert!(h.conn.has_active_stream());
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_error_emits_one_loss_then_reconnects() {
    let mut h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    h.endpoint
        .fail_stream(Error::Stream("broken pipe".to_string()));

    let mut losses = 0;
    loop {
        let event = wait_for(&mut h.events_rx, |e| {
            matches!(
                e,
                PoolEvent::ConnectionLost { .. } | PoolEvent::ConnectionRecovered { .. }
            )
        })
        .await;
        match event {
            PoolEvent::ConnectionLost { .. } => losses += 1,
            PoolEvent::ConnectionRecovered { .. } => break,
            _ => unreachable!(),
        }
    }
    assert_eq!(losses, 1);

    // The pool hears about the transition both ways.
    let mut saw_down = false;
    let mut saw_up_again = false;
    while let Ok(message) = h.lifecycle_rx.try_recv() {
        match message {
            LifecycleEvent::Down { .. } => saw_down = true,
            LifecycleEvent::Up { recovered: true, .. } => saw_up_again = true,
            _ => {}
        }
    }
    assert!(saw_down);
    assert!(saw_up_again);
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_force_reconnect_does_not_emit_connection_lost() {
    let mut h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();
    drain(&mut h.events_rx);

    h.conn.force_reconnect(DisconnectReason::MessageTimeout);

    for _ in 0..400 {
        if h.endpoint.connect_count() == 2 && h.conn.is_healthy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(h.endpoint.connect_count(), 2, "client rebuilt");
    assert_eq!(h.endpoint.release_count(), 1, "old client released");

    let events = drain(&mut h.events_rx);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, PoolEvent::ConnectionLost { .. })),
        "forced reconnects must not echo a loss event"
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, PoolEvent::ConnectionRecovered { .. })));
    h.conn.stop().await;
}

// -- Liveness clocks -------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_fresh_connection_is_not_stale() {
    let h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;

    assert!(!h.conn.is_stale(Duration::from_secs(2)));
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silence_makes_the_connection_stale() {
    let h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.conn.is_stale(Duration::from_secs(2)));

    h.endpoint.send_transaction(&[0x01]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.conn.is_stale(Duration::from_secs(2)));
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_pongs_do_not_reset_the_data_clock() {
    let h = harness_with(testkit::config::ping(2_000, 1_000, 10), |_| {});
    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    // Pongs keep flowing the whole time.
    tokio::time::sleep(Duration::from_secs(9)).await;

    assert!(h.endpoint.ping_count() >= 3);
    assert!(h.conn.is_stale(Duration::from_secs(4)));

    let metrics = h.conn.metrics();
    assert_eq!(metrics.consecutive_missed_pongs, 0);
    let data_age = metrics.last_data_age_ms.unwrap();
    let frame_age = metrics.last_frame_age_ms.unwrap();
    assert!(frame_age < data_age, "pongs advance only the frame clock");
    h.conn.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_missed_pongs_fail_the_stream() {
    let mut h = harness_with(testkit::config::ping(2_000, 1_000, 2), |_| {});
    h.endpoint.set_auto_pong(false);

    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    let lost = wait_for(&mut h.events_rx, |e| {
        matches!(e, PoolEvent::ConnectionLost { .. })
    })
    .await;
    let PoolEvent::ConnectionLost { reason, .. } = lost else {
        unreachable!()
    };
    assert_eq!(reason, DisconnectReason::PingTimeout);
    h.conn.stop().await;
}

// -- Data path ------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_frames_count_toward_metrics() {
    let mut h = harness();
    h.conn.start();
    wait_healthy(&h.conn).await;
    h.conn
        .open_subscription_stream(testkit::frames::subscribe_all())
        .await
        .unwrap();

    h.endpoint.send_transaction(&[0x01]);
    h.endpoint.send_frame(testkit::frames::unsigned_transaction());
    wait_for(&mut h.events_rx, |e| {
        matches!(e, PoolEvent::TransactionDelivered { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let metrics = h.conn.metrics();
    assert_eq!(metrics.data_frames_received, 2);
    assert_eq!(metrics.frames_received, 2);
    h.conn.stop().await;
}
