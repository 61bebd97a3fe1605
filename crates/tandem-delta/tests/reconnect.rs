//! Connection lifecycle: reconnect backoff, the reconnect policy split,
//! nack handling, idempotent connect, and terminal close.

use std::time::Duration;

use tandem_delta::{DeltaError, DeltaManagerConfig, DeltaManagerEvent};
use tandem_protocol::{ClientDescriptor, ReconnectPolicy};
use tandem_testkit::{settle, Fixture, TestConnection, TestService};

async fn wait_for_connect(events: &mut tokio::sync::broadcast::Receiver<DeltaManagerEvent>) {
    loop {
        match events.recv().await.expect("event stream") {
            DeltaManagerEvent::Connect(_) => return,
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn browser_reconnect_backs_off_exponentially() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");
    let mut events = fixture.manager.subscribe();

    // five failed dials, then a fresh connection
    for _ in 0..5 {
        fixture
            .service
            .queue_failure(DeltaError::transport("refused"));
    }
    let replacement = TestConnection::new("local-client-2");
    fixture.service.queue_connection(replacement);

    fixture.connection.drop_connection("link lost");
    wait_for_connect(&mut events).await;
    settle().await;

    let attempts = fixture.service.attempts();
    // initial connect, immediate redial, then the backoff ladder
    assert_eq!(attempts.len(), 7);
    let deltas: Vec<u64> = attempts
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis() as u64)
        .collect();
    assert_eq!(deltas[1..], [1000, 2000, 4000, 8000, 8000]);
    assert_eq!(fixture.manager.statistics().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_pauses_and_clears_outbound() {
    let fixture = Fixture::new();
    let mut events = fixture.manager.subscribe();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    fixture.connection.drop_connection("link lost");
    settle().await;

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if let DeltaManagerEvent::Disconnect { was_nack } = event {
            assert!(!was_nack);
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
    assert!(fixture.connection.is_closed());
    // the redial has not landed (nothing scripted), so outbound stays down
    assert!(fixture.manager.outbound().is_paused());
}

#[tokio::test(start_paused = true)]
async fn non_browser_client_halts_instead_of_reconnecting() {
    let fixture = Fixture::with(
        ClientDescriptor::agent("summarizer"),
        DeltaManagerConfig::default(),
    );
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    fixture.connection.drop_connection("link lost");
    settle().await;

    assert!(fixture.manager.inbound().is_paused());
    assert!(fixture.manager.inbound_signal().is_paused());
    assert!(fixture.manager.outbound().is_paused());

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    // only the original dial ever happened
    assert_eq!(fixture.service.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_policy_overrides_the_category() {
    let fixture = Fixture::with(
        ClientDescriptor::agent("summarizer").with_reconnect(ReconnectPolicy::Automatic),
        DeltaManagerConfig::default(),
    );
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");
    let mut events = fixture.manager.subscribe();

    let replacement = TestConnection::new("local-client-2");
    fixture.service.queue_connection(replacement);
    fixture.connection.drop_connection("link lost");
    wait_for_connect(&mut events).await;

    assert_eq!(fixture.service.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn nack_reports_as_nack_and_reconnects() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");
    let mut events = fixture.manager.subscribe();

    let replacement = TestConnection::new("local-client-2");
    fixture.service.queue_connection(replacement);
    fixture.connection.nack(12);

    let mut saw_nack_disconnect = false;
    loop {
        match events.recv().await.expect("event stream") {
            DeltaManagerEvent::Disconnect { was_nack } => {
                assert!(was_nack);
                saw_nack_disconnect = true;
            }
            DeltaManagerEvent::Connect(_) => break,
            _ => continue,
        }
    }
    assert!(saw_nack_disconnect);
    assert_eq!(fixture.manager.statistics().nacks, 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_connects_share_one_attempt() {
    let fixture = Fixture::new();
    fixture.arm_at(0);

    let (first, second) = tokio::join!(
        fixture.manager.connect("first"),
        fixture.manager.connect("second")
    );
    let first = first.expect("first connect");
    let second = second.expect("second connect");

    assert_eq!(first.client_id, second.client_id);
    assert_eq!(fixture.service.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_rejects_connect() {
    let service = TestService::with_storage_error(DeltaError::storage("endpoint down"));
    let manager = tandem_delta::DeltaManager::new(
        service.clone(),
        ClientDescriptor::browser(),
        DeltaManagerConfig::default(),
    );
    let mut events = manager.subscribe();

    let result = manager.connect("test").await;
    assert!(matches!(result, Err(DeltaError::Storage { .. })));

    // and the failure is surfaced as a manager error, never dialed
    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DeltaManagerEvent::Error(_)) {
            saw_error = true;
        }
    }
    assert!(saw_error);
    assert!(service.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_is_terminal() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    fixture.manager.close();
    assert!(fixture.manager.is_closed());
    assert!(fixture.connection.is_closed());
    assert!(fixture.manager.inbound().is_paused());
    assert!(fixture.manager.outbound().is_paused());

    // closing again is harmless, reconnecting is refused
    fixture.manager.close();
    let result = fixture.manager.connect("again").await;
    assert!(matches!(result, Err(DeltaError::Closed)));

    // traffic delivered after close never reaches the handler
    fixture
        .connection
        .deliver_ops(vec![tandem_testkit::sequenced_op(1, "remote")]);
    settle().await;
    assert!(fixture.handler.processed().is_empty());
}
