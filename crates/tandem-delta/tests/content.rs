//! Split-content reassembly: chunks and envelopes arriving in either
//! order, and the storage fallback when the cache has lost a chunk.

use serde_json::json;

use tandem_delta::DeltaManagerConfig;
use tandem_protocol::{ClientDescriptor, MessageType};
use tandem_testkit::{
    content, envelope_without_contents, sequenced, sequenced_op, settle, Fixture,
};

#[tokio::test(start_paused = true)]
async fn late_envelope_merges_with_cached_content() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    fixture.connection.deliver_content(content("A", 7, "payload"));
    settle().await;
    fixture
        .connection
        .deliver_ops(vec![envelope_without_contents(1, "A", 7)]);
    settle().await;

    let processed = fixture.handler.processed();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].contents, Some(json!("payload")));
}

#[tokio::test(start_paused = true)]
async fn late_content_unblocks_the_waiting_envelope() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    // envelope first: the inbound worker must block awaiting the chunk
    fixture
        .connection
        .deliver_ops(vec![envelope_without_contents(1, "A", 7)]);
    settle().await;
    assert!(fixture.handler.processed().is_empty());

    fixture.connection.deliver_content(content("A", 7, "payload"));
    settle().await;

    let processed = fixture.handler.processed();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].contents, Some(json!("payload")));
}

#[tokio::test(start_paused = true)]
async fn gap_and_late_content_resolve_together() {
    let fixture = Fixture::new();
    fixture.storage.push_ops(vec![
        sequenced_op(11, "B"),
        sequenced_op(12, "B"),
    ]);
    fixture.arm_at(10);
    fixture.manager.connect("test").await.expect("connect");

    fixture
        .connection
        .deliver_ops(vec![envelope_without_contents(13, "A", 4)]);
    fixture.connection.deliver_content(content("A", 4, "payload"));
    fixture
        .connection
        .deliver_ops(vec![sequenced_op(11, "B"), sequenced_op(12, "B")]);
    settle().await;

    assert_eq!(
        fixture.handler.processed_sequence_numbers(),
        vec![11, 12, 13]
    );
    let processed = fixture.handler.processed();
    assert_eq!(processed[2].contents, Some(json!("payload")));

    let calls = fixture.storage.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].from, 10);
    assert_eq!(calls[0].to, Some(13));
}

#[tokio::test(start_paused = true)]
async fn evicted_chunk_is_refetched_from_storage() {
    let mut config = DeltaManagerConfig::default();
    config.content.buffer_size = 1;
    let fixture = Fixture::with(ClientDescriptor::browser(), config);

    // the full op is available server-side
    fixture.storage.push_ops(vec![sequenced(
        1,
        MessageType::Operation,
        "A",
        1,
        Some(json!("one")),
    )]);
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    // chunk 2 evicts chunk 1 out of the single-slot cache
    fixture.connection.deliver_content(content("A", 1, "one"));
    fixture.connection.deliver_content(content("A", 2, "two"));
    settle().await;

    fixture
        .connection
        .deliver_ops(vec![envelope_without_contents(1, "A", 1)]);
    settle().await;

    let processed = fixture.handler.processed();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].contents, Some(json!("one")));
    assert!(!fixture.storage.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_chunks_are_drained_until_the_match() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    // chunks 5 and 6 were cached but their envelopes never arrived
    // (the server reassembled them itself); chunk 7 is the live one
    fixture.connection.deliver_content(content("A", 5, "stale-five"));
    fixture.connection.deliver_content(content("A", 6, "stale-six"));
    fixture.connection.deliver_content(content("A", 7, "payload"));
    settle().await;

    fixture
        .connection
        .deliver_ops(vec![envelope_without_contents(1, "A", 7)]);
    settle().await;

    let processed = fixture.handler.processed();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].contents, Some(json!("payload")));
}

#[tokio::test(start_paused = true)]
async fn string_contents_are_decoded_before_delivery() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    // legacy wire shape: the payload arrives as serialized JSON
    fixture.connection.deliver_ops(vec![sequenced(
        1,
        MessageType::Operation,
        "B",
        1,
        Some(json!("{\"pos\":4}")),
    )]);
    settle().await;

    let processed = fixture.handler.processed();
    assert_eq!(processed[0].contents, Some(json!({"pos": 4})));
}

#[tokio::test(start_paused = true)]
async fn leave_contents_stay_raw() {
    let fixture = Fixture::new();
    fixture.arm_at(0);
    fixture.manager.connect("test").await.expect("connect");

    // leave messages carry a bare client id, not JSON
    fixture.connection.deliver_ops(vec![sequenced(
        1,
        MessageType::ClientLeave,
        "B",
        1,
        Some(json!("departing-client")),
    )]);
    settle().await;

    let processed = fixture.handler.processed();
    assert_eq!(processed[0].contents, Some(json!("departing-client")));
}
