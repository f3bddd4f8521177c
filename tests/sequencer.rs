use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use graphsync::{
    ActionSequencer, BatchEvent, Gateway, GatewayBuilder, RateWindow, RateWindowStore,
    RemoteAction, SequencerConfig, SyncError,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const COMMENTS_PATH: &str = "/v19.0/123_456/comments";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn gateway(server: &MockServer) -> Gateway {
    GatewayBuilder::new()
        .access_token("test-token")
        .base_url(server.uri())
        .build()
        .unwrap()
}

fn config(min_ms: u64, max_ms: u64) -> SequencerConfig {
    SequencerConfig {
        limit_per_window: 10,
        window: DAY,
        min_spacing: Duration::from_millis(min_ms),
        max_spacing: Duration::from_millis(max_ms),
    }
}

async fn seed(store_path: &Path, timestamps: Vec<u64>) -> RateWindowStore {
    let store = RateWindowStore::new(store_path);
    store
        .save(&RateWindow::new(10, DAY).with_timestamps(timestamps))
        .await
        .unwrap();
    store
}

fn comments(n: usize) -> Vec<RemoteAction> {
    (0..n)
        .map(|i| RemoteAction::comment("123_456", format!("comment-{i}")))
        .collect()
}

async fn mount_comment_ok(server: &MockServer, times: u64) {
    Mock::given(method("POST"))
        .and(path(COMMENTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "123_456_789"})))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_window_rejects_batch_before_any_call() {
    let server = MockServer::start().await;
    mount_comment_ok(&server, 0).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();
    let recent: Vec<u64> = (1..=10).map(|i| now - i * 60_000).collect();
    let store = seed(&dir.path().join("comments.json"), recent).await;

    let sequencer = ActionSequencer::new(gateway(&server), store, config(0, 0));
    let err = sequencer
        .run(comments(1), None, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        SyncError::QuotaExceeded {
            requested,
            remaining,
            retry_at_ms,
        } => {
            assert_eq!(requested, 1);
            assert_eq!(remaining, 0);
            assert!(retry_at_ms.is_some());
        }
        other => panic!("expected quota rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_is_accepted_once_a_timestamp_ages_out() {
    let server = MockServer::start().await;
    mount_comment_ok(&server, 1).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store_path = dir.path().join("comments.json");
    let now = now_ms();
    let mut stamps: Vec<u64> = (1..=9).map(|i| now - i * 60_000).collect();
    stamps.push(now - DAY_MS - 60_000);
    let store = seed(&store_path, stamps).await;

    let sequencer = ActionSequencer::new(gateway(&server), store.clone(), config(0, 0));
    let outcome = sequencer
        .run(comments(1), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.executed.len(), 1);
    assert!(!outcome.cancelled);

    let window = store.load(10, DAY).await.unwrap();
    assert_eq!(window.used_at(now_ms()), 10);
    assert_eq!(sequencer.remaining_quota().await.unwrap(), 0);
}

#[tokio::test]
async fn batch_larger_than_remaining_quota_is_refused_whole() {
    let server = MockServer::start().await;
    mount_comment_ok(&server, 0).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();
    let store = seed(&dir.path().join("comments.json"), (1..=8).map(|i| now - i * 1000).collect()).await;

    let err = ActionSequencer::new(gateway(&server), store, config(0, 0))
        .run(comments(3), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::QuotaExceeded { requested: 3, remaining: 2, .. }));
}

#[tokio::test]
async fn actions_run_in_order_with_spacing_and_progress() {
    let server = MockServer::start().await;
    mount_comment_ok(&server, 3).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = RateWindowStore::new(dir.path().join("comments.json"));
    let sequencer = ActionSequencer::new(gateway(&server), store.clone(), config(20, 40));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = tokio::time::Instant::now();
    let outcome = sequencer
        .run(comments(3), Some(&tx), &CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));

    let indices: Vec<usize> = outcome.executed.iter().map(|a| a.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(outcome
        .executed
        .windows(2)
        .all(|w| w[0].executed_at_ms <= w[1].executed_at_ms));

    let bodies: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect();
    assert!(bodies[0].contains("comment-0"));
    assert!(bodies[1].contains("comment-1"));
    assert!(bodies[2].contains("comment-2"));

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    assert!(events.iter().any(|e| matches!(e, BatchEvent::Waiting { next_index: 1, .. })));
    assert_eq!(
        events.last(),
        Some(&BatchEvent::Finished {
            executed: 3,
            total: 3,
            cancelled: false
        })
    );

    assert_eq!(store.load(10, DAY).await.unwrap().timestamps().len(), 3);
}

#[tokio::test]
async fn failure_halts_batch_and_keeps_bookkeeping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMMENTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c"})))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COMMENTS_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": 368,
                "message": "The action attempted has been deemed abusive or is otherwise disallowed",
                "error_user_msg": "You can't post this comment right now."
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = RateWindowStore::new(dir.path().join("comments.json"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = ActionSequencer::new(gateway(&server), store.clone(), config(0, 5))
        .run(comments(5), Some(&tx), &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        SyncError::BatchHalted {
            index,
            executed,
            source,
        } => {
            assert_eq!(*index, 2);
            let indices: Vec<usize> = executed.iter().map(|a| a.index).collect();
            assert_eq!(indices, vec![0, 1]);
            assert!(executed.iter().all(|a| a.response["id"] == "c"));
            assert!(matches!(**source, SyncError::Validation { .. }));
        }
        other => panic!("expected halted batch, got {other:?}"),
    }
    assert_eq!(err.user_message(), "You can't post this comment right now.");

    assert_eq!(store.load(10, DAY).await.unwrap().timestamps().len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let mut halted = 0;
    while let Ok(e) = rx.try_recv() {
        if matches!(e, BatchEvent::Halted { index: 2, executed: 2, .. }) {
            halted += 1;
        }
    }
    assert_eq!(halted, 1);
}

#[tokio::test]
async fn cancellation_between_actions_reports_partial_completion() {
    let server = MockServer::start().await;
    mount_comment_ok(&server, 1).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = RateWindowStore::new(dir.path().join("comments.json"));
    let sequencer = ActionSequencer::new(gateway(&server), store.clone(), config(10_000, 15_000));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let outcome = sequencer.run(comments(3), None, &cancel).await.unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.executed.len(), 1);
    assert_eq!(outcome.total, 3);
    assert_eq!(store.load(10, DAY).await.unwrap().timestamps().len(), 1);
}
