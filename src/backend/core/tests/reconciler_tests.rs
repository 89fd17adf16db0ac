//! Behavioural tests for the state reconciler.
//!
//! Tests cover:
//! - Round trip through the store
//! - Idempotent re-application
//! - Cascade deletion of a line's people
//! - The staleness window
//! - Serialized concurrent commits
//! - Retry of transient storage failures

use async_trait::async_trait;
use serde_json::{json, Value};
use speedline_core::document::{Document, UpdateRequest};
use speedline_core::error::{ErrorCode, Result, SyncError};
use speedline_core::store::{DocumentStore, MemoryStore};
use speedline_core::sync::{ApplyOutcome, RetryPolicy, StateReconciler};
use speedline_core::websocket::BroadcastHub;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn reconciler_with(store: Arc<dyn DocumentStore>, retry: RetryPolicy) -> StateReconciler {
    StateReconciler::with_policy(store, Arc::new(BroadcastHub::new(16)), 5, retry)
}

fn reconciler() -> StateReconciler {
    reconciler_with(Arc::new(MemoryStore::new()), RetryPolicy::no_retry())
}

fn request(body: Value) -> UpdateRequest {
    UpdateRequest::from_json(body).expect("valid request")
}

async fn commit(reconciler: &StateReconciler, body: Value) -> ApplyOutcome {
    reconciler.apply(request(body)).await.expect("apply succeeds")
}

fn names(people: &[speedline_core::document::Person]) -> Vec<&str> {
    people.iter().map(|p| p.name.as_str()).collect()
}

/// Re-submit a stored document exactly as a client would echo it back.
fn echo(document: &Document) -> Value {
    serde_json::to_value(document).unwrap()
}

/// Fails `replace` a fixed number of times with a transient error.
struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
    replace_calls: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
            replace_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn load(&self) -> Result<Document> {
        self.inner.load().await
    }

    async fn replace(&self, document: &Document) -> Result<()> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SyncError::storage_unavailable("connection reset by peer"));
        }
        self.inner.replace(document).await
    }

    fn backend(&self) -> &'static str {
        "flaky"
    }
}

/// Always fails `replace` with a non-transient error.
struct BrokenStore {
    replace_calls: AtomicU32,
}

#[async_trait]
impl DocumentStore for BrokenStore {
    async fn load(&self) -> Result<Document> {
        Ok(Document::default())
    }

    async fn replace(&self, _document: &Document) -> Result<()> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::storage_failed("constraint violation"))
    }

    fn backend(&self) -> &'static str {
        "broken"
    }
}

// ============================================================================
// Round Trip
// ============================================================================

#[tokio::test]
async fn test_round_trip_preserves_structure() {
    let reconciler = reconciler();

    let outcome = commit(
        &reconciler,
        json!({
            "config": {"sessionDuration": "45", "maxPeoplePerLine": "4"},
            "lines": [
                {"name": "Front", "time": "10:00", "people": [{"name": "Alice"}, {"name": "Bob"}]},
                {"name": "Back", "time": "10:30", "people": []}
            ],
            "generalWaitQueue": [{"name": "Carol"}]
        }),
    )
    .await;
    assert!(outcome.is_committed());

    let snapshot = reconciler.snapshot().await.unwrap();
    let doc = &snapshot.document;

    assert_eq!(snapshot.version, 1);
    assert_eq!(doc.config.session_duration, "45");
    assert_eq!(doc.config.max_people_per_line, "4");
    assert_eq!(doc.lines.len(), 2);
    assert_eq!(doc.lines[0].name, "Front");
    assert_eq!(doc.lines[0].time, "10:00");
    assert_eq!(names(&doc.lines[0].people), vec!["Alice", "Bob"]);
    assert!(doc.lines[1].people.is_empty());
    assert_eq!(names(&doc.general_wait_queue), vec!["Carol"]);

    // Server-assigned ids are unique across the document.
    let mut ids: Vec<i64> = doc.people().map(|p| p.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_wrapped_and_bare_payloads_are_equivalent() {
    let wrapped = reconciler();
    let bare = reconciler();

    let document = json!({"lines": [{"name": "A", "people": [{"id": 3, "name": "Dana"}]}]});
    commit(&wrapped, json!({"state": document.clone(), "version": 0})).await;
    commit(&bare, document).await;

    let a = wrapped.snapshot().await.unwrap().document;
    let b = bare.snapshot().await.unwrap().document;
    assert_eq!(a.lines[0].people[0].id, 3);
    assert_eq!(a.lines[0].name, b.lines[0].name);
    assert_eq!(a.lines[0].people[0].id, b.lines[0].people[0].id);
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_reapplying_same_document_changes_nothing() {
    let reconciler = reconciler();
    commit(
        &reconciler,
        json!({
            "lines": [{"name": "A", "people": [{"name": "Alice"}, {"name": "Bob"}]}],
            "generalWaitQueue": [{"name": "Carol"}]
        }),
    )
    .await;
    let first = reconciler.snapshot().await.unwrap();

    match commit(&reconciler, echo(&first.document)).await {
        ApplyOutcome::Committed { snapshot, changes } => {
            assert_eq!(changes.insertions(), 0);
            assert_eq!(changes.deletions(), 0);
            assert!(changes.is_empty(), "unexpected changes: {changes:?}");
            assert_eq!(snapshot.document, first.document);
            assert_eq!(snapshot.version, first.version + 1);
        }
        other => panic!("expected commit, got {other:?}"),
    }
}

// ============================================================================
// Cascade
// ============================================================================

#[tokio::test]
async fn test_deleting_line_removes_its_people() {
    let reconciler = reconciler();
    commit(
        &reconciler,
        json!({
            "lines": [
                {"name": "A", "people": [{"id": 1, "name": "Alice"}, {"id": 2, "name": "Bob"}]},
                {"name": "B", "people": [{"id": 3, "name": "Carol"}]}
            ]
        }),
    )
    .await;

    let outcome = commit(
        &reconciler,
        json!({"lines": [{"name": "B", "people": [{"id": 3, "name": "Carol"}]}]}),
    )
    .await;

    match outcome {
        ApplyOutcome::Committed { snapshot, changes } => {
            assert_eq!(changes.lines_deleted, 1);
            assert_eq!(changes.people_cascaded, 2);
            assert_eq!(snapshot.document.lines.len(), 1);
            assert_eq!(snapshot.document.person_count(), 1);
            assert!(snapshot.document.people().all(|p| p.id == 3));
        }
        other => panic!("expected commit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_person_moved_out_of_deleted_line_survives() {
    let reconciler = reconciler();
    commit(
        &reconciler,
        json!({"lines": [{"name": "A", "people": [{"id": 1, "name": "Alice"}]}]}),
    )
    .await;
    let created_at = reconciler.snapshot().await.unwrap().document.lines[0].people[0].created_at;

    let outcome = commit(
        &reconciler,
        json!({"lines": [], "generalWaitQueue": [{"id": 1, "name": "Alice"}]}),
    )
    .await;

    match outcome {
        ApplyOutcome::Committed { snapshot, changes } => {
            assert_eq!(changes.people_cascaded, 0);
            assert_eq!(snapshot.document.general_wait_queue[0].id, 1);
            assert_eq!(snapshot.document.general_wait_queue[0].created_at, created_at);
        }
        other => panic!("expected commit, got {other:?}"),
    }
}

// ============================================================================
// Staleness
// ============================================================================

#[tokio::test]
async fn test_staleness_window_boundary() {
    let reconciler = reconciler();
    for _ in 0..10 {
        commit(&reconciler, json!({"lines": [{"name": "A"}]})).await;
    }
    assert_eq!(reconciler.version(), 10);

    // Exactly at the threshold is still accepted.
    let accepted = commit(&reconciler, json!({"state": {"lines": []}, "version": 5})).await;
    assert!(accepted.is_committed());
    assert_eq!(reconciler.version(), 11);

    // One further behind is rejected without touching anything.
    let before = reconciler.snapshot().await.unwrap();
    let rejected = commit(
        &reconciler,
        json!({"state": {"lines": [{"name": "Z"}]}, "version": 5}),
    )
    .await;

    match rejected {
        ApplyOutcome::Conflict {
            current,
            claimed_version,
        } => {
            assert_eq!(claimed_version, 5);
            assert_eq!(current.version, 11);
            assert_eq!(current.document, before.document);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(reconciler.version(), 11);
    assert_eq!(reconciler.snapshot().await.unwrap().document, before.document);
}

#[tokio::test]
async fn test_missing_version_is_never_stale() {
    let reconciler = reconciler();
    for _ in 0..20 {
        commit(&reconciler, json!({"lines": []})).await;
    }
    assert!(commit(&reconciler, json!({"lines": []})).await.is_committed());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies_are_serialized() {
    let reconciler = Arc::new(reconciler());
    let mut handles = Vec::new();

    for i in 0..20 {
        let reconciler = reconciler.clone();
        handles.push(tokio::spawn(async move {
            reconciler
                .apply(request(json!({
                    "lines": [{"name": format!("L{i}"), "people": [{"name": format!("P{i}")}]}]
                })))
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let mut versions: Vec<u64> = outcomes.iter().map(|o| o.snapshot().version).collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=20).collect::<Vec<_>>());

    let last = outcomes
        .iter()
        .max_by_key(|o| o.snapshot().version)
        .unwrap();
    let final_state = reconciler.snapshot().await.unwrap();
    assert_eq!(final_state.version, 20);
    assert_eq!(final_state.document, last.snapshot().document);
}

// ============================================================================
// Storage Failures
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    let reconciler = reconciler_with(store.clone(), RetryPolicy::fixed(3, Duration::from_millis(1)));

    let outcome = commit(&reconciler, json!({"lines": [{"name": "A"}]})).await;

    assert!(outcome.is_committed());
    assert_eq!(store.replace_calls.load(Ordering::SeqCst), 3);
    assert_eq!(reconciler.version(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_surface_as_unavailable() {
    let store = Arc::new(FlakyStore::new(10));
    let reconciler = reconciler_with(store.clone(), RetryPolicy::fixed(2, Duration::from_millis(1)));

    let err = reconciler
        .apply(request(json!({"lines": [{"name": "A"}]})))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::StorageUnavailable);
    assert_eq!(err.http_status().as_u16(), 503);
    assert_eq!(store.replace_calls.load(Ordering::SeqCst), 2);
    assert_eq!(reconciler.version(), 0);
}

#[tokio::test]
async fn test_fatal_failures_are_not_retried() {
    let store = Arc::new(BrokenStore {
        replace_calls: AtomicU32::new(0),
    });
    let reconciler = reconciler_with(store.clone(), RetryPolicy::fixed(5, Duration::from_millis(1)));

    let err = reconciler
        .apply(request(json!({"lines": []})))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::StorageFailed);
    assert_eq!(store.replace_calls.load(Ordering::SeqCst), 1);
    assert_eq!(reconciler.version(), 0);
}

// ============================================================================
// Examples
// ============================================================================

#[tokio::test]
async fn test_adding_second_person_to_line() {
    let reconciler = reconciler();
    commit(&reconciler, json!({"lines": [{"name": "Line A", "people": [{"name": "Alice"}]}]})).await;

    let before = reconciler.snapshot().await.unwrap();
    let alice = &before.document.lines[0].people[0];
    assert_eq!(alice.id, 1);

    let outcome = commit(
        &reconciler,
        json!({
            "lines": [{"name": "Line A", "people": [
                {"id": 1, "name": "Alice"},
                {"name": "Bob"}
            ]}],
            "version": before.version
        }),
    )
    .await;

    let snapshot = outcome.snapshot();
    assert_eq!(snapshot.version, before.version + 1);
    assert_eq!(names(&snapshot.document.lines[0].people), vec!["Alice", "Bob"]);
    assert_eq!(snapshot.document.lines[0].people[1].id, 2);
    assert_eq!(snapshot.document.config.max_people_per_line, "10");
}

#[tokio::test]
async fn test_largest_person_id_is_rejected_at_the_boundary() {
    let reconciler = reconciler();

    let err = UpdateRequest::from_json(json!({
        "lines": [{"name": "A", "people": [{"id": i64::MAX, "name": "Max"}]}]
    }))
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(err.details().field.as_deref(), Some("lines[0].people[0].id"));

    // The highest accepted id still commits, and so do later documents.
    commit(
        &reconciler,
        json!({"lines": [{"name": "A", "people": [{"id": i64::MAX - 1, "name": "Edge"}]}]}),
    )
    .await;
    let outcome = commit(&reconciler, json!({"lines": [{"name": "B"}]})).await;
    assert_eq!(outcome.snapshot().version, 2);
}

#[tokio::test]
async fn test_exhausted_id_space_fails_without_committing() {
    let stored: Document = serde_json::from_value(json!({
        "lines": [{"id": 1, "name": "A", "people": [
            {"id": i64::MAX, "name": "Max", "createdAt": "2026-01-01T09:00:00Z"}
        ]}]
    }))
    .unwrap();
    let reconciler = reconciler_with(
        Arc::new(MemoryStore::with_document(stored.clone())),
        RetryPolicy::no_retry(),
    );

    let err = reconciler
        .apply(request(json!({"lines": [{"name": "A", "people": [{"name": "Newcomer"}]}]})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(reconciler.version(), 0);
    assert_eq!(reconciler.snapshot().await.unwrap().document, stored);

    // Documents that need no new person id still go through.
    let outcome = commit(&reconciler, json!({"lines": [{"name": "C"}]})).await;
    assert_eq!(outcome.snapshot().version, 1);
    assert!(outcome.snapshot().document.lines[0].people.is_empty());
}

#[tokio::test]
async fn test_invalid_capacity_falls_back_to_default() {
    let reconciler = reconciler();
    let outcome = commit(
        &reconciler,
        json!({"config": {"maxPeoplePerLine": "abc"}, "lines": []}),
    )
    .await;

    assert_eq!(outcome.snapshot().document.config.max_people_per_line, "10");
}

#[tokio::test]
async fn test_commit_is_published_to_subscribers() {
    let reconciler = reconciler();
    let mut subscription = reconciler.hub().subscribe();

    commit(&reconciler, json!({"lines": [{"name": "A"}]})).await;

    let published = subscription.next().await.unwrap();
    assert_eq!(published.version, 1);
    assert_eq!(published.document.lines[0].name, "A");
}
