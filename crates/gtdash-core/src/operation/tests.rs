//! Tests for the operation module.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

use super::*;
use crate::process::Binary;
use crate::supervisor::{MockExecutor, MockReply, ProcessSupervisor, SupervisorConfig};

fn metadata(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
        .collect()
}

async fn wait_for_terminal(store: &OperationStore, id: &str) -> Operation {
    for _ in 0..500 {
        let operation = store.get(id).unwrap();
        if operation.is_terminal() {
            return operation;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("operation {id} never finished");
}

// =============================================================================
// Store
// =============================================================================

#[test]
fn test_create_defaults() {
    let store = OperationStore::new();
    let operation = store.create(OperationType::Fetch, Map::new());

    assert!(operation.id.starts_with("op-"));
    assert_eq!(operation.status, OperationStatus::Pending);
    assert_eq!(operation.progress, 0);
    assert!(operation.logs.is_empty());
    assert!(operation.completed_at.is_none());
    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&operation.id), Some(operation));
}

#[test]
fn test_lifecycle_stamps_completion() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Merge, Map::new()).id;

    assert!(store.update(&id, OperationUpdate::status(OperationStatus::Running)));
    assert!(store.get(&id).unwrap().completed_at.is_none());

    assert!(store.update(
        &id,
        OperationUpdate {
            progress: Some(250),
            ..OperationUpdate::default()
        }
    ));
    assert_eq!(store.get(&id).unwrap().progress, 100);

    assert!(store.update(&id, OperationUpdate::status(OperationStatus::Completed)));
    let operation = store.get(&id).unwrap();
    assert_eq!(operation.status, OperationStatus::Completed);
    assert!(operation.completed_at.unwrap() >= operation.started_at);
}

#[test]
fn test_terminal_status_is_a_sink() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Test, Map::new()).id;
    store.update(&id, OperationUpdate::status(OperationStatus::Failed));
    let before = store.get(&id).unwrap();

    let accepted = store.update(
        &id,
        OperationUpdate {
            status: Some(OperationStatus::Running),
            progress: Some(50),
            error: Some("late".into()),
        },
    );

    assert!(!accepted);
    assert_eq!(store.get(&id).unwrap(), before);
}

#[test]
fn test_running_does_not_go_back_to_pending() {
    let store = OperationStore::new();
    let id = store.create(OperationType::RigAdd, Map::new()).id;
    assert!(store.update(
        &id,
        OperationUpdate {
            status: Some(OperationStatus::Running),
            progress: Some(10),
            error: None,
        }
    ));
    let before = store.get(&id).unwrap();

    let accepted = store.update(
        &id,
        OperationUpdate {
            status: Some(OperationStatus::Pending),
            progress: Some(0),
            error: None,
        },
    );

    assert!(!accepted);
    assert_eq!(store.get(&id).unwrap(), before);
    assert!(store.update(&id, OperationUpdate::status(OperationStatus::Running)));
}

#[test]
fn test_unknown_id_is_rejected() {
    let store = OperationStore::new();
    assert!(!store.update("op-missing", OperationUpdate::status(OperationStatus::Running)));
    assert!(!store.append_log("op-missing", "line"));
    assert!(!store.set_cancel_callback("op-missing", || {}));
    assert!(store.is_empty());
}

#[test]
fn test_logs_are_append_only() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Other, Map::new()).id;

    store.append_log(&id, "one");
    store.append_log(&id, String::from("two"));

    assert_eq!(store.get(&id).unwrap().logs, vec!["one", "two"]);
}

#[test]
fn test_list_filters_and_orders_newest_first() {
    let store = OperationStore::new();
    let first = store.create(OperationType::Fetch, Map::new()).id;
    std::thread::sleep(Duration::from_millis(2));
    let second = store.create(OperationType::Deploy, Map::new()).id;
    std::thread::sleep(Duration::from_millis(2));
    let third = store.create(OperationType::Fetch, Map::new()).id;
    store.update(&third, OperationUpdate::status(OperationStatus::Running));

    let all: Vec<String> = store
        .list(&OperationFilter::default())
        .into_iter()
        .map(|op| op.id)
        .collect();
    assert_eq!(all, vec![third.clone(), second, first.clone()]);

    let fetches = store.list(&OperationFilter {
        operation_type: Some(OperationType::Fetch),
        ..OperationFilter::default()
    });
    assert_eq!(fetches.len(), 2);

    let running_fetches = store.list(&OperationFilter {
        status: Some(OperationStatus::Running),
        operation_type: Some(OperationType::Fetch),
    });
    assert_eq!(running_fetches.len(), 1);
    assert_eq!(running_fetches[0].id, third);

    let pending = store.list(&OperationFilter {
        status: Some(OperationStatus::Pending),
        operation_type: None,
    });
    assert!(pending.iter().any(|op| op.id == first));
}

#[test]
fn test_filter_from_query_names() {
    let filter: OperationFilter =
        serde_json::from_value(json!({"status": "running", "type": "rig-add"})).unwrap();
    assert_eq!(filter.status, Some(OperationStatus::Running));
    assert_eq!(filter.operation_type, Some(OperationType::RigAdd));
}

#[test]
fn test_operation_serializes_camel_case() {
    let store = OperationStore::new();
    let operation = store.create(OperationType::RigAdd, metadata(&[("rigName", "gastown")]));
    let json = serde_json::to_value(&operation).unwrap();

    assert_eq!(json["type"], "rig-add");
    assert_eq!(json["status"], "pending");
    assert_eq!(json["metadata"]["rigName"], "gastown");
    assert!(json.get("startedAt").is_some());
    assert!(json.get("completedAt").is_none());
}

// =============================================================================
// Cancel
// =============================================================================

#[test]
fn test_cancel_invokes_callback_once() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Fetch, Map::new()).id;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    store.set_cancel_callback(&id, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store.cancel(&id).unwrap();
    let operation = store.get(&id).unwrap();
    assert_eq!(operation.status, OperationStatus::Cancelled);
    assert!(operation.completed_at.is_some());

    let second = store.cancel(&id);
    assert_eq!(
        second,
        Err(OperationError::NotCancellable {
            id: id.clone(),
            status: OperationStatus::Cancelled,
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_rejects_finished_operation() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Fetch, Map::new()).id;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    store.set_cancel_callback(&id, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    store.update(&id, OperationUpdate::status(OperationStatus::Completed));

    let result = store.cancel(&id);

    assert!(matches!(result, Err(OperationError::NotCancellable { .. })));
    assert_eq!(store.get(&id).unwrap().status, OperationStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_without_handler_changes_nothing() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Fetch, Map::new()).id;

    let result = store.cancel(&id);

    assert_eq!(result, Err(OperationError::NoCancelHandler { id: id.clone() }));
    assert_eq!(store.get(&id).unwrap().status, OperationStatus::Pending);
}

#[test]
fn test_cancel_unknown() {
    let store = OperationStore::new();
    assert!(matches!(
        store.cancel("op-nope"),
        Err(OperationError::NotFound { .. })
    ));
}

#[test]
fn test_callback_replaced_not_stacked() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Fetch, Map::new()).id;
    let calls = Arc::new(AtomicUsize::new(0));
    for weight in [1, 10] {
        let counter = Arc::clone(&calls);
        store.set_cancel_callback(&id, move || {
            counter.fetch_add(weight, Ordering::SeqCst);
        });
    }

    store.cancel(&id).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[test]
fn test_callback_may_reenter_store() {
    let store = Arc::new(OperationStore::new());
    let id = store.create(OperationType::Fetch, Map::new()).id;
    let inner_store = Arc::clone(&store);
    let inner_id = id.clone();
    store.set_cancel_callback(&id, move || {
        inner_store.append_log(&inner_id, "cancel requested");
    });

    store.cancel(&id).unwrap();
    assert_eq!(store.get(&id).unwrap().logs, vec!["cancel requested"]);
}

// =============================================================================
// Cleanup
// =============================================================================

#[test]
fn test_cleanup_respects_retention() {
    let store = OperationStore::new();
    let done = store.create(OperationType::Fetch, Map::new()).id;
    store.update(&done, OperationUpdate::status(OperationStatus::Completed));
    let pending = store.create(OperationType::Fetch, Map::new()).id;

    assert_eq!(store.cleanup(DEFAULT_MAX_AGE), 0);
    assert_eq!(store.len(), 2);

    let removed = store.cleanup_before(Utc::now() + TimeDelta::seconds(1));
    assert_eq!(removed, 2);
    assert!(store.get(&done).is_none());
    assert!(store.get(&pending).is_none());
}

#[test]
fn test_cleanup_keeps_recent() {
    let store = OperationStore::new();
    let id = store.create(OperationType::Fetch, Map::new()).id;
    store.update(&id, OperationUpdate::status(OperationStatus::Failed));

    let removed = store.cleanup_before(Utc::now() - TimeDelta::hours(1));
    assert_eq!(removed, 0);
    assert!(store.get(&id).is_some());
}

#[test]
fn test_cleanup_zero_age_drops_everything_older_than_now() {
    let store = OperationStore::new();
    store.create(OperationType::Fetch, Map::new());
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(store.cleanup(Duration::ZERO), 1);
    assert!(store.is_empty());
}

// =============================================================================
// Properties
// =============================================================================

fn arb_status() -> impl Strategy<Value = OperationStatus> {
    prop::sample::select(vec![
        OperationStatus::Pending,
        OperationStatus::Running,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::Cancelled,
    ])
}

fn arb_update() -> impl Strategy<Value = OperationUpdate> {
    (
        prop::option::of(arb_status()),
        prop::option::of(any::<u8>()),
        prop::option::of("[a-z ]{0,12}"),
    )
        .prop_map(|(status, progress, error)| OperationUpdate {
            status,
            progress,
            error,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// completedAt is set exactly when the status is terminal, progress never
    /// exceeds 100, and once terminal the status never changes.
    #[test]
    fn prop_update_sequence_preserves_invariants(updates in prop::collection::vec(arb_update(), 0..24)) {
        let store = OperationStore::new();
        let id = store.create(OperationType::Other, Map::new()).id;
        let mut terminal: Option<OperationStatus> = None;

        for update in updates {
            let requested = update.status;
            let accepted = store.update(&id, update);
            let operation = store.get(&id).unwrap();

            prop_assert!(operation.progress <= 100);
            prop_assert_eq!(operation.completed_at.is_some(), operation.status.is_terminal());

            match terminal {
                Some(status) => {
                    prop_assert_eq!(operation.status, status);
                    if requested.is_some_and(|s| s != status) {
                        prop_assert!(!accepted);
                    }
                },
                None => {
                    prop_assert!(accepted);
                    if operation.status.is_terminal() {
                        terminal = Some(operation.status);
                    }
                },
            }
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

fn mock_supervisor(mock: &Arc<MockExecutor>) -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::with_executor(SupervisorConfig::default(), mock.clone()))
}

fn rig_add_launch() -> OperationLaunch {
    OperationLaunch {
        operation_type: OperationType::RigAdd,
        metadata: metadata(&[("rigName", "gastown"), ("url", "https://example.test/gastown.git")]),
        binary: Binary::Gt,
        args: vec![
            "rig".into(),
            "add".into(),
            "gastown".into(),
            "https://example.test/gastown.git".into(),
        ],
        timeout: None,
        cwd: None,
    }
}

#[tokio::test]
async fn test_rig_add_scenario_completes() {
    let mock = Arc::new(
        MockExecutor::always(MockReply::stdout("Cloning gastown...\n\nRig gastown added\n"))
            .with_latency(Duration::from_millis(20)),
    );
    let supervisor = mock_supervisor(&mock);
    let store = Arc::new(OperationStore::new());

    let operation = spawn_cli_operation(&store, &supervisor, rig_add_launch());
    assert_eq!(operation.status, OperationStatus::Running);
    assert_eq!(operation.operation_type, OperationType::RigAdd);
    assert_eq!(operation.metadata["rigName"], "gastown");
    assert_eq!(
        operation.logs,
        vec!["Running: gt rig add gastown https://example.test/gastown.git"]
    );

    let finished = wait_for_terminal(&store, &operation.id).await;
    assert_eq!(finished.status, OperationStatus::Completed);
    assert_eq!(finished.progress, 100);
    assert!(finished.error.is_none());
    assert_eq!(finished.logs[1], "Cloning gastown...");
    assert_eq!(finished.logs[2], "Rig gastown added");
    assert!(finished.logs[3].starts_with("Completed in "));
    assert_eq!(
        mock.calls(),
        vec![vec!["rig", "add", "gastown", "https://example.test/gastown.git"]]
    );
}

#[tokio::test]
async fn test_runner_records_failure() {
    let mock = Arc::new(MockExecutor::always(MockReply::fail(1, "rig gastown already exists")));
    let supervisor = mock_supervisor(&mock);
    let store = Arc::new(OperationStore::new());

    let operation = spawn_cli_operation(&store, &supervisor, rig_add_launch());
    let finished = wait_for_terminal(&store, &operation.id).await;

    assert_eq!(finished.status, OperationStatus::Failed);
    assert_eq!(finished.error.as_deref(), Some("rig gastown already exists"));
    assert_eq!(finished.logs.last().unwrap(), "Failed: rig gastown already exists");
}

#[tokio::test]
async fn test_runner_cancel_kills_and_stays_cancelled() {
    let mock = Arc::new(MockExecutor::always(MockReply::Hang));
    let supervisor = mock_supervisor(&mock);
    let store = Arc::new(OperationStore::new());

    let operation = spawn_cli_operation(&store, &supervisor, rig_add_launch());
    for _ in 0..500 {
        if mock.spawn_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    store.cancel(&operation.id).unwrap();

    for _ in 0..500 {
        if supervisor.stats().queue.in_flight == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // Give the task a moment to record the outcome.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let finished = store.get(&operation.id).unwrap();
    assert_eq!(finished.status, OperationStatus::Cancelled);
    assert!(finished.error.is_none());
    assert_eq!(finished.logs.last().unwrap(), "Cancelled");
    assert_eq!(supervisor.stats().queue.in_flight, 0);
}
