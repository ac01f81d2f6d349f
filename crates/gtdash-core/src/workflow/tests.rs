//! Tests for the workflow module.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;
use serde_json::{Map, json};

use super::*;
use crate::config::WorkflowsConfig;
use crate::supervisor::{MockExecutor, MockReply, ProcessSupervisor, SupervisorConfig};

fn step_ids(workflow: &Workflow) -> Vec<&str> {
    workflow.steps.iter().map(|step| step.id.as_str()).collect()
}

fn statuses(workflow: &Workflow) -> Vec<StepStatus> {
    workflow.steps.iter().map(|step| step.status).collect()
}

// =============================================================================
// Templates
// =============================================================================

#[test]
fn test_full_ci_template() {
    let store = WorkflowStore::new();
    let workflow = store.create(WorkflowType::FullCi, "nightly", Map::new());

    assert!(workflow.id.starts_with("wf-"));
    assert_eq!(workflow.status, WorkflowStatus::Pending);
    assert_eq!(
        step_ids(&workflow),
        vec![
            "step-0-checkout",
            "step-1-lint",
            "step-2-test",
            "step-3-build",
            "step-4-deploy"
        ]
    );
    assert!(workflow.steps.iter().all(|s| s.status == StepStatus::Pending));
}

#[test]
fn test_other_templates() {
    let store = WorkflowStore::new();
    let merge_deploy = store.create(WorkflowType::MergeDeploy, "md", Map::new());
    let test_merge = store.create(WorkflowType::TestMerge, "tm", Map::new());
    let custom = store.create(WorkflowType::Custom, "empty", Map::new());

    let names = |wf: &Workflow| wf.steps.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&merge_deploy), vec!["checkout", "test", "merge", "deploy"]);
    assert_eq!(names(&test_merge), vec!["checkout", "test", "merge"]);
    assert!(custom.steps.is_empty());
}

#[test]
fn test_create_custom() {
    let store = WorkflowStore::new();
    let params = json!({"rig": "gastown"}).as_object().cloned().unwrap();
    let workflow = store.create_custom("release", &["tag", "publish"], params);

    assert_eq!(workflow.workflow_type, WorkflowType::Custom);
    assert_eq!(step_ids(&workflow), vec!["step-0-tag", "step-1-publish"]);
    assert_eq!(workflow.params["rig"], "gastown");

    let json = serde_json::to_value(&workflow).unwrap();
    assert_eq!(json["type"], "custom");
    assert_eq!(json["steps"][0]["status"], "pending");
    assert!(json.get("createdAt").is_some());
}

// =============================================================================
// Step updates and derivation
// =============================================================================

#[test]
fn test_step_updates_drive_workflow_status() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;

    assert!(store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Running)));
    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert!(workflow.steps[0].started_at.is_some());

    assert!(store.update_step(
        &id,
        "step-0-checkout",
        StepUpdate {
            status: Some(StepStatus::Completed),
            output: Some("checked out".into()),
            duration: Some(42),
            ..StepUpdate::default()
        }
    ));
    let step = &store.get(&id).unwrap().steps[0];
    assert!(step.completed_at.is_some());
    assert_eq!(step.duration, Some(42));
    assert_eq!(step.output.as_deref(), Some("checked out"));

    store.update_step(&id, "step-1-test", StepUpdate::status(StepStatus::Skipped));
    store.update_step(&id, "step-2-merge", StepUpdate::status(StepStatus::Completed));

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.completed_at.is_some());
}

#[test]
fn test_failed_step_fails_workflow() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::MergeDeploy, "md", Map::new()).id;

    store.update_step(
        &id,
        "step-1-test",
        StepUpdate {
            status: Some(StepStatus::Failed),
            error: Some("3 tests failed".into()),
            ..StepUpdate::default()
        },
    );

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow.completed_at.is_some());
    assert_eq!(workflow.steps[1].error.as_deref(), Some("3 tests failed"));
}

#[test]
fn test_failed_step_only_leaves_through_retry() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;
    store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Failed));
    let failed_at = store.get(&id).unwrap().completed_at;

    for status in [StepStatus::Pending, StepStatus::Running, StepStatus::Completed] {
        assert!(!store.update_step(&id, "step-0-checkout", StepUpdate::status(status)));
    }
    assert!(!store.update_step(&id, "step-1-test", StepUpdate::status(StepStatus::Running)));

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.completed_at, failed_at);
    assert_eq!(
        statuses(&workflow),
        vec![StepStatus::Failed, StepStatus::Pending, StepStatus::Pending]
    );
}

#[test]
fn test_completed_workflow_keeps_its_status() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;
    for step in ["step-0-checkout", "step-1-test", "step-2-merge"] {
        store.update_step(&id, step, StepUpdate::status(StepStatus::Completed));
    }
    assert_eq!(store.get(&id).unwrap().status, WorkflowStatus::Completed);

    assert!(!store.update_step(&id, "step-1-test", StepUpdate::status(StepStatus::Running)));
    assert!(!store.update_step(&id, "step-2-merge", StepUpdate::status(StepStatus::Failed)));

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.completed_at.is_some());
    assert!(workflow.steps.iter().all(|step| step.status == StepStatus::Completed));
}

#[test]
fn test_update_unknown_step_or_workflow() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;

    assert!(!store.update_step(&id, "step-9-nope", StepUpdate::status(StepStatus::Running)));
    assert!(!store.update_step("wf-missing", "step-0-checkout", StepUpdate::default()));
    assert_eq!(store.get(&id).unwrap().status, WorkflowStatus::Pending);
}

#[test]
fn test_claim_step_is_exclusive() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;

    assert!(store.claim_step(&id, "step-0-checkout"));
    assert!(!store.claim_step(&id, "step-0-checkout"));
    assert_eq!(store.get(&id).unwrap().steps[0].status, StepStatus::Running);
}

// =============================================================================
// Retry
// =============================================================================

#[test]
fn test_retry_resets_failed_step() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;
    store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Completed));
    store.update_step(&id, "step-1-test", StepUpdate::status(StepStatus::Running));
    store.update_step(
        &id,
        "step-1-test",
        StepUpdate {
            status: Some(StepStatus::Failed),
            output: Some("FAIL".into()),
            error: Some("exit 1".into()),
            duration: Some(900),
        },
    );
    assert_eq!(store.get(&id).unwrap().status, WorkflowStatus::Failed);

    store.retry_step(&id, "step-1-test").unwrap();

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert!(workflow.completed_at.is_none());
    let step = &workflow.steps[1];
    assert_eq!(step.status, StepStatus::Pending);
    assert!(step.error.is_none());
    assert!(step.output.is_none());
    assert!(step.duration.is_none());
    assert!(step.started_at.is_none());
    assert!(step.completed_at.is_none());
    assert_eq!(workflow.steps[0].status, StepStatus::Completed);
}

#[test]
fn test_retry_guard() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;
    store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Completed));

    assert_eq!(
        store.retry_step(&id, "step-0-checkout"),
        Err(WorkflowError::StepNotRetryable {
            step_id: "step-0-checkout".into(),
            status: StepStatus::Completed,
        })
    );
    assert!(matches!(
        store.retry_step(&id, "step-1-test"),
        Err(WorkflowError::StepNotRetryable {
            status: StepStatus::Pending,
            ..
        })
    ));
    assert!(matches!(
        store.retry_step(&id, "step-7-nope"),
        Err(WorkflowError::StepNotFound { .. })
    ));
    assert!(matches!(
        store.retry_step("wf-missing", "step-0-checkout"),
        Err(WorkflowError::WorkflowNotFound { .. })
    ));
    assert_eq!(store.get(&id).unwrap().steps[0].status, StepStatus::Completed);
}

// =============================================================================
// Cancel and cleanup
// =============================================================================

#[test]
fn test_cancel_skips_pending_steps() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;
    store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Completed));
    let token = store.cancellation_token(&id).unwrap();

    store.cancel(&id).unwrap();

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);
    assert!(workflow.completed_at.is_some());
    assert_eq!(
        statuses(&workflow),
        vec![StepStatus::Completed, StepStatus::Skipped, StepStatus::Skipped]
    );
    assert!(token.is_cancelled());

    assert!(matches!(
        store.cancel(&id),
        Err(WorkflowError::NotCancellable {
            status: WorkflowStatus::Cancelled,
            ..
        })
    ));
}

#[test]
fn test_cancelled_workflow_is_frozen() {
    let store = WorkflowStore::new();
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;
    store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Running));
    store.cancel(&id).unwrap();

    store.update_step(&id, "step-0-checkout", StepUpdate::status(StepStatus::Failed));

    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);
    assert!(matches!(
        store.retry_step(&id, "step-0-checkout"),
        Err(WorkflowError::WorkflowCancelled { .. })
    ));
    assert!(!store.claim_step(&id, "step-1-test"));
}

#[test]
fn test_cleanup() {
    let store = WorkflowStore::new();
    let old = store.create(WorkflowType::TestMerge, "old", Map::new()).id;
    store.cancel(&old).unwrap();
    store.create(WorkflowType::FullCi, "new", Map::new());

    assert_eq!(store.cleanup(Duration::from_secs(3600)), 0);
    assert_eq!(store.cleanup_before(Utc::now() + TimeDelta::seconds(1)), 2);
    assert!(store.is_empty());
}

#[test]
fn test_list_filters() {
    let store = WorkflowStore::new();
    let a = store.create(WorkflowType::FullCi, "a", Map::new()).id;
    std::thread::sleep(Duration::from_millis(2));
    let b = store.create(WorkflowType::TestMerge, "b", Map::new()).id;
    store.cancel(&b).unwrap();

    let all: Vec<String> = store
        .list(&WorkflowFilter::default())
        .into_iter()
        .map(|wf| wf.id)
        .collect();
    assert_eq!(all, vec![b.clone(), a.clone()]);

    let cancelled = store.list(&WorkflowFilter {
        status: Some(WorkflowStatus::Cancelled),
        workflow_type: None,
    });
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, b);

    let full_ci = store.list(&WorkflowFilter {
        status: None,
        workflow_type: Some(WorkflowType::FullCi),
    });
    assert_eq!(full_ci[0].id, a);
}

// =============================================================================
// Properties
// =============================================================================

fn arb_step_status() -> impl Strategy<Value = StepStatus> {
    prop::sample::select(vec![
        StepStatus::Pending,
        StepStatus::Running,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Skipped,
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Step updates never change the number, order or ids of steps, a
    /// terminal workflow never changes status, and a failed step stays
    /// failed.
    #[test]
    fn prop_terminal_states_are_sinks(updates in prop::collection::vec((0usize..5, arb_step_status()), 0..30)) {
        let store = WorkflowStore::new();
        let workflow = store.create(WorkflowType::FullCi, "prop", Map::new());
        let ids: Vec<String> = workflow.steps.iter().map(|s| s.id.clone()).collect();

        for (index, status) in updates {
            let before = store.get(&workflow.id).unwrap();
            store.update_step(&workflow.id, &ids[index], StepUpdate::status(status));
            let current = store.get(&workflow.id).unwrap();

            let current_ids: Vec<String> = current.steps.iter().map(|s| s.id.clone()).collect();
            prop_assert_eq!(&current_ids, &ids);

            if before.status.is_terminal() {
                prop_assert_eq!(current.status, before.status);
                prop_assert_eq!(current.completed_at, before.completed_at);
            }
            for (old, new) in before.steps.iter().zip(&current.steps) {
                if old.status == StepStatus::Failed {
                    prop_assert_eq!(new.status, StepStatus::Failed);
                }
            }
            prop_assert_eq!(current.completed_at.is_some(), current.status.is_terminal());
        }
    }

    /// Retry succeeds exactly for failed steps.
    #[test]
    fn prop_retry_only_failed(status in arb_step_status()) {
        let store = WorkflowStore::new();
        let workflow = store.create(WorkflowType::TestMerge, "prop", Map::new());
        store.update_step(&workflow.id, "step-1-test", StepUpdate::status(status));

        let result = store.retry_step(&workflow.id, "step-1-test");
        prop_assert_eq!(result.is_ok(), status == StepStatus::Failed);
    }
}

// =============================================================================
// Runner
// =============================================================================

fn commands(pairs: &[(&str, &[&str])]) -> WorkflowsConfig {
    let steps: BTreeMap<String, Vec<String>> = pairs
        .iter()
        .map(|(name, args)| {
            (
                (*name).to_string(),
                args.iter().map(|a| (*a).to_string()).collect(),
            )
        })
        .collect();
    WorkflowsConfig { steps }
}

fn runner(
    mock: &Arc<MockExecutor>,
    commands: WorkflowsConfig,
) -> (Arc<WorkflowStore>, WorkflowRunner) {
    let store = Arc::new(WorkflowStore::new());
    let supervisor = Arc::new(ProcessSupervisor::with_executor(
        SupervisorConfig::default(),
        mock.clone(),
    ));
    let runner = WorkflowRunner::new(Arc::clone(&store), supervisor, commands);
    (store, runner)
}

#[tokio::test]
async fn test_runner_executes_steps_in_order() {
    let mock = Arc::new(MockExecutor::always(MockReply::stdout("ok\n")));
    let (store, runner) = runner(
        &mock,
        commands(&[
            ("checkout", &["workflow", "checkout", "{rig}"]),
            ("test", &["workflow", "test"]),
            ("merge", &["workflow", "merge"]),
        ]),
    );
    let params = json!({"rig": "gastown"}).as_object().cloned().unwrap();
    let id = store.create(WorkflowType::TestMerge, "tm", params).id;

    let status = runner.run(&id).await;

    assert_eq!(status, Some(WorkflowStatus::Completed));
    let workflow = store.get(&id).unwrap();
    assert!(workflow.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(workflow.steps[0].output.as_deref(), Some("ok\n"));
    assert!(workflow.steps.iter().all(|s| s.duration.is_some()));
    assert_eq!(
        mock.calls(),
        vec![
            vec!["workflow", "checkout", "gastown"],
            vec!["workflow", "test"],
            vec!["workflow", "merge"],
        ]
    );
}

#[tokio::test]
async fn test_runner_fails_step_when_param_looks_like_an_option() {
    let mock = Arc::new(MockExecutor::always(MockReply::stdout("ok")));
    let (store, runner) = runner(
        &mock,
        commands(&[("checkout", &["workflow", "checkout", "{rig}"])]),
    );
    let params = json!({"rig": "--force"}).as_object().cloned().unwrap();
    let id = store.create(WorkflowType::TestMerge, "tm", params).id;

    assert_eq!(runner.run(&id).await, Some(WorkflowStatus::Failed));
    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.steps[0].status, StepStatus::Failed);
    assert!(workflow.steps[0].error.as_deref().unwrap_or_default().contains("--force"));
    assert_eq!(mock.spawn_count(), 0);
}

#[tokio::test]
async fn test_runner_skips_unconfigured_steps() {
    let mock = Arc::new(MockExecutor::always(MockReply::stdout("")));
    let (store, runner) = runner(&mock, commands(&[("test", &["workflow", "test"])]));
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;

    let status = runner.run(&id).await;

    assert_eq!(status, Some(WorkflowStatus::Completed));
    let workflow = store.get(&id).unwrap();
    assert_eq!(
        statuses(&workflow),
        vec![StepStatus::Skipped, StepStatus::Completed, StepStatus::Skipped]
    );
    assert_eq!(mock.spawn_count(), 1);
}

#[tokio::test]
async fn test_runner_stops_at_failure_and_resumes_after_retry() {
    let mock = Arc::new(MockExecutor::scripted(
        vec![MockReply::stdout("ok"), MockReply::fail(1, "2 tests failed")],
        MockReply::stdout("ok"),
    ));
    let (store, runner) = runner(
        &mock,
        commands(&[
            ("checkout", &["workflow", "checkout"]),
            ("test", &["workflow", "test"]),
            ("merge", &["workflow", "merge"]),
        ]),
    );
    let id = store.create(WorkflowType::TestMerge, "tm", Map::new()).id;

    assert_eq!(runner.run(&id).await, Some(WorkflowStatus::Failed));
    let workflow = store.get(&id).unwrap();
    assert_eq!(
        statuses(&workflow),
        vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Pending]
    );
    assert_eq!(workflow.steps[1].error.as_deref(), Some("2 tests failed"));
    assert_eq!(mock.spawn_count(), 2);

    store.retry_step(&id, "step-1-test").unwrap();
    assert_eq!(runner.spawn(id.clone()).await.unwrap(), Some(WorkflowStatus::Completed));
    assert_eq!(mock.spawn_count(), 4);
}

#[tokio::test]
async fn test_runner_cancel_stops_running_step() {
    let mock = Arc::new(MockExecutor::always(MockReply::Hang));
    let (store, runner) = runner(&mock, commands(&[("checkout", &["workflow", "checkout"])]));
    let id = store.create(WorkflowType::FullCi, "ci", Map::new()).id;

    let handle = runner.spawn(id.clone());
    for _ in 0..500 {
        if mock.spawn_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    store.cancel(&id).unwrap();

    assert_eq!(handle.await.unwrap(), Some(WorkflowStatus::Cancelled));
    let workflow = store.get(&id).unwrap();
    assert_eq!(workflow.steps[0].status, StepStatus::Failed);
    assert!(workflow.steps[1..].iter().all(|s| s.status == StepStatus::Skipped));
    assert_eq!(mock.spawn_count(), 1);
}

#[tokio::test]
async fn test_runner_unknown_workflow() {
    let mock = Arc::new(MockExecutor::always(MockReply::stdout("")));
    let (_store, runner) = runner(&mock, WorkflowsConfig::default());
    assert_eq!(runner.run("wf-missing").await, None);
}
