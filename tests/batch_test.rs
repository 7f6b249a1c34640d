use std::sync::Arc;

use hostq::batch::compat::{INCOMPATIBLE_AGENT, INCOMPATIBLE_PLATFORM};
use hostq::batch::BatchCoordinator;
use hostq::config::types::Settings;
use hostq::error::{is_not_found, is_validation};
use hostq::queue::ActivityQueue;
use hostq::scripts::{ScriptExecutor, ScriptLibrary};
use hostq::state::backend::StateBackend;
use hostq::state::models::{
    BatchHostPlan, Host, HostId, Platform, ScriptResultPayload, ScriptScope,
};
use hostq::state::sqlite::SqliteBackend;

async fn create_test_backend(hosts: Vec<Host>) -> Arc<SqliteBackend> {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    for host in &hosts {
        backend.upsert_host(host).await.unwrap();
    }
    Arc::new(backend)
}

fn scripting_disabled(id: HostId) -> Host {
    let mut host = Host::new(id, Platform::Linux);
    host.scripts_enabled = false;
    host
}

fn report(host_id: HostId, execution_id: &str, exit_code: i64, timed_out: bool) -> ScriptResultPayload {
    ScriptResultPayload {
        host_id,
        execution_id: execution_id.to_string(),
        output: String::new(),
        runtime: 0,
        exit_code,
        timed_out,
    }
}

#[tokio::test]
async fn test_preflight_rejections_count_as_errored() {
    let backend = create_test_backend(vec![
        Host::new(1, Platform::Linux),
        scripting_disabled(2),
        Host::new(3, Platform::Windows),
    ])
    .await;
    let library = ScriptLibrary::new(backend.clone(), &Settings::default());
    let coordinator = BatchCoordinator::new(backend.clone());

    let script = library
        .create(ScriptScope::Global, "inventory.sh", "#!/bin/bash\nuname -a\n")
        .await
        .unwrap();
    let batch_id = coordinator
        .execute_on_hosts(script.id, &[1, 2, 3], Some("admin@example.com"))
        .await
        .unwrap();

    let summary = coordinator.summary(&batch_id).await.unwrap();
    assert_eq!(summary.targeted, 3);
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.errored, 2);
    assert_eq!(summary.ran, 0);
    assert_eq!(summary.canceled, 0);
    assert_eq!(summary.script_name.as_deref(), Some("inventory.sh"));

    let hosts = coordinator.host_results(&batch_id).await.unwrap();
    assert_eq!(hosts.len(), 3);
    assert!(hosts[0].host_execution_id.is_some());
    assert!(hosts[0].error.is_none());
    assert_eq!(hosts[1].error.as_deref(), Some(INCOMPATIBLE_AGENT));
    assert!(hosts[1].host_execution_id.is_none());
    assert_eq!(hosts[2].error.as_deref(), Some(INCOMPATIBLE_PLATFORM));

    // Only the compatible host got work
    assert_eq!(backend.list_activities(1, &Default::default()).await.unwrap().len(), 1);
    assert!(backend.list_activities(2, &Default::default()).await.unwrap().is_empty());
    assert!(backend.list_activities(3, &Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_summary_tracks_results() {
    let backend = create_test_backend(vec![
        Host::new(1, Platform::Linux),
        Host::new(2, Platform::Darwin),
        Host::new(3, Platform::Linux),
        Host::new(4, Platform::Linux),
    ])
    .await;
    let settings = Settings::default();
    let library = ScriptLibrary::new(backend.clone(), &settings);
    let executor = ScriptExecutor::new(backend.clone(), &settings);
    let queue = ActivityQueue::new(backend.clone());
    let coordinator = BatchCoordinator::new(backend.clone());

    let script = library
        .create(ScriptScope::Global, "patch.sh", "echo patch")
        .await
        .unwrap();
    let batch_id = coordinator
        .execute_on_hosts(script.id, &[4, 3, 2, 1, 1], None)
        .await
        .unwrap();

    let hosts = coordinator.host_results(&batch_id).await.unwrap();
    let ids: Vec<HostId> = hosts.iter().map(|h| h.host_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    let exec = |host_id: HostId| {
        hosts
            .iter()
            .find(|h| h.host_id == host_id)
            .and_then(|h| h.host_execution_id.clone())
            .unwrap()
    };

    executor.record_result(report(1, &exec(1), 0, false)).await.unwrap();
    executor.record_result(report(2, &exec(2), 2, false)).await.unwrap();
    executor.record_result(report(3, &exec(3), 0, true)).await.unwrap();
    queue.cancel(4, &exec(4)).await.unwrap();

    let summary = coordinator.summary(&batch_id).await.unwrap();
    assert_eq!(summary.targeted, 4);
    assert_eq!(summary.ran, 1);
    assert_eq!(summary.errored, 2);
    assert_eq!(summary.canceled, 1);
    assert_eq!(summary.pending, 0);
}

#[tokio::test]
async fn test_batch_runs_contents_current_at_commit() {
    let backend = create_test_backend(vec![Host::new(1, Platform::Linux)]).await;
    let settings = Settings::default();
    let library = ScriptLibrary::new(backend.clone(), &settings);
    let executor = ScriptExecutor::new(backend.clone(), &settings);
    let coordinator = BatchCoordinator::new(backend.clone());

    let script = library
        .create(ScriptScope::Global, "rotate.sh", "echo v1")
        .await
        .unwrap();
    let plans = vec![BatchHostPlan {
        host_id: 1,
        error: None,
    }];

    // Contents change after the plan was built from the old script row
    let edited = library.update_contents(script.id, "echo v2").await.unwrap().value;
    assert_ne!(edited.script_content_id, script.script_content_id);

    let batch_id = backend
        .batch_execute_script(script.id, &plans, None)
        .await
        .unwrap();
    let hosts = coordinator.host_results(&batch_id).await.unwrap();
    let execution_id = hosts[0].host_execution_id.clone().unwrap();
    let result = executor.get_result(&execution_id).await.unwrap();
    assert_eq!(result.script_content_id, edited.script_content_id);
}

#[tokio::test]
async fn test_team_mismatch_rejects_whole_batch() {
    let mut other_team = Host::new(2, Platform::Linux);
    other_team.team_id = Some(9);
    let backend = create_test_backend(vec![Host::new(1, Platform::Linux), other_team]).await;
    let library = ScriptLibrary::new(backend.clone(), &Settings::default());
    let coordinator = BatchCoordinator::new(backend.clone());

    let script = library
        .create(ScriptScope::Global, "global.sh", "echo hi")
        .await
        .unwrap();
    let err = coordinator
        .execute_on_hosts(script.id, &[1, 2], None)
        .await
        .unwrap_err();
    assert!(is_validation(&err));
    assert!(backend.list_activities(1, &Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_input_errors() {
    let backend = create_test_backend(vec![Host::new(1, Platform::Linux)]).await;
    let library = ScriptLibrary::new(backend.clone(), &Settings::default());
    let coordinator = BatchCoordinator::new(backend.clone());
    let script = library
        .create(ScriptScope::Global, "x.sh", "echo x")
        .await
        .unwrap();

    assert!(is_validation(
        &coordinator.execute_on_hosts(script.id, &[], None).await.unwrap_err()
    ));
    assert!(is_not_found(
        &coordinator.execute_on_hosts(999, &[1], None).await.unwrap_err()
    ));
    assert!(is_not_found(
        &coordinator.execute_on_hosts(script.id, &[1, 77], None).await.unwrap_err()
    ));
    assert!(is_not_found(&coordinator.summary("missing").await.unwrap_err()));
    assert!(is_not_found(&coordinator.host_results("missing").await.unwrap_err()));
}
