use std::sync::Arc;

use hostq::config::types::Settings;
use hostq::device::{DeviceActionManager, LocalMdmCommander};
use hostq::error::{is_not_found, is_validation};
use hostq::queue::ActivityQueue;
use hostq::scripts::{RunOptions, ScriptExecutor};
use hostq::state::backend::StateBackend;
use hostq::state::models::{ActivityType, Host, NewActivity, Platform, ScriptResultPayload};
use hostq::state::sqlite::SqliteBackend;
use serde_json::json;
use tempfile::TempDir;

async fn create_test_backend() -> Arc<SqliteBackend> {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    backend
        .upsert_host(&Host::new(1, Platform::Linux))
        .await
        .unwrap();
    Arc::new(backend)
}

fn mdm_activity(host_id: i64, priority: i64, command: &str) -> NewActivity {
    NewActivity {
        host_id,
        activity_type: ActivityType::MdmCommand,
        priority,
        payload: json!({ "command_uuid": command }),
    }
}

fn result_for(host_id: i64, execution_id: &str, exit_code: i64) -> ScriptResultPayload {
    ScriptResultPayload {
        host_id,
        execution_id: execution_id.to_string(),
        output: "done".to_string(),
        runtime: 1,
        exit_code,
        timed_out: false,
    }
}

#[tokio::test]
async fn test_single_enqueue_then_activate() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend.clone());

    let queued = queue.enqueue(mdm_activity(1, 0, "cmd-1")).await.unwrap();
    assert!(!queued.is_activated());
    assert!(queue.list_ready(1).await.unwrap().is_empty());

    let activated = queue.activate_next(1).await.unwrap().expect("Should activate");
    assert_eq!(activated.execution_id, queued.execution_id);
    assert!(activated.is_activated());

    // Already activated: nothing else to do
    assert!(queue.activate_next(1).await.unwrap().is_none());
    let ready = queue.list_ready(1).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].execution_id, queued.execution_id);
}

#[tokio::test]
async fn test_activate_empty_queue_is_noop() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);
    assert!(queue.activate_next(1).await.unwrap().is_none());
    assert!(queue.activate_next(999).await.unwrap().is_none());
}

#[tokio::test]
async fn test_priority_order_regardless_of_enqueue_order() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);

    let low = queue.enqueue(mdm_activity(1, 5, "low")).await.unwrap();
    let high = queue.enqueue(mdm_activity(1, 10, "high")).await.unwrap();

    let first = queue.activate_next(1).await.unwrap().unwrap();
    assert_eq!(first.execution_id, high.execution_id);

    let canceled = queue.cancel(1, &high.execution_id).await.unwrap();
    assert!(canceled.was_activated);
    assert_eq!(canceled.next_activated.as_deref(), Some(low.execution_id.as_str()));
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);

    let a = queue.enqueue(mdm_activity(1, 0, "a")).await.unwrap();
    let b = queue.enqueue(mdm_activity(1, 0, "b")).await.unwrap();
    let c = queue.enqueue(mdm_activity(1, 0, "c")).await.unwrap();

    let pending = queue.list_pending(1).await.unwrap();
    let order: Vec<&str> = pending.iter().map(|a| a.execution_id.as_str()).collect();
    assert_eq!(order, vec![a.execution_id.as_str(), b.execution_id.as_str(), c.execution_id.as_str()]);

    assert_eq!(
        queue.activate_next(1).await.unwrap().unwrap().execution_id,
        a.execution_id
    );
    let next = queue.cancel(1, &a.execution_id).await.unwrap().next_activated;
    assert_eq!(next.as_deref(), Some(b.execution_id.as_str()));
}

#[tokio::test]
async fn test_list_pending_puts_activated_first() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);

    let first = queue.enqueue(mdm_activity(1, 0, "first")).await.unwrap();
    queue.activate_next(1).await.unwrap();
    let urgent = queue.enqueue(mdm_activity(1, 100, "urgent")).await.unwrap();

    let pending = queue.list_pending(1).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].execution_id, first.execution_id);
    assert_eq!(pending[1].execution_id, urgent.execution_id);
}

#[tokio::test]
async fn test_enqueue_rejects_bad_payload() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);

    let err = queue.enqueue(mdm_activity(1, 0, "  ")).await.unwrap_err();
    assert!(is_validation(&err));

    let err = queue
        .enqueue(NewActivity {
            host_id: 1,
            activity_type: ActivityType::SoftwareInstall,
            priority: 0,
            payload: json!({}),
        })
        .await
        .unwrap_err();
    assert!(is_validation(&err));
    assert!(queue.list_pending(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_script_requires_existing_contents() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);

    let err = queue
        .enqueue(NewActivity {
            host_id: 1,
            activity_type: ActivityType::Script,
            priority: 0,
            payload: json!({ "script_content_id": 4242 }),
        })
        .await
        .unwrap_err();
    assert!(is_not_found(&err));
}

#[tokio::test]
async fn test_cancel_unknown_activity_is_not_found() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend);
    let err = queue.cancel(1, "no-such-execution").await.unwrap_err();
    assert!(is_not_found(&err));
}

#[tokio::test]
async fn test_cancel_queued_script_records_canceled_result() {
    let backend = create_test_backend().await;
    let executor = ScriptExecutor::new(backend.clone(), &Settings::default());
    let queue = ActivityQueue::new(backend.clone());

    let running = executor
        .new_execution_request(1, "echo one", RunOptions::default())
        .await
        .unwrap();
    let waiting = executor
        .new_execution_request(1, "echo two", RunOptions::default())
        .await
        .unwrap();

    let canceled = queue.cancel(1, &waiting.execution_id).await.unwrap();
    assert!(!canceled.was_activated);
    assert!(canceled.next_activated.is_none());

    let result = executor.get_result(&waiting.execution_id).await.unwrap();
    assert!(result.canceled);
    assert!(result.exit_code.is_none());

    // The running execution is untouched
    let ready = queue.list_ready(1).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].execution_id, running.execution_id);
}

#[tokio::test]
async fn test_activate_next_for_hosts_counts_new_activations() {
    let backend = create_test_backend().await;
    backend
        .upsert_host(&Host::new(2, Platform::Darwin))
        .await
        .unwrap();
    let queue = ActivityQueue::new(backend);

    queue.enqueue(mdm_activity(1, 0, "x")).await.unwrap();
    queue.enqueue(mdm_activity(2, 0, "y")).await.unwrap();

    assert_eq!(queue.activate_next_for_hosts(&[1, 2, 3]).await.unwrap(), 2);
    assert_eq!(queue.activate_next_for_hosts(&[1, 2]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_completed_install_activates_next_activity() {
    let backend = create_test_backend().await;
    let settings = Settings::default();
    let queue = ActivityQueue::new(backend.clone());
    let executor = ScriptExecutor::new(backend.clone(), &settings);

    let install = queue
        .enqueue(NewActivity {
            host_id: 1,
            activity_type: ActivityType::SoftwareInstall,
            priority: 0,
            payload: json!({ "installer_id": 12 }),
        })
        .await
        .unwrap();
    queue.activate_next(1).await.unwrap().unwrap();
    let script = executor
        .new_execution_request(1, "echo after install", RunOptions::default())
        .await
        .unwrap();
    assert!(!executor.get_result(&script.execution_id).await.unwrap().is_terminal());
    assert_eq!(queue.list_ready(1).await.unwrap()[0].execution_id, install.execution_id);

    let completed = queue.complete(1, &install.execution_id).await.unwrap();
    assert!(completed.removed);
    assert_eq!(completed.next_activated.as_deref(), Some(script.execution_id.as_str()));
    let ready = queue.list_ready(1).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].activity_type, ActivityType::Script);

    // A second report for the same install changes nothing
    let again = queue.complete(1, &install.execution_id).await.unwrap();
    assert!(!again.removed);
    assert!(again.next_activated.is_none());
    assert_eq!(queue.list_ready(1).await.unwrap()[0].execution_id, script.execution_id);
}

#[tokio::test]
async fn test_complete_rejects_scripts_and_queued_activities() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend.clone());
    let executor = ScriptExecutor::new(backend.clone(), &Settings::default());

    let script = executor
        .new_execution_request(1, "echo hi", RunOptions::default())
        .await
        .unwrap();
    let waiting = queue.enqueue(mdm_activity(1, 0, "later")).await.unwrap();

    assert!(is_validation(&queue.complete(1, &script.execution_id).await.unwrap_err()));
    assert!(is_validation(&queue.complete(1, &waiting.execution_id).await.unwrap_err()));
    assert_eq!(queue.list_pending(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_mdm_result_completes_command_activity() {
    let backend = create_test_backend().await;
    let queue = ActivityQueue::new(backend.clone());
    let devices = DeviceActionManager::new(
        backend.clone(),
        Arc::new(LocalMdmCommander::new(backend.clone())),
    );

    queue.enqueue(mdm_activity(1, 100, "cmd-profile")).await.unwrap();
    let next = queue.enqueue(mdm_activity(1, 0, "cmd-next")).await.unwrap();
    queue.activate_next(1).await.unwrap().unwrap();

    let applied = devices
        .on_mdm_command_result(1, "cmd-profile", true)
        .await
        .unwrap();
    assert!(applied.is_none());
    let ready = queue.list_ready(1).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].execution_id, next.execution_id);
}

#[tokio::test]
async fn test_activate_next_for_hosts_skips_failing_host() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("hostq.db");
    let backend = Arc::new(SqliteBackend::open(db_path.to_str().unwrap()).unwrap());
    backend.initialize().await.unwrap();
    for id in 1..=3 {
        backend.upsert_host(&Host::new(id, Platform::Linux)).await.unwrap();
    }
    let queue = ActivityQueue::new(backend.clone());
    for id in 1..=3 {
        queue.enqueue(mdm_activity(id, 0, &format!("cmd-{}", id))).await.unwrap();
    }

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER host_two_broken BEFORE UPDATE ON upcoming_activities
         WHEN NEW.host_id = 2 AND NEW.activated_at IS NOT NULL
         BEGIN SELECT RAISE(ABORT, 'host 2 is broken'); END;",
    )
    .unwrap();
    drop(conn);

    assert_eq!(queue.activate_next_for_hosts(&[2, 1, 3]).await.unwrap(), 2);
    assert_eq!(queue.list_ready(1).await.unwrap().len(), 1);
    assert!(queue.list_ready(2).await.unwrap().is_empty());
    assert_eq!(queue.list_ready(3).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_requests_queue_one_script() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("hostq.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let setup = Arc::new(SqliteBackend::open(&db_path).unwrap());
    setup.initialize().await.unwrap();
    setup.upsert_host(&Host::new(1, Platform::Linux)).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let backend = Arc::new(SqliteBackend::open(&db_path).unwrap());
            tokio::spawn(async move {
                let mdm = Arc::new(LocalMdmCommander::new(backend.clone()));
                DeviceActionManager::new(backend, mdm).request_lock(1).await
            })
        })
        .collect();

    let outcomes: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let locks: Vec<&String> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert_eq!(locks.len(), 1, "exactly one lock request should win");
    for err in outcomes.iter().filter_map(|o| o.as_ref().err()) {
        assert!(is_validation(err), "unexpected error: {:#}", err);
    }

    let pending = ActivityQueue::new(setup.clone()).list_pending(1).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(&pending[0].execution_id, locks[0]);
    let row = setup.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert_eq!(row.lock_ref.as_ref(), Some(locks[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_activated_under_concurrent_activation() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("hostq.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let setup = SqliteBackend::open(&db_path).unwrap();
    setup.initialize().await.unwrap();
    setup.upsert_host(&Host::new(1, Platform::Linux)).await.unwrap();
    let setup: Arc<dyn StateBackend> = Arc::new(setup);
    let queue = ActivityQueue::new(setup.clone());
    for i in 0..5 {
        queue
            .enqueue(mdm_activity(1, i % 2, &format!("cmd-{}", i)))
            .await
            .unwrap();
    }

    let handles: Vec<Arc<SqliteBackend>> = (0..4)
        .map(|_| Arc::new(SqliteBackend::open(&db_path).unwrap()))
        .collect();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let backend = handles[i % handles.len()].clone();
            tokio::spawn(async move { backend.activate_next(1).await })
        })
        .collect();

    let activated: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(activated.len(), 1, "exactly one caller should win");
    let ready = queue.list_ready(1).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].execution_id, activated[0].execution_id);
    assert_eq!(ready[0].priority, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_activation_always_ends_canceled() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("hostq.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let setup = Arc::new(SqliteBackend::open(&db_path).unwrap());
    setup.initialize().await.unwrap();
    setup.upsert_host(&Host::new(1, Platform::Linux)).await.unwrap();
    let settings = Settings::default();

    for round in 0..10 {
        let executor = ScriptExecutor::new(setup.clone(), &settings);
        let running = executor
            .new_execution_request(1, &format!("echo running {}", round), RunOptions::default())
            .await
            .unwrap();
        let target = executor
            .new_execution_request(1, &format!("echo target {}", round), RunOptions::default())
            .await
            .unwrap();

        // The result for the running execution activates `target` while a
        // second handle cancels it.
        let finisher = {
            let backend = Arc::new(SqliteBackend::open(&db_path).unwrap());
            let payload = result_for(1, &running.execution_id, 0);
            let settings = settings.clone();
            tokio::spawn(async move {
                ScriptExecutor::new(backend, &settings)
                    .record_result(payload)
                    .await
            })
        };
        let canceler = {
            let backend = Arc::new(SqliteBackend::open(&db_path).unwrap());
            let execution_id = target.execution_id.clone();
            tokio::spawn(async move {
                ActivityQueue::new(backend).cancel(1, &execution_id).await
            })
        };

        let (finished, canceled) = futures::join!(finisher, canceler);
        finished.unwrap().unwrap();
        canceled.unwrap().unwrap();

        let result = executor.get_result(&target.execution_id).await.unwrap();
        assert!(result.canceled, "round {}: target must end canceled", round);
        assert!(result.exit_code.is_none());
        assert!(setup.list_activities(1, &Default::default()).await.unwrap().is_empty());

        // A late result for the canceled execution changes nothing
        let late = executor
            .record_result(result_for(1, &target.execution_id, 0))
            .await
            .unwrap();
        assert!(late.duplicate);
        let after = executor.get_result(&target.execution_id).await.unwrap();
        assert!(after.canceled);
        assert!(after.exit_code.is_none());
    }
}
