use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hostq::config::types::Settings;
use hostq::device::{
    DeviceActionManager, DeviceState, LocalMdmCommander, MdmCommand, MdmCommandStatus,
    MdmCommander,
};
use hostq::error::is_validation;
use hostq::scripts::ScriptExecutor;
use hostq::state::backend::StateBackend;
use hostq::state::models::{
    ActionKind, CorrelatedAction, Host, HostId, Platform, ScriptExecutionRequest,
    ScriptResultPayload, ScriptSource,
};
use hostq::state::sqlite::SqliteBackend;

struct Harness {
    backend: Arc<SqliteBackend>,
    mdm: Arc<LocalMdmCommander>,
    devices: DeviceActionManager,
    executor: ScriptExecutor,
}

async fn harness(hosts: &[Host]) -> Harness {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    for host in hosts {
        backend.upsert_host(host).await.unwrap();
    }
    let backend = Arc::new(backend);
    let mdm = Arc::new(LocalMdmCommander::new(backend.clone()));
    Harness {
        devices: DeviceActionManager::new(backend.clone(), mdm.clone()),
        executor: ScriptExecutor::new(backend.clone(), &Settings::default()),
        backend,
        mdm,
    }
}

impl Harness {
    async fn finish_script(&self, host_id: HostId, execution_id: &str, exit_code: i64) {
        self.executor
            .record_result(ScriptResultPayload {
                host_id,
                execution_id: execution_id.to_string(),
                output: String::new(),
                runtime: 1,
                exit_code,
                timed_out: false,
            })
            .await
            .unwrap();
    }

    async fn state(&self, host_id: HostId) -> DeviceState {
        self.devices.get_status(host_id).await.unwrap().state
    }

    async fn answer_command(&self, host_id: HostId, command_id: &str, status: MdmCommandStatus) {
        let host = self.backend.get_host(host_id).await.unwrap();
        self.mdm
            .record_result(command_id, &host.uuid, status)
            .await
            .unwrap();
    }
}

// ─── Script-driven platforms ────────────────────────────────────────────────

#[tokio::test]
async fn test_linux_lock_unlock_cycle() {
    let h = harness(&[Host::new(1, Platform::Linux)]).await;
    assert_eq!(h.state(1).await, DeviceState::Unlocked);

    let lock_ref = h.devices.request_lock(1).await.unwrap();
    assert_eq!(
        h.state(1).await,
        DeviceState::LockPending {
            lock_ref: lock_ref.clone()
        }
    );
    let err = h.devices.request_lock(1).await.unwrap_err();
    assert!(is_validation(&err));

    let recorded = h
        .executor
        .record_result(ScriptResultPayload {
            host_id: 1,
            execution_id: lock_ref.clone(),
            output: String::new(),
            runtime: 2,
            exit_code: 0,
            timed_out: false,
        })
        .await
        .unwrap();
    assert_eq!(recorded.action, Some(CorrelatedAction::Device(ActionKind::Lock)));
    assert_eq!(h.state(1).await, DeviceState::Locked);

    let unlock_ref = h.devices.request_unlock(1).await.unwrap();
    assert!(matches!(h.state(1).await, DeviceState::UnlockPending { .. }));
    h.finish_script(1, &unlock_ref, 0).await;

    assert_eq!(h.state(1).await, DeviceState::Unlocked);
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert!(row.lock_ref.is_none());
    assert!(row.unlock_ref.is_none());
    assert!(row.wipe_ref.is_none());
    assert_eq!(row.platform, Some(Platform::Linux));
}

#[tokio::test]
async fn test_successful_lock_clears_stale_unlock_and_wipe_refs() {
    let h = harness(&[Host::new(1, Platform::Windows)]).await;
    // References to actions that no longer exist count as failed
    h.backend
        .record_action_ref(1, ActionKind::Unlock, "old-unlock", None, Platform::Windows, None)
        .await
        .unwrap();
    h.backend
        .record_action_ref(1, ActionKind::Wipe, "old-wipe", None, Platform::Windows, None)
        .await
        .unwrap();
    assert_eq!(h.state(1).await, DeviceState::Unlocked);

    let lock_ref = h.devices.request_lock(1).await.unwrap();
    h.finish_script(1, &lock_ref, 0).await;

    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert_eq!(row.lock_ref.as_deref(), Some(lock_ref.as_str()));
    assert!(row.unlock_ref.is_none());
    assert!(row.wipe_ref.is_none());
    assert_eq!(h.state(1).await, DeviceState::Locked);
}

#[tokio::test]
async fn test_failed_lock_returns_to_unlocked() {
    let h = harness(&[Host::new(1, Platform::Linux)]).await;
    let lock_ref = h.devices.request_lock(1).await.unwrap();
    h.finish_script(1, &lock_ref, 1).await;

    assert_eq!(h.state(1).await, DeviceState::Unlocked);
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert!(row.lock_ref.is_none());
}

#[tokio::test]
async fn test_failed_wipe_keeps_lock() {
    let h = harness(&[Host::new(1, Platform::Linux)]).await;
    let lock_ref = h.devices.request_lock(1).await.unwrap();
    h.finish_script(1, &lock_ref, 0).await;

    let wipe_ref = h.devices.request_wipe(1).await.unwrap();
    assert_eq!(
        h.state(1).await,
        DeviceState::WipePending {
            wipe_ref: wipe_ref.clone()
        }
    );
    h.finish_script(1, &wipe_ref, 1).await;

    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert!(row.wipe_ref.is_none());
    assert_eq!(row.lock_ref.as_deref(), Some(lock_ref.as_str()));
    assert_eq!(h.state(1).await, DeviceState::Locked);
}

#[tokio::test]
async fn test_successful_wipe_is_final() {
    let h = harness(&[Host::new(1, Platform::Linux)]).await;
    let lock_ref = h.devices.request_lock(1).await.unwrap();
    h.finish_script(1, &lock_ref, 0).await;
    let wipe_ref = h.devices.request_wipe(1).await.unwrap();
    h.finish_script(1, &wipe_ref, 0).await;

    assert_eq!(h.state(1).await, DeviceState::Wiped);
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert!(row.lock_ref.is_none());
    assert_eq!(row.wipe_ref.as_deref(), Some(wipe_ref.as_str()));

    assert!(is_validation(&h.devices.request_lock(1).await.unwrap_err()));
    assert!(is_validation(&h.devices.request_unlock(1).await.unwrap_err()));
    assert!(is_validation(&h.devices.request_wipe(1).await.unwrap_err()));
}

#[tokio::test]
async fn test_unlock_requires_lock() {
    let h = harness(&[Host::new(1, Platform::Linux)]).await;
    let err = h.devices.request_unlock(1).await.unwrap_err();
    assert!(is_validation(&err));
    assert!(h.backend.get_host_mdm_actions(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_script_actions_need_scripting_agent() {
    let mut host = Host::new(1, Platform::Linux);
    host.scripts_enabled = false;
    let h = harness(&[host, Host::new(2, Platform::Other)]).await;

    assert!(is_validation(&h.devices.request_lock(1).await.unwrap_err()));
    assert!(is_validation(&h.devices.request_lock(2).await.unwrap_err()));
    assert!(is_validation(&h.devices.get_status(2).await.unwrap_err()));
}

// ─── MDM-driven platforms ───────────────────────────────────────────────────

#[tokio::test]
async fn test_windows_wipe_through_mdm() {
    let h = harness(&[Host::new(1, Platform::Windows)]).await;
    let wipe_ref = h.devices.request_wipe(1).await.unwrap();
    assert!(matches!(h.state(1).await, DeviceState::WipePending { .. }));

    h.answer_command(1, &wipe_ref, MdmCommandStatus::Acknowledged).await;
    let applied = h
        .devices
        .on_mdm_command_result(1, &wipe_ref, true)
        .await
        .unwrap();
    assert_eq!(applied, Some(ActionKind::Wipe));
    assert_eq!(h.state(1).await, DeviceState::Wiped);
}

#[tokio::test]
async fn test_apple_lock_then_manual_unlock() {
    let h = harness(&[Host::new(1, Platform::Darwin)]).await;

    let lock_ref = h.devices.request_lock(1).await.unwrap();
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    let pin = row.unlock_pin.clone().expect("Should store a PIN with the lock");
    assert_eq!(pin.len(), 6);
    assert_eq!(
        h.state(1).await,
        DeviceState::LockPending {
            lock_ref: lock_ref.clone()
        }
    );
    assert!(h.devices.get_status(1).await.unwrap().unlock_pin.is_none());

    h.answer_command(1, &lock_ref, MdmCommandStatus::Acknowledged).await;
    let applied = h.devices.on_mdm_command_result(1, &lock_ref, true).await.unwrap();
    assert_eq!(applied, Some(ActionKind::Lock));

    // Confirmed lock: locked, with the PIN usable right away
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    let eligible_at = row.unlock_ref.clone().expect("Should mark unlock eligible");
    assert!(row.unlock_requested_at.is_none());
    let status = h.devices.get_status(1).await.unwrap();
    assert_eq!(status.state, DeviceState::Locked);
    assert_eq!(status.unlock_pin.as_deref(), Some(pin.as_str()));
    assert!(status.unlock_eligible_since.is_some());

    // Manual unlock records the first request and keeps the PIN
    let first = h.devices.request_unlock(1).await.unwrap();
    let requested_at = h
        .backend
        .get_host_mdm_actions(1)
        .await
        .unwrap()
        .unwrap()
        .unlock_requested_at
        .expect("Should record the unlock request");
    let second = h.devices.request_unlock(1).await.unwrap();
    assert_eq!(first, eligible_at);
    assert_eq!(second, eligible_at);

    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert_eq!(row.unlock_pin.as_deref(), Some(pin.as_str()));
    assert_eq!(row.unlock_requested_at.as_deref(), Some(requested_at.as_str()));
    match h.state(1).await {
        DeviceState::UnlockPending {
            unlock_pin,
            requested_at,
            ..
        } => {
            assert_eq!(unlock_pin.as_deref(), Some(pin.as_str()));
            assert!(requested_at.is_some());
        }
        other => panic!("expected unlock pending, got {:?}", other),
    }
}

#[tokio::test]
async fn test_apple_lock_error_clears_lock() {
    let h = harness(&[Host::new(1, Platform::Ios)]).await;
    let lock_ref = h.devices.request_lock(1).await.unwrap();

    h.answer_command(1, &lock_ref, MdmCommandStatus::Error).await;
    assert_eq!(
        h.devices.on_mdm_command_result(1, &lock_ref, false).await.unwrap(),
        Some(ActionKind::Lock)
    );
    assert_eq!(h.state(1).await, DeviceState::Unlocked);
}

#[tokio::test]
async fn test_unrelated_mdm_result_is_ignored() {
    let h = harness(&[Host::new(1, Platform::Darwin)]).await;
    let lock_ref = h.devices.request_lock(1).await.unwrap();

    let applied = h
        .devices
        .on_mdm_command_result(1, "some-other-command", true)
        .await
        .unwrap();
    assert!(applied.is_none());
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert_eq!(row.lock_ref.as_deref(), Some(lock_ref.as_str()));
}

#[tokio::test]
async fn test_recorded_platform_wins_over_current() {
    let h = harness(&[Host::new(1, Platform::Darwin)]).await;
    let wipe_ref = h.devices.request_wipe(1).await.unwrap();

    // The wiped device comes back reporting another OS
    let mut host = h.backend.get_host(1).await.unwrap();
    host.platform = Platform::Linux;
    h.backend.upsert_host(&host).await.unwrap();

    let status = h.devices.get_status(1).await.unwrap();
    assert_eq!(status.platform, Platform::Darwin);
    assert_eq!(status.state, DeviceState::WipePending { wipe_ref });
}

#[tokio::test]
async fn test_action_ref_changes_only_from_expected_value() {
    let h = harness(&[Host::new(1, Platform::Linux)]).await;
    h.backend
        .record_action_ref(1, ActionKind::Lock, "first", None, Platform::Linux, None)
        .await
        .unwrap();

    let err = h
        .backend
        .record_action_ref(1, ActionKind::Lock, "second", None, Platform::Linux, None)
        .await
        .unwrap_err();
    assert!(is_validation(&err));

    // A script for a stale view is never enqueued
    let request = ScriptExecutionRequest {
        host_id: 1,
        source: ScriptSource::Inline("echo lock".to_string()),
        priority: 0,
        requester: None,
        sync_request: false,
    };
    let err = h
        .backend
        .request_action_via_script(ActionKind::Lock, &request, None, Platform::Linux)
        .await
        .unwrap_err();
    assert!(is_validation(&err));
    assert!(h.backend.list_activities(1, &Default::default()).await.unwrap().is_empty());

    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert_eq!(row.lock_ref.as_deref(), Some("first"));
}

/// Commander whose transport is down.
struct UnreachableMdm;

#[async_trait]
impl MdmCommander for UnreachableMdm {
    async fn issue(&self, _host: &Host, _command_id: &str, _command: &MdmCommand) -> Result<()> {
        Err(anyhow!("MDM server unreachable"))
    }

    async fn result(&self, _command_id: &str, _host_uuid: &str) -> Result<MdmCommandStatus> {
        Ok(MdmCommandStatus::Pending)
    }
}

#[tokio::test]
async fn test_unsent_command_releases_reference() {
    let h = harness(&[Host::new(1, Platform::Darwin)]).await;
    let devices = DeviceActionManager::new(h.backend.clone(), Arc::new(UnreachableMdm));

    let err = devices.request_lock(1).await.unwrap_err();
    assert!(format!("{:#}", err).contains("unreachable"));
    let row = h.backend.get_host_mdm_actions(1).await.unwrap().unwrap();
    assert!(row.lock_ref.is_none());

    // The host can still be locked once MDM is back
    h.devices.request_lock(1).await.unwrap();
    assert!(matches!(h.state(1).await, DeviceState::LockPending { .. }));
}
