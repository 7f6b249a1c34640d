use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use super::mdm::{MdmCommand, MdmCommander};
use super::state::{derive_state, ActionOutcome, DeviceState, Observations, UnlockObservation};
use crate::error::{is_not_found, HostqError};
use crate::state::backend::StateBackend;
use crate::state::models::{
    ActionKind, Host, HostMdmActions, Platform, ScriptExecutionRequest, ScriptSource,
};
use crate::state::{now, parse_ts};

const LINUX_LOCK_SCRIPT: &str = r#"#!/bin/sh
# Lock every local account with a login shell and end their sessions.
for user in $(awk -F: '$3 >= 1000 && $7 !~ /(nologin|false)$/ {print $1}' /etc/passwd); do
    passwd -l "$user"
    pkill -KILL -u "$user" || true
done
"#;

const LINUX_UNLOCK_SCRIPT: &str = r#"#!/bin/sh
for user in $(awk -F: '$3 >= 1000 && $7 !~ /(nologin|false)$/ {print $1}' /etc/passwd); do
    passwd -u "$user"
done
"#;

const LINUX_WIPE_SCRIPT: &str = r#"#!/bin/sh
set -e
# Destroy key material of every LUKS volume, then power off.
for dev in $(lsblk -rpno NAME,FSTYPE | awk '$2 == "crypto_LUKS" {print $1}'); do
    cryptsetup luksErase --batch-mode "$dev"
done
systemctl poweroff
"#;

const WINDOWS_LOCK_SCRIPT: &str = r#"Get-LocalUser | Where-Object { $_.Enabled -and $_.Name -ne 'Administrator' } | ForEach-Object {
    Disable-LocalUser -Name $_.Name
}
logoff console
"#;

const WINDOWS_UNLOCK_SCRIPT: &str = r#"Get-LocalUser | Where-Object { -not $_.Enabled -and $_.Name -notin @('Administrator', 'Guest', 'DefaultAccount', 'WDAGUtilityAccount') } | ForEach-Object {
    Enable-LocalUser -Name $_.Name
}
"#;

/// Platform families with distinct lock/unlock/wipe mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    Apple,
    Windows,
    Linux,
}

impl PlatformFamily {
    pub fn of(platform: Platform) -> Option<Self> {
        match platform {
            Platform::Darwin | Platform::Ios | Platform::Ipados => Some(PlatformFamily::Apple),
            Platform::Windows => Some(PlatformFamily::Windows),
            Platform::Linux => Some(PlatformFamily::Linux),
            Platform::Other => None,
        }
    }

    /// The capability implementation for this family.
    pub fn actions(&self) -> Box<dyn DeviceActions> {
        match self {
            PlatformFamily::Apple => Box::new(AppleMdmActions),
            PlatformFamily::Windows => Box::new(WindowsActions),
            PlatformFamily::Linux => Box::new(LinuxActions),
        }
    }
}

/// Collaborators a capability may use.
pub struct ActionContext<'a> {
    pub backend: &'a dyn StateBackend,
    pub mdm: &'a dyn MdmCommander,
    /// Platform to record on the host's actions row.
    pub platform: Platform,
    /// Actions row the request was checked against. New references are
    /// only recorded while the stored ones still match it.
    pub row: &'a HostMdmActions,
}

impl ActionContext<'_> {
    pub fn expected_ref(&self, kind: ActionKind) -> Option<&str> {
        self.row.action_ref(kind)
    }
}

/// How a platform family locks, unlocks and wipes a device, and how it
/// resolves the outcome of those actions.
#[async_trait]
pub trait DeviceActions: Send + Sync {
    fn family(&self) -> PlatformFamily;

    /// Whether unlocking happens by hand, with a PIN, rather than by a
    /// tracked action.
    fn manual_unlock(&self) -> bool {
        false
    }

    /// Whether a confirmed lock makes the device unlockable right away.
    fn unlock_eligible_after_lock(&self) -> bool {
        false
    }

    async fn issue_lock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String>;

    async fn issue_unlock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String>;

    async fn issue_wipe(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String>;

    /// Derive the current state with live lookups of every stored reference.
    async fn resolve_status(
        &self,
        ctx: &ActionContext<'_>,
        host: &Host,
        row: &HostMdmActions,
    ) -> Result<DeviceState>;
}

// ─── Shared helpers ─────────────────────────────────────────────────────────

fn require_scripting(host: &Host) -> Result<()> {
    if !host.has_agent || !host.scripts_enabled {
        return Err(HostqError::validation(format!(
            "host {} cannot run scripts: an agent with scripts enabled is required",
            host.id
        ))
        .into());
    }
    Ok(())
}

async fn run_action_script(
    ctx: &ActionContext<'_>,
    host: &Host,
    kind: ActionKind,
    body: &str,
) -> Result<String> {
    require_scripting(host)?;
    let request = ScriptExecutionRequest {
        host_id: host.id,
        source: ScriptSource::Inline(body.to_string()),
        priority: 0,
        requester: None,
        sync_request: false,
    };
    let result = ctx
        .backend
        .request_action_via_script(kind, &request, ctx.expected_ref(kind), ctx.platform)
        .await?;
    Ok(result.execution_id)
}

/// Reserve the reference for a new command, then send it. A command that
/// fails to go out releases the reservation.
async fn issue_command(
    ctx: &ActionContext<'_>,
    host: &Host,
    kind: ActionKind,
    command: MdmCommand,
) -> Result<String> {
    let pin = match &command {
        MdmCommand::DeviceLock { pin } => Some(pin.clone()),
        _ => None,
    };
    let command_id = uuid::Uuid::new_v4().to_string();
    ctx.backend
        .record_action_ref(
            host.id,
            kind,
            &command_id,
            ctx.expected_ref(kind),
            ctx.platform,
            pin.as_deref(),
        )
        .await?;

    if let Err(e) = ctx.mdm.issue(host, &command_id, &command).await {
        if let Err(release) = ctx.backend.clear_action_ref(host.id, kind, &command_id).await {
            tracing::warn!(
                host_id = host.id,
                command_id = %command_id,
                error = %release,
                "Failed to release reference of unsent command"
            );
        }
        return Err(e);
    }
    Ok(command_id)
}

/// Outcome of a script-backed action. A reference to an execution that no
/// longer exists counts as failed.
async fn script_outcome(ctx: &ActionContext<'_>, execution_id: &str) -> Result<ActionOutcome> {
    match ctx.backend.get_script_result(execution_id).await {
        Ok(result) if !result.is_terminal() => Ok(ActionOutcome::Pending),
        Ok(result) if result.succeeded() => Ok(ActionOutcome::Succeeded),
        Ok(_) => Ok(ActionOutcome::Failed),
        Err(e) if is_not_found(&e) => {
            tracing::warn!(execution_id, "Device action refers to a missing execution");
            Ok(ActionOutcome::Failed)
        }
        Err(e) => Err(e),
    }
}

async fn command_outcome(
    ctx: &ActionContext<'_>,
    host: &Host,
    command_id: &str,
) -> Result<ActionOutcome> {
    match ctx.mdm.result(command_id, &host.uuid).await {
        Ok(status) => Ok(status.into()),
        Err(e) if is_not_found(&e) => {
            tracing::warn!(command_id, "Device action refers to an unknown MDM command");
            Ok(ActionOutcome::Failed)
        }
        Err(e) => Err(e),
    }
}

async fn optional_outcome<'a, F, Fut>(action_ref: Option<&'a str>, lookup: F) -> Result<Option<ActionOutcome>>
where
    F: FnOnce(&'a str) -> Fut,
    Fut: std::future::Future<Output = Result<ActionOutcome>>,
{
    match action_ref {
        Some(r) => Ok(Some(lookup(r).await?)),
        None => Ok(None),
    }
}

fn generate_pin() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

// ─── Apple ──────────────────────────────────────────────────────────────────

/// Lock and wipe are MDM commands. Unlock is manual: the user enters the
/// PIN generated with the lock.
pub struct AppleMdmActions;

#[async_trait]
impl DeviceActions for AppleMdmActions {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Apple
    }

    fn manual_unlock(&self) -> bool {
        true
    }

    fn unlock_eligible_after_lock(&self) -> bool {
        true
    }

    async fn issue_lock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        let command = MdmCommand::DeviceLock { pin: generate_pin() };
        issue_command(ctx, host, ActionKind::Lock, command).await
    }

    async fn issue_unlock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        ctx.backend
            .unlock_host_manually(host.id, ctx.platform, &now())
            .await
    }

    async fn issue_wipe(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        issue_command(ctx, host, ActionKind::Wipe, MdmCommand::EraseDevice).await
    }

    async fn resolve_status(
        &self,
        ctx: &ActionContext<'_>,
        host: &Host,
        row: &HostMdmActions,
    ) -> Result<DeviceState> {
        let obs = Observations {
            lock: optional_outcome(row.lock_ref.as_deref(), |r| command_outcome(ctx, host, r)).await?,
            unlock: row.unlock_ref.as_ref().map(|_| UnlockObservation::Manual {
                requested_at: row.unlock_requested_at.as_deref().and_then(parse_ts),
            }),
            wipe: optional_outcome(row.wipe_ref.as_deref(), |r| command_outcome(ctx, host, r)).await?,
        };
        Ok(derive_state(row, &obs))
    }
}

// ─── Windows ────────────────────────────────────────────────────────────────

/// Lock and unlock are PowerShell scripts; wipe is an MDM command.
pub struct WindowsActions;

#[async_trait]
impl DeviceActions for WindowsActions {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Windows
    }

    async fn issue_lock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        run_action_script(ctx, host, ActionKind::Lock, WINDOWS_LOCK_SCRIPT).await
    }

    async fn issue_unlock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        run_action_script(ctx, host, ActionKind::Unlock, WINDOWS_UNLOCK_SCRIPT).await
    }

    async fn issue_wipe(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        issue_command(ctx, host, ActionKind::Wipe, MdmCommand::WindowsRemoteWipe).await
    }

    async fn resolve_status(
        &self,
        ctx: &ActionContext<'_>,
        host: &Host,
        row: &HostMdmActions,
    ) -> Result<DeviceState> {
        let obs = Observations {
            lock: optional_outcome(row.lock_ref.as_deref(), |r| script_outcome(ctx, r)).await?,
            unlock: optional_outcome(row.unlock_ref.as_deref(), |r| script_outcome(ctx, r))
                .await?
                .map(UnlockObservation::Tracked),
            wipe: optional_outcome(row.wipe_ref.as_deref(), |r| command_outcome(ctx, host, r)).await?,
        };
        Ok(derive_state(row, &obs))
    }
}

// ─── Linux ──────────────────────────────────────────────────────────────────

/// Every action is a shell script run by the agent.
pub struct LinuxActions;

#[async_trait]
impl DeviceActions for LinuxActions {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Linux
    }

    async fn issue_lock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        run_action_script(ctx, host, ActionKind::Lock, LINUX_LOCK_SCRIPT).await
    }

    async fn issue_unlock(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        run_action_script(ctx, host, ActionKind::Unlock, LINUX_UNLOCK_SCRIPT).await
    }

    async fn issue_wipe(&self, ctx: &ActionContext<'_>, host: &Host) -> Result<String> {
        run_action_script(ctx, host, ActionKind::Wipe, LINUX_WIPE_SCRIPT).await
    }

    async fn resolve_status(
        &self,
        ctx: &ActionContext<'_>,
        _host: &Host,
        row: &HostMdmActions,
    ) -> Result<DeviceState> {
        let obs = Observations {
            lock: optional_outcome(row.lock_ref.as_deref(), |r| script_outcome(ctx, r)).await?,
            unlock: optional_outcome(row.unlock_ref.as_deref(), |r| script_outcome(ctx, r))
                .await?
                .map(UnlockObservation::Tracked),
            wipe: optional_outcome(row.wipe_ref.as_deref(), |r| script_outcome(ctx, r)).await?,
        };
        Ok(derive_state(row, &obs))
    }
}
