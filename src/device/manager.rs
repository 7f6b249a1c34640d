use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::mdm::MdmCommander;
use super::platform::{ActionContext, DeviceActions, PlatformFamily};
use super::state::DeviceState;
use crate::error::HostqError;
use crate::state::backend::StateBackend;
use crate::state::models::{
    ActionKind, ActivityFilter, ActivityType, Host, HostId, HostMdmActions, Platform,
};
use crate::state::parse_ts;

/// Live lock/wipe status of a host.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub host_id: HostId,
    pub platform: Platform,
    pub state: DeviceState,
    /// PIN that unlocks a manually unlocked device, once it is locked.
    pub unlock_pin: Option<String>,
    /// When a manual unlock became possible.
    pub unlock_eligible_since: Option<DateTime<Utc>>,
    pub actions: HostMdmActions,
}

/// Entry point for lock, unlock and wipe requests and their results.
pub struct DeviceActionManager {
    backend: Arc<dyn StateBackend>,
    mdm: Arc<dyn MdmCommander>,
}

/// A host with the capability selected for it.
struct Target {
    host: Host,
    row: HostMdmActions,
    platform: Platform,
    actions: Box<dyn DeviceActions>,
}

impl DeviceActionManager {
    pub fn new(backend: Arc<dyn StateBackend>, mdm: Arc<dyn MdmCommander>) -> Self {
        Self { backend, mdm }
    }

    /// Load a host and pick its capability. The platform recorded on the
    /// actions row wins over the host's current one.
    async fn target(&self, host_id: HostId) -> Result<Target> {
        let host = self.backend.get_host(host_id).await?;
        let row = self
            .backend
            .get_host_mdm_actions(host_id)
            .await?
            .unwrap_or_else(|| HostMdmActions {
                host_id,
                ..Default::default()
            });
        let platform = row.platform.unwrap_or(host.platform);
        let family = PlatformFamily::of(platform).ok_or_else(|| {
            HostqError::validation(format!(
                "host {} runs {}, which does not support lock, unlock or wipe",
                host_id, platform
            ))
        })?;
        Ok(Target {
            host,
            row,
            platform,
            actions: family.actions(),
        })
    }

    fn ctx<'a>(&'a self, target: &'a Target) -> ActionContext<'a> {
        ActionContext {
            backend: self.backend.as_ref(),
            mdm: self.mdm.as_ref(),
            platform: target.platform,
            row: &target.row,
        }
    }

    async fn resolve(&self, target: &Target) -> Result<DeviceState> {
        target
            .actions
            .resolve_status(&self.ctx(target), &target.host, &target.row)
            .await
    }

    /// Current state, recomputed from stored references and live lookups.
    pub async fn get_status(&self, host_id: HostId) -> Result<DeviceStatus> {
        let target = self.target(host_id).await?;
        let state = self.resolve(&target).await?;
        let manual = target.actions.manual_unlock() && state.is_locked();
        Ok(DeviceStatus {
            host_id,
            platform: target.platform,
            unlock_pin: target.row.unlock_pin.clone().filter(|_| manual),
            unlock_eligible_since: target
                .row
                .unlock_ref
                .as_deref()
                .and_then(parse_ts)
                .filter(|_| manual),
            state,
            actions: target.row,
        })
    }

    /// Lock an unlocked host. Returns the reference of the lock action.
    pub async fn request_lock(&self, host_id: HostId) -> Result<String> {
        let target = self.target(host_id).await?;
        let state = self.resolve(&target).await?;
        if state != DeviceState::Unlocked {
            return Err(HostqError::validation(format!(
                "host {} cannot be locked while {}",
                host_id, state
            ))
            .into());
        }
        let action_ref = target
            .actions
            .issue_lock(&self.ctx(&target), &target.host)
            .await
            .with_context(|| format!("lock host {}", host_id))?;
        tracing::info!(host_id, action_ref = %action_ref, "Requested lock");
        Ok(action_ref)
    }

    /// Unlock a locked host. Repeating a manual unlock returns the
    /// reference recorded the first time.
    pub async fn request_unlock(&self, host_id: HostId) -> Result<String> {
        let target = self.target(host_id).await?;
        let state = self.resolve(&target).await?;
        let allowed = match &state {
            DeviceState::Locked => true,
            DeviceState::UnlockPending { .. } => target.actions.manual_unlock(),
            _ => false,
        };
        if !allowed {
            return Err(HostqError::validation(format!(
                "host {} cannot be unlocked while {}",
                host_id, state
            ))
            .into());
        }
        let action_ref = target
            .actions
            .issue_unlock(&self.ctx(&target), &target.host)
            .await
            .with_context(|| format!("unlock host {}", host_id))?;
        tracing::info!(host_id, action_ref = %action_ref, "Requested unlock");
        Ok(action_ref)
    }

    /// Wipe a host. An existing lock stays recorded until the wipe is
    /// confirmed.
    pub async fn request_wipe(&self, host_id: HostId) -> Result<String> {
        let target = self.target(host_id).await?;
        let state = self.resolve(&target).await?;
        let allowed = matches!(
            state,
            DeviceState::Unlocked | DeviceState::Locked | DeviceState::UnlockPending { .. }
        );
        if !allowed {
            return Err(HostqError::validation(format!(
                "host {} cannot be wiped while {}",
                host_id, state
            ))
            .into());
        }
        let action_ref = target
            .actions
            .issue_wipe(&self.ctx(&target), &target.host)
            .await
            .with_context(|| format!("wipe host {}", host_id))?;
        tracing::info!(host_id, action_ref = %action_ref, "Requested wipe");
        Ok(action_ref)
    }

    /// Apply an MDM command result.
    ///
    /// The host's activated `mdm_command` activity for this command is
    /// completed. Only a command that is still the stored reference for an
    /// action changes the actions row. Returns the action it completed.
    pub async fn on_mdm_command_result(
        &self,
        host_id: HostId,
        command_id: &str,
        succeeded: bool,
    ) -> Result<Option<ActionKind>> {
        let ready = self
            .backend
            .list_activities(host_id, &ActivityFilter::ready_to_execute())
            .await?;
        if let Some(activity) = ready.iter().find(|a| {
            a.activity_type == ActivityType::MdmCommand
                && a.payload.get("command_uuid").and_then(|v| v.as_str()) == Some(command_id)
        }) {
            self.backend
                .complete_activity(host_id, &activity.execution_id)
                .await
                .with_context(|| format!("complete MDM command {}", command_id))?;
        }

        let target = self.target(host_id).await?;
        let kind = [ActionKind::Lock, ActionKind::Unlock, ActionKind::Wipe]
            .into_iter()
            .find(|k| target.row.action_ref(*k) == Some(command_id));
        let Some(kind) = kind else {
            tracing::debug!(host_id, command_id, "MDM result does not match a pending action");
            return Ok(None);
        };

        let eligible = kind == ActionKind::Lock && target.actions.unlock_eligible_after_lock();
        let changed = self
            .backend
            .apply_action_result(host_id, kind, command_id, succeeded, eligible)
            .await?;
        Ok(changed.then_some(kind))
    }
}
