use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

use super::state::ActionOutcome;
use crate::state::models::Host;
use crate::state::sqlite::SqliteBackend;

/// Commands the device layer sends through MDM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdmCommand {
    /// Apple lock; the PIN is needed to unlock the device at the console.
    DeviceLock { pin: String },
    /// Apple erase.
    EraseDevice,
    /// Windows remote wipe through the RemoteWipe CSP.
    WindowsRemoteWipe,
}

impl MdmCommand {
    pub fn request_type(&self) -> &'static str {
        match self {
            MdmCommand::DeviceLock { .. } => "DeviceLock",
            MdmCommand::EraseDevice => "EraseDevice",
            MdmCommand::WindowsRemoteWipe => "./Device/Vendor/MSFT/RemoteWipe/doWipeProtected",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            MdmCommand::DeviceLock { pin } => json!({ "PIN": pin }),
            MdmCommand::EraseDevice => json!({ "PreserveDataPlan": false }),
            MdmCommand::WindowsRemoteWipe => json!({}),
        }
    }
}

/// Status of a command as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdmCommandStatus {
    Pending,
    Acknowledged,
    Error,
}

impl MdmCommandStatus {
    /// Parse a device-reported status. Anything other than an
    /// acknowledgement or an error leaves the command pending.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "acknowledged" | "200" => MdmCommandStatus::Acknowledged,
            "error" | "commandformaterror" => MdmCommandStatus::Error,
            _ => MdmCommandStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MdmCommandStatus::Pending => "Pending",
            MdmCommandStatus::Acknowledged => "Acknowledged",
            MdmCommandStatus::Error => "Error",
        }
    }
}

impl fmt::Display for MdmCommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MdmCommandStatus> for ActionOutcome {
    fn from(status: MdmCommandStatus) -> Self {
        match status {
            MdmCommandStatus::Pending => ActionOutcome::Pending,
            MdmCommandStatus::Acknowledged => ActionOutcome::Succeeded,
            MdmCommandStatus::Error => ActionOutcome::Failed,
        }
    }
}

/// MDM command backend.
#[async_trait]
pub trait MdmCommander: Send + Sync {
    /// Queue `command` for the host under the caller-chosen `command_id`.
    async fn issue(&self, host: &Host, command_id: &str, command: &MdmCommand) -> Result<()>;

    /// Latest status of a command on a host.
    async fn result(&self, command_id: &str, host_uuid: &str) -> Result<MdmCommandStatus>;
}

/// Commander that records commands in the local database. Devices report
/// back through [`LocalMdmCommander::record_result`].
pub struct LocalMdmCommander {
    backend: Arc<SqliteBackend>,
}

impl LocalMdmCommander {
    pub fn new(backend: Arc<SqliteBackend>) -> Self {
        Self { backend }
    }

    pub async fn record_result(
        &self,
        command_id: &str,
        host_uuid: &str,
        status: MdmCommandStatus,
    ) -> Result<()> {
        self.backend
            .set_mdm_command_status(command_id, host_uuid, status.as_str())
            .await?;
        tracing::info!(command_id, host_uuid, status = %status, "Recorded MDM command result");
        Ok(())
    }
}

#[async_trait]
impl MdmCommander for LocalMdmCommander {
    async fn issue(&self, host: &Host, command_id: &str, command: &MdmCommand) -> Result<()> {
        self.backend
            .insert_mdm_command(command_id, &host.uuid, command.request_type(), &command.payload())
            .await?;
        tracing::info!(
            host_id = host.id,
            command_id,
            request_type = command.request_type(),
            "Issued MDM command"
        );
        Ok(())
    }

    async fn result(&self, command_id: &str, host_uuid: &str) -> Result<MdmCommandStatus> {
        let stored = self.backend.get_mdm_command(command_id, host_uuid).await?;
        Ok(stored
            .status
            .as_deref()
            .map(MdmCommandStatus::parse)
            .unwrap_or(MdmCommandStatus::Pending))
    }
}
