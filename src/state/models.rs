use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HostqError;

pub type HostId = i64;

// ─── Hosts ──────────────────────────────────────────────────────────────────

/// Operating system reported by a host, normalized to what the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Darwin,
    Ios,
    Ipados,
    Windows,
    Linux,
    Other,
}

impl Platform {
    /// Parse a platform string as reported by the agent. Linux distributions
    /// collapse to `Linux`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "darwin" | "macos" => Platform::Darwin,
            "ios" => Platform::Ios,
            "ipados" => Platform::Ipados,
            "windows" => Platform::Windows,
            "linux" | "ubuntu" | "debian" | "rhel" | "centos" | "fedora" | "arch"
            | "amzn" | "sles" | "opensuse" | "gentoo" | "pop" | "manjaro" => Platform::Linux,
            _ => Platform::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Darwin => "darwin",
            Platform::Ios => "ios",
            Platform::Ipados => "ipados",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Other => "other",
        }
    }

    pub fn is_unix_like(&self) -> bool {
        matches!(self, Platform::Darwin | Platform::Linux)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed endpoint, as far as the queue needs to know it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub uuid: String,
    pub platform: Platform,
    pub team_id: Option<i64>,
    /// Whether an agent is enrolled and able to poll for work.
    pub has_agent: bool,
    pub scripts_enabled: bool,
}

impl Host {
    pub fn new(id: HostId, platform: Platform) -> Self {
        Self {
            id,
            uuid: uuid::Uuid::new_v4().to_string(),
            platform,
            team_id: None,
            has_agent: true,
            scripts_enabled: true,
        }
    }
}

// ─── Activities ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Script,
    SoftwareInstall,
    SoftwareUninstall,
    MdmCommand,
}

impl ActivityType {
    pub const ALL: [ActivityType; 4] = [
        ActivityType::Script,
        ActivityType::SoftwareInstall,
        ActivityType::SoftwareUninstall,
        ActivityType::MdmCommand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Script => "script",
            ActivityType::SoftwareInstall => "software_install",
            ActivityType::SoftwareUninstall => "software_uninstall",
            ActivityType::MdmCommand => "mdm_command",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HostqError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| HostqError::validation(format!("unknown activity type '{}'", s)))
    }

    /// Activities that run a script body on the host and report a script result.
    pub fn runs_script(&self) -> bool {
        matches!(self, ActivityType::Script | ActivityType::SoftwareUninstall)
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of pending work for a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub host_id: HostId,
    pub execution_id: String,
    pub activity_type: ActivityType,
    pub priority: i64,
    pub created_at: String,
    pub activated_at: Option<String>,
    pub payload: serde_json::Value,
}

impl Activity {
    pub fn is_activated(&self) -> bool {
        self.activated_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub host_id: HostId,
    pub activity_type: ActivityType,
    pub priority: i64,
    pub payload: serde_json::Value,
}

/// Script-specific columns of a queued activity, split out of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptActivityFields {
    pub script_id: Option<i64>,
    pub script_content_id: i64,
    pub sync_request: bool,
    pub requester: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    /// Only the activated ("ready to execute") activity.
    pub ready_only: bool,
    /// Restrict to these types; empty means all.
    pub types: Vec<ActivityType>,
}

impl ActivityFilter {
    pub fn all_pending() -> Self {
        Self::default()
    }

    pub fn ready_to_execute() -> Self {
        Self {
            ready_only: true,
            types: vec![],
        }
    }

    pub fn scripts(mut self) -> Self {
        self.types = vec![ActivityType::Script, ActivityType::SoftwareUninstall];
        self
    }
}

/// What a successful cancellation removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanceledActivity {
    pub execution_id: String,
    pub activity_type: ActivityType,
    pub was_activated: bool,
    /// Execution id of the activity activated in its place, if any.
    pub next_activated: Option<String>,
}

/// What completing an activated activity did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedActivity {
    pub execution_id: String,
    /// False when the activity had already left the queue.
    pub removed: bool,
    pub next_activated: Option<String>,
}

// ─── Scripts ────────────────────────────────────────────────────────────────

/// Where a script lives: globally or inside a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptScope {
    Global,
    Team(i64),
}

impl ScriptScope {
    pub fn from_team(team_id: Option<i64>) -> Self {
        match team_id {
            Some(id) => ScriptScope::Team(id),
            None => ScriptScope::Global,
        }
    }

    pub fn team_id(&self) -> Option<i64> {
        match self {
            ScriptScope::Global => None,
            ScriptScope::Team(id) => Some(*id),
        }
    }

    /// Key used for per-scope uniqueness; 0 stands for the global scope.
    pub fn scope_key(&self) -> i64 {
        self.team_id().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: i64,
    pub team_id: Option<i64>,
    pub name: String,
    pub script_content_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Script {
    pub fn scope(&self) -> ScriptScope {
        ScriptScope::from_team(self.team_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewScript {
    pub scope: ScriptScope,
    pub name: String,
    pub contents: String,
}

/// An entry in the desired script set of a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredScript {
    pub name: String,
    pub contents: String,
}

/// Result of a script mutation that canceled pending executions.
#[derive(Debug, Clone)]
pub struct ScriptChange<T> {
    pub value: T,
    /// Hosts that had at least one execution canceled, sorted and unique.
    pub affected_hosts: Vec<HostId>,
}

// ─── Script executions ──────────────────────────────────────────────────────

/// Body to run: an ad-hoc body (stored content-addressed) or a saved script.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Inline(String),
    Saved {
        script_id: i64,
        script_content_id: i64,
    },
}

#[derive(Debug, Clone)]
pub struct ScriptExecutionRequest {
    pub host_id: HostId,
    pub source: ScriptSource,
    pub priority: i64,
    pub requester: Option<String>,
    pub sync_request: bool,
}

/// A script result row, or the pending view of a queued script activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostScriptResult {
    pub execution_id: String,
    pub host_id: HostId,
    pub script_id: Option<i64>,
    pub script_content_id: i64,
    pub activity_type: ActivityType,
    pub output: String,
    pub runtime: i64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub canceled: bool,
    pub sync_request: bool,
    pub requester: Option<String>,
    pub created_at: String,
}

impl HostScriptResult {
    pub fn is_terminal(&self) -> bool {
        self.exit_code.is_some() || self.timed_out || self.canceled
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.canceled
    }
}

/// A result reported by the agent.
#[derive(Debug, Clone)]
pub struct ScriptResultPayload {
    pub host_id: HostId,
    pub execution_id: String,
    pub output: String,
    pub runtime: i64,
    /// Windows reports unsigned codes; stored as signed 32-bit.
    pub exit_code: i64,
    pub timed_out: bool,
}

/// Lock/unlock/wipe action kinds tracked per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Lock,
    Unlock,
    Wipe,
}

impl ActionKind {
    pub fn ref_column(&self) -> &'static str {
        match self {
            ActionKind::Lock => "lock_ref",
            ActionKind::Unlock => "unlock_ref",
            ActionKind::Wipe => "wipe_ref",
        }
    }

    pub fn from_ref_column(col: &str) -> Option<Self> {
        match col {
            "lock_ref" => Some(ActionKind::Lock),
            "unlock_ref" => Some(ActionKind::Unlock),
            "wipe_ref" => Some(ActionKind::Wipe),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Lock => f.write_str("lock"),
            ActionKind::Unlock => f.write_str("unlock"),
            ActionKind::Wipe => f.write_str("wipe"),
        }
    }
}

/// Downstream action a script result turned out to belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelatedAction {
    Device(ActionKind),
    Uninstall,
}

#[derive(Debug, Clone)]
pub struct RecordedResult {
    /// The stored result; `None` when the submission was a duplicate.
    pub result: Option<HostScriptResult>,
    pub action: Option<CorrelatedAction>,
    pub duplicate: bool,
}

// ─── Lock / unlock / wipe ───────────────────────────────────────────────────

/// Per-host row of pending security action references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMdmActions {
    pub host_id: HostId,
    pub lock_ref: Option<String>,
    pub unlock_ref: Option<String>,
    pub wipe_ref: Option<String>,
    pub unlock_pin: Option<String>,
    /// First time a manual unlock was asked for. `unlock_ref` alone only
    /// marks when a manual unlock became possible.
    pub unlock_requested_at: Option<String>,
    /// Platform recorded with the first action; survives OS changes after a wipe.
    pub platform: Option<Platform>,
}

impl HostMdmActions {
    pub fn action_ref(&self, kind: ActionKind) -> Option<&str> {
        match kind {
            ActionKind::Lock => self.lock_ref.as_deref(),
            ActionKind::Unlock => self.unlock_ref.as_deref(),
            ActionKind::Wipe => self.wipe_ref.as_deref(),
        }
    }
}

// ─── Batch executions ───────────────────────────────────────────────────────

/// Pre-flight decision for one host of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHostPlan {
    pub host_id: HostId,
    /// Set when the host was rejected before enqueuing.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHostResult {
    pub host_id: HostId,
    pub host_execution_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub script_id: Option<i64>,
    pub script_name: Option<String>,
    pub team_id: Option<i64>,
    pub created_at: String,
    pub targeted: u64,
    pub ran: u64,
    pub errored: u64,
    pub canceled: u64,
    pub pending: u64,
}
