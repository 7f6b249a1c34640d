use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::models::{
    ActionKind, Activity, ActivityFilter, BatchHostPlan, BatchHostResult, BatchSummary,
    CanceledActivity, CompletedActivity, DesiredScript, Host, HostId, HostMdmActions, HostScriptResult, NewActivity,
    NewScript, Platform, RecordedResult, Script, ScriptActivityFields, ScriptChange,
    ScriptExecutionRequest, ScriptResultPayload, ScriptScope,
};

/// Persistent store behind the queue, script, device and batch layers.
///
/// Every mutating method runs in a single transaction. Implementations
/// retry transient contention themselves.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Initialize the backend (create tables, run migrations).
    async fn initialize(&self) -> Result<()>;

    // ─── Hosts ──────────────────────────────────────────────────────────────

    /// Insert or replace a host record.
    async fn upsert_host(&self, host: &Host) -> Result<()>;

    async fn get_host(&self, host_id: HostId) -> Result<Host>;

    async fn get_host_by_uuid(&self, uuid: &str) -> Result<Host>;

    async fn list_hosts(&self) -> Result<Vec<Host>>;

    // ─── Activity queue ─────────────────────────────────────────────────────

    /// Append an activity in the queued state. Script-running activities
    /// carry their script columns alongside.
    async fn enqueue_activity(
        &self,
        activity: &NewActivity,
        script: Option<&ScriptActivityFields>,
    ) -> Result<Activity>;

    /// Activate the highest-priority queued activity of a host, unless one
    /// is already activated.
    async fn activate_next(&self, host_id: HostId) -> Result<Option<Activity>>;

    /// Run [`StateBackend::activate_next`] for each host in its own
    /// transaction. A host that fails is logged and skipped. Returns how
    /// many hosts got a newly activated activity.
    async fn activate_next_for_hosts(&self, host_ids: &[HostId]) -> Result<usize>;

    /// Remove a queued or activated activity, activating the next one when
    /// the removed activity was the activated one.
    async fn cancel_activity(&self, host_id: HostId, execution_id: &str)
        -> Result<CanceledActivity>;

    /// Finish the activated activity `execution_id` of a host and activate
    /// the next one. Completing an activity that already left the queue is
    /// a no-op. Script activities complete through their result instead.
    async fn complete_activity(&self, host_id: HostId, execution_id: &str)
        -> Result<CompletedActivity>;

    /// Pending activities of a host: activated first, then priority
    /// descending, then creation order.
    async fn list_activities(&self, host_id: HostId, filter: &ActivityFilter)
        -> Result<Vec<Activity>>;

    async fn get_activity(&self, execution_id: &str) -> Result<Option<Activity>>;

    // ─── Scripts ────────────────────────────────────────────────────────────

    /// Store a script body, reusing the existing row for identical content.
    async fn insert_script_contents(&self, contents: &str) -> Result<i64>;

    async fn get_script_contents(&self, content_id: i64) -> Result<String>;

    async fn create_script(&self, script: &NewScript) -> Result<Script>;

    async fn get_script(&self, script_id: i64) -> Result<Script>;

    async fn get_script_by_name(&self, scope: ScriptScope, name: &str) -> Result<Script>;

    async fn list_scripts(&self, scope: ScriptScope) -> Result<Vec<Script>>;

    /// Replace a script's body and cancel its pending executions outside
    /// the grace window.
    async fn update_script_contents(
        &self,
        script_id: i64,
        contents: &str,
        grace: Duration,
    ) -> Result<ScriptChange<Script>>;

    /// Delete a script and cancel its pending executions outside the grace
    /// window. Fails with a conflict while an automation references it.
    async fn delete_script(&self, script_id: i64, grace: Duration) -> Result<ScriptChange<()>>;

    /// Make the scripts of a scope match `desired` exactly.
    async fn batch_set_scripts(
        &self,
        scope: ScriptScope,
        desired: &[DesiredScript],
        grace: Duration,
    ) -> Result<ScriptChange<Vec<Script>>>;

    async fn link_automation(&self, name: &str, script_id: i64) -> Result<()>;

    /// Returns false when no automation had that name.
    async fn unlink_automation(&self, name: &str) -> Result<bool>;

    /// Delete script bodies nothing references. Returns the number removed.
    async fn cleanup_unused_script_contents(&self) -> Result<usize>;

    // ─── Script executions ──────────────────────────────────────────────────

    /// Enqueue a script execution and try to activate it.
    async fn new_script_execution(&self, request: &ScriptExecutionRequest)
        -> Result<HostScriptResult>;

    /// Store an agent-reported result, complete its activity, apply any
    /// correlated lock/wipe transition and activate the next activity.
    async fn set_script_result(&self, payload: &ScriptResultPayload) -> Result<RecordedResult>;

    /// A stored result, or the pending view of a queued execution.
    async fn get_script_result(&self, execution_id: &str) -> Result<HostScriptResult>;

    /// Whether an execution of the saved script is queued or running on the host.
    async fn is_execution_pending(&self, host_id: HostId, script_id: i64) -> Result<bool>;

    // ─── Lock / unlock / wipe ───────────────────────────────────────────────

    async fn get_host_mdm_actions(&self, host_id: HostId) -> Result<Option<HostMdmActions>>;

    /// Enqueue the script that performs `kind` and record it as the action's
    /// reference, atomically. Nothing is enqueued unless the stored
    /// reference still equals `expected`.
    async fn request_action_via_script(
        &self,
        kind: ActionKind,
        request: &ScriptExecutionRequest,
        expected: Option<&str>,
        platform: Platform,
    ) -> Result<HostScriptResult>;

    /// Record an externally issued action (e.g. an MDM command) as the
    /// reference for `kind`, if the stored reference still equals
    /// `expected`. A lock may carry the PIN that unlocks it.
    async fn record_action_ref(
        &self,
        host_id: HostId,
        kind: ActionKind,
        action_ref: &str,
        expected: Option<&str>,
        platform: Platform,
        unlock_pin: Option<&str>,
    ) -> Result<()>;

    /// Forget `action_ref` if it is still the reference for `kind`.
    async fn clear_action_ref(&self, host_id: HostId, kind: ActionKind, action_ref: &str)
        -> Result<bool>;

    /// Record a manual unlock request made at `at`. Repeated requests keep
    /// the first time. Returns the effective unlock reference.
    async fn unlock_host_manually(&self, host_id: HostId, platform: Platform, at: &str)
        -> Result<String>;

    /// Apply the completion transition for `kind` if the stored reference
    /// still equals `action_ref`. Returns whether the row changed.
    async fn apply_action_result(
        &self,
        host_id: HostId,
        kind: ActionKind,
        action_ref: &str,
        succeeded: bool,
        unlock_eligible_after_lock: bool,
    ) -> Result<bool>;

    // ─── Batch executions ───────────────────────────────────────────────────

    /// Enqueue the current contents of `script_id` on every accepted host
    /// and record the batch with per-host outcomes, in one transaction.
    /// Returns the batch id.
    async fn batch_execute_script(
        &self,
        script_id: i64,
        plans: &[BatchHostPlan],
        requester: Option<&str>,
    ) -> Result<String>;

    async fn batch_summary(&self, batch_id: &str) -> Result<BatchSummary>;

    async fn batch_host_results(&self, batch_id: &str) -> Result<Vec<BatchHostResult>>;
}
