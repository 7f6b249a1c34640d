use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::backend::StateBackend;
use super::migration;
use super::models::*;
use super::retry;
use crate::config::types::{RetrySettings, Settings};
use crate::error::HostqError;

mod actions;
mod activities;
mod batch;
mod mdm;
mod results;
mod scripts;

pub use mdm::StoredCommand;

/// SQLite-backed store.
///
/// Writes take an IMMEDIATE transaction so concurrent writers serialize on
/// the database lock instead of failing at commit. Several handles may be
/// opened on the same file.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    retry: RetrySettings,
}

impl SqliteBackend {
    /// Open or create the database with default settings.
    pub fn open(db_path: &str) -> Result<Self> {
        Self::open_with(db_path, &Settings::default())
    }

    pub fn open_with(db_path: &str, settings: &Settings) -> Result<Self> {
        let parent = Path::new(db_path).parent();
        if let Some(dir) = parent {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.busy_timeout(settings.busy_timeout())?;
        // journal_mode returns a row, so it cannot go through execute_batch on all builds.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: settings.retry.clone(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetrySettings::default(),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run `f` in one IMMEDIATE transaction. The connection guard never
    /// outlives this call.
    fn run_tx<T>(&self, f: &(dyn Fn(&Transaction<'_>) -> Result<T> + Send + Sync)) -> Result<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a write transaction, retrying transient contention.
    async fn write<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send,
        F: Fn(&Transaction<'_>) -> Result<T> + Send + Sync,
    {
        retry::with_retry(&self.retry, operation, || async { self.run_tx(&f) }).await
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock_conn()?;
        f(&conn)
    }

    // ─── Local MDM command log ──────────────────────────────────────────────

    pub async fn insert_mdm_command(
        &self,
        command_uuid: &str,
        host_uuid: &str,
        request_type: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let payload = payload.to_string();
        self.write("insert_mdm_command", |tx| {
            mdm::insert_command(tx, command_uuid, host_uuid, request_type, &payload)
        })
        .await
    }

    pub async fn get_mdm_command(&self, command_uuid: &str, host_uuid: &str) -> Result<StoredCommand> {
        self.read(|conn| mdm::get_command(conn, command_uuid, host_uuid))
    }

    pub async fn set_mdm_command_status(
        &self,
        command_uuid: &str,
        host_uuid: &str,
        status: &str,
    ) -> Result<()> {
        self.write("set_mdm_command_status", |tx| {
            mdm::set_status(tx, command_uuid, host_uuid, status)
        })
        .await
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        migration::check_and_migrate(&conn)
    }

    // ─── Hosts ──────────────────────────────────────────────────────────────

    async fn upsert_host(&self, host: &Host) -> Result<()> {
        self.write("upsert_host", |tx| {
            tx.execute(
                "INSERT INTO hosts (id, uuid, platform, team_id, has_agent, scripts_enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    uuid = excluded.uuid,
                    platform = excluded.platform,
                    team_id = excluded.team_id,
                    has_agent = excluded.has_agent,
                    scripts_enabled = excluded.scripts_enabled",
                params![
                    host.id,
                    host.uuid,
                    host.platform.as_str(),
                    host.team_id,
                    host.has_agent,
                    host.scripts_enabled,
                    super::now(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_host(&self, host_id: HostId) -> Result<Host> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM hosts WHERE id = ?1", HOST_COLUMNS),
                params![host_id],
                host_from_row,
            )
            .optional()?
            .ok_or_else(|| HostqError::not_found("Host", host_id).into())
        })
    }

    async fn get_host_by_uuid(&self, uuid: &str) -> Result<Host> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM hosts WHERE uuid = ?1", HOST_COLUMNS),
                params![uuid],
                host_from_row,
            )
            .optional()?
            .ok_or_else(|| HostqError::not_found("Host", uuid).into())
        })
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM hosts ORDER BY id", HOST_COLUMNS))?;
            let rows = stmt
                .query_map([], host_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ─── Activity queue ─────────────────────────────────────────────────────

    async fn enqueue_activity(
        &self,
        activity: &NewActivity,
        script: Option<&ScriptActivityFields>,
    ) -> Result<Activity> {
        self.write("enqueue_activity", |tx| activities::enqueue(tx, activity, script))
            .await
    }

    async fn activate_next(&self, host_id: HostId) -> Result<Option<Activity>> {
        self.write("activate_next", |tx| activities::activate_next(tx, host_id))
            .await
    }

    async fn activate_next_for_hosts(&self, host_ids: &[HostId]) -> Result<usize> {
        let mut activated = 0;
        let mut failed = 0;
        for &host_id in host_ids {
            match self.activate_next(host_id).await {
                Ok(Some(_)) => activated += 1,
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    tracing::warn!(host_id, error = %format!("{:#}", e), "Failed to activate next activity");
                }
            }
        }
        if failed > 0 {
            tracing::warn!(hosts = host_ids.len(), failed, "Reactivation pass incomplete");
        }
        Ok(activated)
    }

    async fn cancel_activity(
        &self,
        host_id: HostId,
        execution_id: &str,
    ) -> Result<CanceledActivity> {
        self.write("cancel_activity", |tx| {
            activities::cancel(tx, host_id, execution_id)
        })
        .await
    }

    async fn complete_activity(
        &self,
        host_id: HostId,
        execution_id: &str,
    ) -> Result<CompletedActivity> {
        self.write("complete_activity", |tx| {
            activities::complete(tx, host_id, execution_id)
        })
        .await
    }

    async fn list_activities(
        &self,
        host_id: HostId,
        filter: &ActivityFilter,
    ) -> Result<Vec<Activity>> {
        self.read(|conn| activities::list(conn, host_id, filter))
    }

    async fn get_activity(&self, execution_id: &str) -> Result<Option<Activity>> {
        self.read(|conn| activities::get(conn, execution_id))
    }

    // ─── Scripts ────────────────────────────────────────────────────────────

    async fn insert_script_contents(&self, contents: &str) -> Result<i64> {
        self.write("insert_script_contents", |tx| {
            scripts::insert_contents(tx, contents)
        })
        .await
    }

    async fn get_script_contents(&self, content_id: i64) -> Result<String> {
        self.read(|conn| scripts::get_contents(conn, content_id))
    }

    async fn create_script(&self, script: &NewScript) -> Result<Script> {
        self.write("create_script", |tx| scripts::create(tx, script)).await
    }

    async fn get_script(&self, script_id: i64) -> Result<Script> {
        self.read(|conn| scripts::get(conn, script_id))
    }

    async fn get_script_by_name(&self, scope: ScriptScope, name: &str) -> Result<Script> {
        self.read(|conn| scripts::get_by_name(conn, scope, name))
    }

    async fn list_scripts(&self, scope: ScriptScope) -> Result<Vec<Script>> {
        self.read(|conn| scripts::list(conn, scope))
    }

    async fn update_script_contents(
        &self,
        script_id: i64,
        contents: &str,
        grace: Duration,
    ) -> Result<ScriptChange<Script>> {
        self.write("update_script_contents", |tx| {
            let cutoff = grace_cutoff(grace)?;
            scripts::update_contents(tx, script_id, contents, &cutoff)
        })
        .await
    }

    async fn delete_script(&self, script_id: i64, grace: Duration) -> Result<ScriptChange<()>> {
        self.write("delete_script", |tx| {
            let cutoff = grace_cutoff(grace)?;
            scripts::delete(tx, script_id, &cutoff)
        })
        .await
    }

    async fn batch_set_scripts(
        &self,
        scope: ScriptScope,
        desired: &[DesiredScript],
        grace: Duration,
    ) -> Result<ScriptChange<Vec<Script>>> {
        self.write("batch_set_scripts", |tx| {
            let cutoff = grace_cutoff(grace)?;
            scripts::batch_set(tx, scope, desired, &cutoff)
        })
        .await
    }

    async fn link_automation(&self, name: &str, script_id: i64) -> Result<()> {
        self.write("link_automation", |tx| {
            scripts::link_automation(tx, name, script_id)
        })
        .await
    }

    async fn unlink_automation(&self, name: &str) -> Result<bool> {
        self.write("unlink_automation", |tx| {
            let n = tx.execute(
                "DELETE FROM script_automations WHERE name = ?1",
                params![name],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn cleanup_unused_script_contents(&self) -> Result<usize> {
        self.write("cleanup_unused_script_contents", |tx| {
            scripts::cleanup_unused_contents(tx)
        })
        .await
    }

    // ─── Script executions ──────────────────────────────────────────────────

    async fn new_script_execution(
        &self,
        request: &ScriptExecutionRequest,
    ) -> Result<HostScriptResult> {
        self.write("new_script_execution", |tx| {
            results::new_execution(tx, request)
        })
        .await
    }

    async fn set_script_result(&self, payload: &ScriptResultPayload) -> Result<RecordedResult> {
        let outcome = self
            .write("set_script_result", |tx| results::set_result(tx, payload))
            .await?;
        match outcome {
            results::ResultWrite::Recorded(recorded) => Ok(recorded),
            results::ResultWrite::Unknown => Err(HostqError::not_found(
                "HostScriptResult",
                &payload.execution_id,
            )
            .into()),
        }
    }

    async fn get_script_result(&self, execution_id: &str) -> Result<HostScriptResult> {
        self.read(|conn| {
            results::get(conn, execution_id)?
                .ok_or_else(|| HostqError::not_found("HostScriptResult", execution_id).into())
        })
    }

    async fn is_execution_pending(&self, host_id: HostId, script_id: i64) -> Result<bool> {
        self.read(|conn| results::is_pending(conn, host_id, script_id))
    }

    // ─── Lock / unlock / wipe ───────────────────────────────────────────────

    async fn get_host_mdm_actions(&self, host_id: HostId) -> Result<Option<HostMdmActions>> {
        self.read(|conn| actions::get(conn, host_id))
    }

    async fn request_action_via_script(
        &self,
        kind: ActionKind,
        request: &ScriptExecutionRequest,
        expected: Option<&str>,
        platform: Platform,
    ) -> Result<HostScriptResult> {
        self.write("request_action_via_script", |tx| {
            let result = results::new_execution(tx, request)?;
            actions::record_ref(
                tx,
                request.host_id,
                kind,
                &result.execution_id,
                expected,
                platform,
                None,
            )?;
            Ok(result)
        })
        .await
    }

    async fn record_action_ref(
        &self,
        host_id: HostId,
        kind: ActionKind,
        action_ref: &str,
        expected: Option<&str>,
        platform: Platform,
        unlock_pin: Option<&str>,
    ) -> Result<()> {
        self.write("record_action_ref", |tx| {
            actions::record_ref(tx, host_id, kind, action_ref, expected, platform, unlock_pin)
        })
        .await
    }

    async fn clear_action_ref(
        &self,
        host_id: HostId,
        kind: ActionKind,
        action_ref: &str,
    ) -> Result<bool> {
        self.write("clear_action_ref", |tx| {
            actions::clear_ref(tx, host_id, kind, action_ref)
        })
        .await
    }

    async fn unlock_host_manually(
        &self,
        host_id: HostId,
        platform: Platform,
        at: &str,
    ) -> Result<String> {
        self.write("unlock_host_manually", |tx| {
            actions::unlock_manually(tx, host_id, platform, at)
        })
        .await
    }

    async fn apply_action_result(
        &self,
        host_id: HostId,
        kind: ActionKind,
        action_ref: &str,
        succeeded: bool,
        unlock_eligible_after_lock: bool,
    ) -> Result<bool> {
        self.write("apply_action_result", |tx| {
            actions::apply_completion(
                tx,
                host_id,
                kind,
                Some(action_ref),
                succeeded,
                unlock_eligible_after_lock,
            )
        })
        .await
    }

    // ─── Batch executions ───────────────────────────────────────────────────

    async fn batch_execute_script(
        &self,
        script_id: i64,
        plans: &[BatchHostPlan],
        requester: Option<&str>,
    ) -> Result<String> {
        self.write("batch_execute_script", |tx| {
            batch::execute(tx, script_id, plans, requester)
        })
        .await
    }

    async fn batch_summary(&self, batch_id: &str) -> Result<BatchSummary> {
        self.read(|conn| batch::summary(conn, batch_id))
    }

    async fn batch_host_results(&self, batch_id: &str) -> Result<Vec<BatchHostResult>> {
        self.read(|conn| batch::host_results(conn, batch_id))
    }
}

// ─── Row helpers ────────────────────────────────────────────────────────────

const HOST_COLUMNS: &str = "id, uuid, platform, team_id, has_agent, scripts_enabled";

fn host_from_row(row: &rusqlite::Row) -> rusqlite::Result<Host> {
    let platform: String = row.get(2)?;
    Ok(Host {
        id: row.get(0)?,
        uuid: row.get(1)?,
        platform: Platform::parse(&platform),
        team_id: row.get(3)?,
        has_agent: row.get(4)?,
        scripts_enabled: row.get(5)?,
    })
}

/// Wrap a decoding failure of a TEXT column as a rusqlite error.
fn text_conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

/// Creation timestamps older than this are outside the grace window.
fn grace_cutoff(grace: Duration) -> Result<String> {
    let grace = chrono::Duration::from_std(grace).context("grace window out of range")?;
    Ok(super::format_ts(chrono::Utc::now() - grace))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}
