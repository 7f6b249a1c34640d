use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;

use super::{actions, activities, scripts, text_conversion};
use crate::state::models::{
    ActivityType, CorrelatedAction, HostId, HostScriptResult, NewActivity, RecordedResult,
    ScriptActivityFields, ScriptExecutionRequest, ScriptResultPayload, ScriptSource,
};
use crate::state::now;

const RESULT_COLUMNS: &str = "execution_id, host_id, script_id, script_content_id, activity_type,
    output, runtime, exit_code, timed_out, canceled, sync_request, requester, created_at";

pub(super) enum ResultWrite {
    Recorded(RecordedResult),
    /// No activated execution with that id exists for the host.
    Unknown,
}

fn result_from_row(row: &Row) -> rusqlite::Result<HostScriptResult> {
    let activity_type: String = row.get(4)?;
    Ok(HostScriptResult {
        execution_id: row.get(0)?,
        host_id: row.get(1)?,
        script_id: row.get(2)?,
        script_content_id: row.get(3)?,
        activity_type: ActivityType::parse(&activity_type).map_err(|e| text_conversion(4, e))?,
        output: row.get(5)?,
        runtime: row.get(6)?,
        exit_code: row.get(7)?,
        timed_out: row.get(8)?,
        canceled: row.get(9)?,
        sync_request: row.get(10)?,
        requester: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Enqueue a script execution and attempt activation, in the caller's
/// transaction.
pub(super) fn new_execution(
    conn: &Connection,
    request: &ScriptExecutionRequest,
) -> Result<HostScriptResult> {
    let (script_id, script_content_id) = match &request.source {
        ScriptSource::Inline(body) => (None, scripts::insert_contents(conn, body)?),
        ScriptSource::Saved {
            script_id,
            script_content_id,
        } => (Some(*script_id), *script_content_id),
    };

    let fields = ScriptActivityFields {
        script_id,
        script_content_id,
        sync_request: request.sync_request,
        requester: request.requester.clone(),
    };
    let activity = NewActivity {
        host_id: request.host_id,
        activity_type: ActivityType::Script,
        priority: request.priority,
        payload: json!({
            "script_id": script_id,
            "script_content_id": script_content_id,
            "sync_request": request.sync_request,
            "requester": request.requester,
        }),
    };

    let queued = activities::enqueue(conn, &activity, Some(&fields))?;
    activities::activate_next(conn, request.host_id)?;

    get(conn, &queued.execution_id)?.ok_or_else(|| {
        anyhow::anyhow!("execution {} vanished after enqueue", queued.execution_id)
    })
}

/// A stored result, or a synthesized pending view of a queued script
/// activity that has no result row yet.
pub(super) fn get(conn: &Connection, execution_id: &str) -> Result<Option<HostScriptResult>> {
    let stored = conn
        .query_row(
            &format!(
                "SELECT {} FROM host_script_results WHERE execution_id = ?1",
                RESULT_COLUMNS
            ),
            params![execution_id],
            result_from_row,
        )
        .optional()?;
    if stored.is_some() {
        return Ok(stored);
    }

    let queued = conn
        .query_row(
            "SELECT ua.execution_id, ua.host_id, sua.script_id, sua.script_content_id,
                    ua.activity_type, '', 0, NULL, 0, 0, sua.sync_request, sua.requester,
                    ua.created_at
             FROM upcoming_activities ua
             JOIN script_upcoming_activities sua ON sua.upcoming_activity_id = ua.id
             WHERE ua.execution_id = ?1",
            params![execution_id],
            result_from_row,
        )
        .optional()?;
    Ok(queued)
}

pub(super) fn is_pending(conn: &Connection, host_id: HostId, script_id: i64) -> Result<bool> {
    let pending = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM upcoming_activities ua
            JOIN script_upcoming_activities sua ON sua.upcoming_activity_id = ua.id
            WHERE ua.host_id = ?1 AND sua.script_id = ?2)",
        params![host_id, script_id],
        |row| row.get(0),
    )?;
    Ok(pending)
}

/// Store an agent-reported result.
///
/// A result for an execution that is already terminal is a no-op. Either
/// way the host's next activity is activated before returning.
pub(super) fn set_result(conn: &Connection, payload: &ScriptResultPayload) -> Result<ResultWrite> {
    let host_id = payload.host_id;
    let existing = conn
        .query_row(
            &format!(
                "SELECT {} FROM host_script_results WHERE host_id = ?1 AND execution_id = ?2",
                RESULT_COLUMNS
            ),
            params![host_id, payload.execution_id],
            result_from_row,
        )
        .optional()?;

    let Some(existing) = existing else {
        tracing::warn!(
            host_id,
            execution_id = %payload.execution_id,
            "Result for unknown or not yet activated execution"
        );
        activities::activate_next(conn, host_id)?;
        return Ok(ResultWrite::Unknown);
    };

    if existing.is_terminal() {
        tracing::debug!(
            host_id,
            execution_id = %payload.execution_id,
            canceled = existing.canceled,
            "Ignoring result for terminal execution"
        );
        activities::activate_next(conn, host_id)?;
        return Ok(ResultWrite::Recorded(RecordedResult {
            result: None,
            action: None,
            duplicate: true,
        }));
    }

    // Windows exit codes are unsigned 32-bit; keep the bit pattern.
    let exit_code = payload.exit_code as i32;
    conn.execute(
        "UPDATE host_script_results
         SET output = ?1, runtime = ?2, exit_code = ?3, timed_out = ?4, updated_at = ?5
         WHERE host_id = ?6 AND execution_id = ?7",
        params![
            payload.output,
            payload.runtime,
            exit_code,
            payload.timed_out,
            now(),
            host_id,
            payload.execution_id,
        ],
    )?;
    activities::dequeue(conn, host_id, &payload.execution_id)?;

    let succeeded = exit_code == 0 && !payload.timed_out;
    let action = if existing.activity_type == ActivityType::SoftwareUninstall {
        Some(CorrelatedAction::Uninstall)
    } else if let Some(kind) = actions::kind_for_ref(conn, host_id, &payload.execution_id)? {
        actions::apply_completion(conn, host_id, kind, None, succeeded, false)?;
        Some(CorrelatedAction::Device(kind))
    } else {
        None
    };

    activities::activate_next(conn, host_id)?;

    let result = get(conn, &payload.execution_id)?;
    tracing::info!(
        host_id,
        execution_id = %payload.execution_id,
        exit_code,
        timed_out = payload.timed_out,
        correlated = ?action,
        "Recorded script result"
    );
    Ok(ResultWrite::Recorded(RecordedResult {
        result,
        action,
        duplicate: false,
    }))
}
