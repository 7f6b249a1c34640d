use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use super::results;
use crate::error::HostqError;
use crate::state::models::{
    BatchHostPlan, BatchHostResult, BatchSummary, ScriptExecutionRequest, ScriptSource,
};
use crate::state::now;

/// The script is read inside the transaction so every host gets the
/// contents current at commit time.
pub(super) fn execute(
    conn: &Connection,
    script_id: i64,
    plans: &[BatchHostPlan],
    requester: Option<&str>,
) -> Result<String> {
    let script = super::scripts::get(conn, script_id)?;
    let batch_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batch_script_executions (execution_id, script_id, team_id, requester, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![batch_id, script.id, script.team_id, requester, now()],
    )?;

    let mut enqueued = 0usize;
    for plan in plans {
        let host_execution_id = match &plan.error {
            Some(_) => None,
            None => {
                let request = ScriptExecutionRequest {
                    host_id: plan.host_id,
                    source: ScriptSource::Saved {
                        script_id: script.id,
                        script_content_id: script.script_content_id,
                    },
                    priority: 0,
                    requester: requester.map(String::from),
                    sync_request: false,
                };
                enqueued += 1;
                Some(results::new_execution(conn, &request)?.execution_id)
            }
        };
        conn.execute(
            "INSERT INTO batch_script_execution_host_results
                (batch_execution_id, host_id, host_execution_id, error)
             VALUES (?1, ?2, ?3, ?4)",
            params![batch_id, plan.host_id, host_execution_id, plan.error],
        )?;
    }

    tracing::info!(
        batch_id = %batch_id,
        script_id = script.id,
        targeted = plans.len(),
        enqueued,
        "Recorded batch execution"
    );
    Ok(batch_id)
}

/// Aggregate a batch. Rejected hosts and non-zero or timed-out results
/// count as errored; anything not yet terminal is pending.
pub(super) fn summary(conn: &Connection, batch_id: &str) -> Result<BatchSummary> {
    let row = conn
        .query_row(
            "SELECT bse.execution_id, bse.script_id, s.name, bse.team_id, bse.created_at,
                COUNT(bsehr.id),
                COALESCE(SUM(CASE WHEN hsr.canceled = 0 AND hsr.timed_out = 0
                                   AND hsr.exit_code = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN bsehr.error IS NOT NULL THEN 1
                                  WHEN hsr.canceled = 0 AND (hsr.timed_out = 1
                                       OR (hsr.exit_code IS NOT NULL AND hsr.exit_code <> 0))
                                  THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN hsr.canceled = 1 THEN 1 ELSE 0 END), 0)
             FROM batch_script_executions bse
             LEFT JOIN scripts s ON s.id = bse.script_id
             LEFT JOIN batch_script_execution_host_results bsehr
                ON bsehr.batch_execution_id = bse.execution_id
             LEFT JOIN host_script_results hsr ON hsr.execution_id = bsehr.host_execution_id
             WHERE bse.execution_id = ?1
             GROUP BY bse.id",
            params![batch_id],
            |row| {
                let targeted: i64 = row.get(5)?;
                let ran: i64 = row.get(6)?;
                let errored: i64 = row.get(7)?;
                let canceled: i64 = row.get(8)?;
                let (targeted, ran, errored, canceled) =
                    (targeted as u64, ran as u64, errored as u64, canceled as u64);
                Ok(BatchSummary {
                    batch_id: row.get(0)?,
                    script_id: row.get(1)?,
                    script_name: row.get(2)?,
                    team_id: row.get(3)?,
                    created_at: row.get(4)?,
                    targeted,
                    ran,
                    errored,
                    canceled,
                    pending: targeted.saturating_sub(ran + errored + canceled),
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| HostqError::not_found("BatchExecution", batch_id).into())
}

pub(super) fn host_results(conn: &Connection, batch_id: &str) -> Result<Vec<BatchHostResult>> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM batch_script_executions WHERE execution_id = ?1)",
        params![batch_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(HostqError::not_found("BatchExecution", batch_id).into());
    }

    let mut stmt = conn.prepare(
        "SELECT host_id, host_execution_id, error
         FROM batch_script_execution_host_results
         WHERE batch_execution_id = ?1 ORDER BY host_id",
    )?;
    let rows = stmt
        .query_map(params![batch_id], |row| {
            Ok(BatchHostResult {
                host_id: row.get(0)?,
                host_execution_id: row.get(1)?,
                error: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
