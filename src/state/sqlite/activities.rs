use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::text_conversion;
use crate::error::HostqError;
use crate::state::models::{
    Activity, ActivityFilter, ActivityType, CanceledActivity, CompletedActivity, HostId, NewActivity,
    ScriptActivityFields,
};
use crate::state::now;

pub(super) const ACTIVITY_COLUMNS: &str =
    "id, host_id, execution_id, activity_type, priority, payload, created_at, activated_at";

pub(super) const ACTIVITY_COLUMNS_UA: &str = "ua.id, ua.host_id, ua.execution_id, ua.activity_type, \
     ua.priority, ua.payload, ua.created_at, ua.activated_at";

/// Activated row first, then priority descending, then FIFO.
const QUEUE_ORDER: &str =
    "(activated_at IS NOT NULL) DESC, priority DESC, created_at ASC, id ASC";

/// Activates the head of the queue only when nothing is activated yet.
/// The partial unique index on `host_id WHERE activated_at IS NOT NULL`
/// backs the same rule at the storage level.
const ACTIVATE_NEXT_SQL: &str = "
UPDATE upcoming_activities SET activated_at = ?2
WHERE id = (
    SELECT id FROM upcoming_activities
    WHERE host_id = ?1 AND activated_at IS NULL
    ORDER BY priority DESC, created_at ASC, id ASC
    LIMIT 1
)
AND NOT EXISTS (
    SELECT 1 FROM upcoming_activities WHERE host_id = ?1 AND activated_at IS NOT NULL
)
RETURNING id, host_id, execution_id, activity_type, priority, payload, created_at, activated_at";

pub(super) fn activity_from_row(row: &Row) -> rusqlite::Result<Activity> {
    let activity_type: String = row.get(3)?;
    let payload: String = row.get(5)?;
    Ok(Activity {
        id: row.get(0)?,
        host_id: row.get(1)?,
        execution_id: row.get(2)?,
        activity_type: ActivityType::parse(&activity_type).map_err(|e| text_conversion(3, e))?,
        priority: row.get(4)?,
        payload: serde_json::from_str(&payload).map_err(|e| text_conversion(5, e))?,
        created_at: row.get(6)?,
        activated_at: row.get(7)?,
    })
}

pub(super) fn enqueue(
    conn: &Connection,
    new: &NewActivity,
    script: Option<&ScriptActivityFields>,
) -> Result<Activity> {
    if let Some(fields) = script {
        super::scripts::ensure_contents_exist(conn, fields.script_content_id)?;
    }

    let execution_id = uuid::Uuid::new_v4().to_string();
    let created_at = now();
    conn.execute(
        "INSERT INTO upcoming_activities (host_id, execution_id, activity_type, priority, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.host_id,
            execution_id,
            new.activity_type.as_str(),
            new.priority,
            new.payload.to_string(),
            created_at,
        ],
    )?;
    let id = conn.last_insert_rowid();

    if let Some(fields) = script {
        conn.execute(
            "INSERT INTO script_upcoming_activities
                (upcoming_activity_id, script_id, script_content_id, sync_request, requester)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                fields.script_id,
                fields.script_content_id,
                fields.sync_request,
                fields.requester,
            ],
        )?;
    }

    tracing::debug!(
        host_id = new.host_id,
        execution_id = %execution_id,
        activity_type = %new.activity_type,
        priority = new.priority,
        "Enqueued activity"
    );

    Ok(Activity {
        id,
        host_id: new.host_id,
        execution_id,
        activity_type: new.activity_type,
        priority: new.priority,
        created_at,
        activated_at: None,
        payload: new.payload.clone(),
    })
}

/// Activate the next queued activity of `host_id`, if the host is idle.
///
/// Script-running activities get their result placeholder here, so a row
/// with a NULL exit code exists for every activated script.
pub(super) fn activate_next(conn: &Connection, host_id: HostId) -> Result<Option<Activity>> {
    let activated = conn
        .query_row(ACTIVATE_NEXT_SQL, params![host_id, now()], activity_from_row)
        .optional()?;

    let Some(activity) = activated else {
        return Ok(None);
    };

    if activity.activity_type.runs_script() {
        let ts = now();
        conn.execute(
            "INSERT INTO host_script_results
                (host_id, execution_id, script_id, script_content_id, activity_type,
                 sync_request, requester, created_at, updated_at)
             SELECT ?1, ?2, sua.script_id, sua.script_content_id, ?3,
                    sua.sync_request, sua.requester, ?4, ?5
             FROM script_upcoming_activities sua
             WHERE sua.upcoming_activity_id = ?6
             ON CONFLICT(execution_id) DO NOTHING",
            params![
                activity.host_id,
                activity.execution_id,
                activity.activity_type.as_str(),
                activity.created_at,
                ts,
                activity.id,
            ],
        )?;
    }

    tracing::info!(
        host_id,
        execution_id = %activity.execution_id,
        activity_type = %activity.activity_type,
        "Activated activity"
    );
    Ok(Some(activity))
}

/// Record a canceled terminal result for a script activity about to be
/// removed from the queue. Results that already have an exit code stay.
pub(super) fn mark_script_canceled(conn: &Connection, activity: &Activity) -> Result<()> {
    if !activity.activity_type.runs_script() {
        return Ok(());
    }
    let ts = now();
    conn.execute(
        "INSERT INTO host_script_results
            (host_id, execution_id, script_id, script_content_id, activity_type,
             sync_request, requester, canceled, created_at, updated_at)
         SELECT ?1, ?2, sua.script_id, sua.script_content_id, ?3,
                sua.sync_request, sua.requester, 1, ?4, ?5
         FROM script_upcoming_activities sua
         WHERE sua.upcoming_activity_id = ?6
         ON CONFLICT(execution_id) DO UPDATE SET
            canceled = 1,
            updated_at = excluded.updated_at
         WHERE host_script_results.exit_code IS NULL",
        params![
            activity.host_id,
            activity.execution_id,
            activity.activity_type.as_str(),
            activity.created_at,
            ts,
            activity.id,
        ],
    )?;
    Ok(())
}

/// Remove an activity from the queue without activating anything.
pub(super) fn remove(conn: &Connection, activity_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM upcoming_activities WHERE id = ?1",
        params![activity_id],
    )?;
    Ok(())
}

pub(super) fn cancel(conn: &Connection, host_id: HostId, execution_id: &str) -> Result<CanceledActivity> {
    let activity = conn
        .query_row(
            &format!(
                "SELECT {} FROM upcoming_activities WHERE host_id = ?1 AND execution_id = ?2",
                ACTIVITY_COLUMNS
            ),
            params![host_id, execution_id],
            activity_from_row,
        )
        .optional()?
        .ok_or_else(|| HostqError::not_found("Activity", execution_id))?;

    mark_script_canceled(conn, &activity)?;
    remove(conn, activity.id)?;

    let was_activated = activity.is_activated();
    let next_activated = if was_activated {
        activate_next(conn, host_id)?.map(|a| a.execution_id)
    } else {
        None
    };

    tracing::info!(
        host_id,
        execution_id,
        was_activated,
        "Canceled activity"
    );

    Ok(CanceledActivity {
        execution_id: activity.execution_id,
        activity_type: activity.activity_type,
        was_activated,
        next_activated,
    })
}

pub(super) fn list(conn: &Connection, host_id: HostId, filter: &ActivityFilter) -> Result<Vec<Activity>> {
    let mut sql = format!(
        "SELECT {} FROM upcoming_activities WHERE host_id = ?1",
        ACTIVITY_COLUMNS
    );
    if filter.ready_only {
        sql.push_str(" AND activated_at IS NOT NULL");
    }
    if !filter.types.is_empty() {
        let types: Vec<String> = filter
            .types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect();
        sql.push_str(&format!(" AND activity_type IN ({})", types.join(", ")));
    }
    sql.push_str(&format!(" ORDER BY {}", QUEUE_ORDER));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![host_id], activity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(super) fn get(conn: &Connection, execution_id: &str) -> Result<Option<Activity>> {
    let activity = conn
        .query_row(
            &format!(
                "SELECT {} FROM upcoming_activities WHERE execution_id = ?1",
                ACTIVITY_COLUMNS
            ),
            params![execution_id],
            activity_from_row,
        )
        .optional()?;
    Ok(activity)
}

/// Drop the activity behind a recorded script result from the queue.
pub(super) fn dequeue(conn: &Connection, host_id: HostId, execution_id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM upcoming_activities WHERE host_id = ?1 AND execution_id = ?2",
        params![host_id, execution_id],
    )?;
    Ok(n > 0)
}

/// Finish an activated non-script activity and activate the next one.
///
/// An activity that is already gone is not an error: the next activation
/// still runs so the host cannot stay idle with work queued.
pub(super) fn complete(
    conn: &Connection,
    host_id: HostId,
    execution_id: &str,
) -> Result<CompletedActivity> {
    let activity = conn
        .query_row(
            &format!(
                "SELECT {} FROM upcoming_activities WHERE host_id = ?1 AND execution_id = ?2",
                ACTIVITY_COLUMNS
            ),
            params![host_id, execution_id],
            activity_from_row,
        )
        .optional()?;

    if let Some(activity) = &activity {
        if activity.activity_type.runs_script() {
            return Err(HostqError::validation(format!(
                "{} activity {} completes when its result is recorded",
                activity.activity_type, execution_id
            ))
            .into());
        }
        if !activity.is_activated() {
            return Err(HostqError::validation(format!(
                "activity {} has not been activated yet",
                execution_id
            ))
            .into());
        }
        remove(conn, activity.id)?;
    }

    let removed = activity.is_some();
    let next_activated = activate_next(conn, host_id)?.map(|a| a.execution_id);
    if removed {
        tracing::info!(host_id, execution_id, "Completed activity");
    } else {
        tracing::debug!(host_id, execution_id, "Activity already completed");
    }

    Ok(CompletedActivity {
        execution_id: execution_id.to_string(),
        removed,
        next_activated,
    })
}
