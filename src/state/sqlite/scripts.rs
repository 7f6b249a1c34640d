use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeSet, HashMap};

use super::activities;
use super::is_constraint_violation;
use crate::error::HostqError;
use crate::scripts::content::checksum;
use crate::state::models::{DesiredScript, HostId, NewScript, Script, ScriptChange, ScriptScope};
use crate::state::now;

const SCRIPT_COLUMNS: &str = "id, team_id, name, script_content_id, created_at, updated_at";

fn script_from_row(row: &Row) -> rusqlite::Result<Script> {
    Ok(Script {
        id: row.get(0)?,
        team_id: row.get(1)?,
        name: row.get(2)?,
        script_content_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Store `contents` content-addressed; identical bodies share one row.
pub(super) fn insert_contents(conn: &Connection, contents: &str) -> Result<i64> {
    let sum = checksum(contents);
    conn.execute(
        "INSERT INTO script_contents (checksum, contents, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(checksum) DO NOTHING",
        params![sum, contents, now()],
    )?;
    let id = conn.query_row(
        "SELECT id FROM script_contents WHERE checksum = ?1",
        params![sum],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(super) fn get_contents(conn: &Connection, content_id: i64) -> Result<String> {
    conn.query_row(
        "SELECT contents FROM script_contents WHERE id = ?1",
        params![content_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| HostqError::not_found("ScriptContent", content_id).into())
}

pub(super) fn ensure_contents_exist(conn: &Connection, content_id: i64) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM script_contents WHERE id = ?1)",
        params![content_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(HostqError::not_found("ScriptContent", content_id).into());
    }
    Ok(())
}

pub(super) fn create(conn: &Connection, new: &NewScript) -> Result<Script> {
    let content_id = insert_contents(conn, &new.contents)?;
    let ts = now();
    let inserted = conn.execute(
        "INSERT INTO scripts (team_id, scope_key, name, script_content_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            new.scope.team_id(),
            new.scope.scope_key(),
            new.name,
            content_id,
            ts
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(HostqError::validation(format!(
                "a script named '{}' already exists in this scope",
                new.name
            ))
            .into());
        }
        Err(e) => return Err(e.into()),
    }
    let id = conn.last_insert_rowid();
    tracing::info!(script_id = id, name = %new.name, "Created script");
    get(conn, id)
}

pub(super) fn get(conn: &Connection, script_id: i64) -> Result<Script> {
    conn.query_row(
        &format!("SELECT {} FROM scripts WHERE id = ?1", SCRIPT_COLUMNS),
        params![script_id],
        script_from_row,
    )
    .optional()?
    .ok_or_else(|| HostqError::not_found("Script", script_id).into())
}

pub(super) fn get_by_name(conn: &Connection, scope: ScriptScope, name: &str) -> Result<Script> {
    conn.query_row(
        &format!(
            "SELECT {} FROM scripts WHERE scope_key = ?1 AND name = ?2",
            SCRIPT_COLUMNS
        ),
        params![scope.scope_key(), name],
        script_from_row,
    )
    .optional()?
    .ok_or_else(|| HostqError::not_found("Script", name).into())
}

pub(super) fn list(conn: &Connection, scope: ScriptScope) -> Result<Vec<Script>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scripts WHERE scope_key = ?1 ORDER BY name",
        SCRIPT_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![scope.scope_key()], script_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Cancel pending executions of a saved script.
///
/// Sync executions created after `cutoff` are left alone: a caller may still
/// be waiting on them. With `keep_content`, executions already running that
/// body are kept too. Returns the hosts that had an execution canceled.
/// Reactivation is left to the caller, outside this transaction.
pub(super) fn cancel_pending_executions(
    conn: &Connection,
    script_id: i64,
    keep_content: Option<i64>,
    cutoff: &str,
) -> Result<Vec<HostId>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM upcoming_activities ua
         JOIN script_upcoming_activities sua ON sua.upcoming_activity_id = ua.id
         WHERE sua.script_id = ?1
           AND (?2 IS NULL OR sua.script_content_id <> ?2)
           AND (sua.sync_request = 0 OR ua.created_at < ?3)
         ORDER BY ua.id",
        activities::ACTIVITY_COLUMNS_UA
    ))?;
    let doomed = stmt
        .query_map(params![script_id, keep_content, cutoff], activities::activity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut hosts = BTreeSet::new();
    for activity in &doomed {
        activities::mark_script_canceled(conn, activity)?;
        activities::remove(conn, activity.id)?;
        hosts.insert(activity.host_id);
    }

    if !doomed.is_empty() {
        tracing::info!(
            script_id,
            canceled = doomed.len(),
            hosts = hosts.len(),
            "Canceled pending script executions"
        );
    }
    Ok(hosts.into_iter().collect())
}

pub(super) fn update_contents(
    conn: &Connection,
    script_id: i64,
    contents: &str,
    cutoff: &str,
) -> Result<ScriptChange<Script>> {
    let script = get(conn, script_id)?;
    let content_id = insert_contents(conn, contents)?;
    if content_id == script.script_content_id {
        return Ok(ScriptChange {
            value: script,
            affected_hosts: vec![],
        });
    }

    conn.execute(
        "UPDATE scripts SET script_content_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![content_id, now(), script_id],
    )?;
    let affected_hosts = cancel_pending_executions(conn, script_id, Some(content_id), cutoff)?;
    Ok(ScriptChange {
        value: get(conn, script_id)?,
        affected_hosts,
    })
}

pub(super) fn delete(conn: &Connection, script_id: i64, cutoff: &str) -> Result<ScriptChange<()>> {
    let script = get(conn, script_id)?;

    let automation: Option<String> = conn
        .query_row(
            "SELECT name FROM script_automations WHERE script_id = ?1 ORDER BY name LIMIT 1",
            params![script_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(name) = automation {
        return Err(HostqError::conflict(format!(
            "script '{}' is used by automation '{}'",
            script.name, name
        ))
        .into());
    }

    let affected_hosts = cancel_pending_executions(conn, script_id, None, cutoff)?;
    conn.execute("DELETE FROM scripts WHERE id = ?1", params![script_id])?;
    tracing::info!(script_id, name = %script.name, "Deleted script");
    Ok(ScriptChange {
        value: (),
        affected_hosts,
    })
}

/// Reconcile the scripts of `scope` with `desired`: missing ones are
/// created, changed ones get the new body, absent ones are deleted.
pub(super) fn batch_set(
    conn: &Connection,
    scope: ScriptScope,
    desired: &[DesiredScript],
    cutoff: &str,
) -> Result<ScriptChange<Vec<Script>>> {
    let existing: HashMap<String, Script> = list(conn, scope)?
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    let wanted: HashMap<&str, &DesiredScript> =
        desired.iter().map(|d| (d.name.as_str(), d)).collect();

    let mut affected = BTreeSet::new();

    for (name, script) in &existing {
        if wanted.contains_key(name.as_str()) {
            continue;
        }
        conn.execute(
            "DELETE FROM script_automations WHERE script_id = ?1",
            params![script.id],
        )?;
        affected.extend(cancel_pending_executions(conn, script.id, None, cutoff)?);
        conn.execute("DELETE FROM scripts WHERE id = ?1", params![script.id])?;
        tracing::debug!(script_id = script.id, name = %name, "Removed script not in desired set");
    }

    let ts = now();
    for entry in desired {
        let content_id = insert_contents(conn, &entry.contents)?;
        match existing.get(&entry.name) {
            Some(script) if script.script_content_id == content_id => {}
            Some(script) => {
                conn.execute(
                    "UPDATE scripts SET script_content_id = ?1, updated_at = ?2 WHERE id = ?3",
                    params![content_id, ts, script.id],
                )?;
                affected.extend(cancel_pending_executions(
                    conn,
                    script.id,
                    Some(content_id),
                    cutoff,
                )?);
            }
            None => {
                conn.execute(
                    "INSERT INTO scripts (team_id, scope_key, name, script_content_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![scope.team_id(), scope.scope_key(), entry.name, content_id, ts],
                )?;
            }
        }
    }

    Ok(ScriptChange {
        value: list(conn, scope)?,
        affected_hosts: affected.into_iter().collect(),
    })
}

pub(super) fn link_automation(conn: &Connection, name: &str, script_id: i64) -> Result<()> {
    get(conn, script_id)?;
    conn.execute(
        "INSERT INTO script_automations (name, script_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET script_id = excluded.script_id",
        params![name, script_id, now()],
    )?;
    Ok(())
}

/// Delete script bodies no script, result or queued activity refers to.
pub(super) fn cleanup_unused_contents(conn: &Connection) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM script_contents
         WHERE NOT EXISTS (
            SELECT 1 FROM host_script_results WHERE script_content_id = script_contents.id)
           AND NOT EXISTS (
            SELECT 1 FROM scripts WHERE script_content_id = script_contents.id)
           AND NOT EXISTS (
            SELECT 1 FROM script_upcoming_activities WHERE script_content_id = script_contents.id)",
        [],
    )?;
    if removed > 0 {
        tracing::info!(removed, "Cleaned up unused script contents");
    }
    Ok(removed)
}
