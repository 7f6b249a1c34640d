use anyhow::Result;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};

use crate::device::state::RefUpdate;
use crate::error::HostqError;
use crate::state::models::{ActionKind, HostId, HostMdmActions, Platform};
use crate::state::now;

pub(super) fn get(conn: &Connection, host_id: HostId) -> Result<Option<HostMdmActions>> {
    let row = conn
        .query_row(
            "SELECT host_id, lock_ref, unlock_ref, wipe_ref, unlock_pin, unlock_requested_at, platform
             FROM host_mdm_actions WHERE host_id = ?1",
            params![host_id],
            |row| {
                let platform: String = row.get(6)?;
                Ok(HostMdmActions {
                    host_id: row.get(0)?,
                    lock_ref: row.get(1)?,
                    unlock_ref: row.get(2)?,
                    wipe_ref: row.get(3)?,
                    unlock_pin: row.get(4)?,
                    unlock_requested_at: row.get(5)?,
                    platform: (!platform.is_empty()).then(|| Platform::parse(&platform)),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Store `action_ref` as the pending reference for `kind`, provided the
/// stored reference still equals `expected`.
///
/// A lock never clears an existing PIN. A tracked unlock drops the PIN since
/// it no longer applies. The platform recorded first is kept. Fails with
/// `Validation` when another request changed the reference first.
pub(super) fn record_ref(
    conn: &Connection,
    host_id: HostId,
    kind: ActionKind,
    action_ref: &str,
    expected: Option<&str>,
    platform: Platform,
    unlock_pin: Option<&str>,
) -> Result<()> {
    let update = match kind {
        ActionKind::Lock => {
            "lock_ref = excluded.lock_ref,
             unlock_pin = COALESCE(excluded.unlock_pin, host_mdm_actions.unlock_pin)"
        }
        ActionKind::Unlock => "unlock_ref = excluded.unlock_ref, unlock_pin = NULL",
        ActionKind::Wipe => "wipe_ref = excluded.wipe_ref",
    };
    let col = kind.ref_column();
    let changed = conn.execute(
        &format!(
            "INSERT INTO host_mdm_actions (host_id, {col}, unlock_pin, platform)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(host_id) DO UPDATE SET {update},
                platform = CASE WHEN host_mdm_actions.platform = ''
                    THEN excluded.platform ELSE host_mdm_actions.platform END
             WHERE host_mdm_actions.{col} IS ?5",
            col = col,
            update = update
        ),
        params![
            host_id,
            action_ref,
            if kind == ActionKind::Lock { unlock_pin } else { None },
            platform.as_str(),
            expected,
        ],
    )?;
    if changed == 0 {
        return Err(HostqError::validation(format!(
            "host {} already has a {} request in progress",
            host_id, kind
        ))
        .into());
    }
    tracing::info!(host_id, action = %kind, action_ref, "Recorded device action");
    Ok(())
}

/// Drop `action_ref` from the row if it is still the stored reference.
pub(super) fn clear_ref(
    conn: &Connection,
    host_id: HostId,
    kind: ActionKind,
    action_ref: &str,
) -> Result<bool> {
    let n = conn.execute(
        &format!(
            "UPDATE host_mdm_actions SET {col} = NULL WHERE host_id = ?1 AND {col} = ?2",
            col = kind.ref_column()
        ),
        params![host_id, action_ref],
    )?;
    Ok(n > 0)
}

/// Record a manual unlock request at `at`. Only the first request time is
/// kept, and `unlock_ref` is set only if the lock has not already made the
/// device unlockable.
pub(super) fn unlock_manually(
    conn: &Connection,
    host_id: HostId,
    platform: Platform,
    at: &str,
) -> Result<String> {
    conn.execute(
        "INSERT INTO host_mdm_actions (host_id, unlock_ref, unlock_requested_at, platform)
         VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(host_id) DO UPDATE SET
            unlock_ref = COALESCE(host_mdm_actions.unlock_ref, excluded.unlock_ref),
            unlock_requested_at = COALESCE(
                host_mdm_actions.unlock_requested_at, excluded.unlock_requested_at)",
        params![host_id, at, platform.as_str()],
    )?;
    let unlock_ref: String = conn.query_row(
        "SELECT unlock_ref FROM host_mdm_actions WHERE host_id = ?1",
        params![host_id],
        |row| row.get(0),
    )?;
    tracing::info!(host_id, "Recorded manual unlock request");
    Ok(unlock_ref)
}

/// Which action, if any, `action_ref` is the pending reference of.
pub(super) fn kind_for_ref(
    conn: &Connection,
    host_id: HostId,
    action_ref: &str,
) -> Result<Option<ActionKind>> {
    let col: Option<String> = conn
        .query_row(
            "SELECT CASE
                WHEN lock_ref = ?2 THEN 'lock_ref'
                WHEN unlock_ref = ?2 THEN 'unlock_ref'
                WHEN wipe_ref = ?2 THEN 'wipe_ref'
             END
             FROM host_mdm_actions WHERE host_id = ?1",
            params![host_id, action_ref],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(col.as_deref().and_then(ActionKind::from_ref_column))
}

/// Apply the completion transition for `kind`. With `expected_ref`, only
/// when the stored reference still equals it.
pub(super) fn apply_completion(
    conn: &Connection,
    host_id: HostId,
    kind: ActionKind,
    expected_ref: Option<&str>,
    succeeded: bool,
    unlock_eligible_after_lock: bool,
) -> Result<bool> {
    let update = RefUpdate::on_completion(kind, succeeded, unlock_eligible_after_lock);

    let mut sets: Vec<String> = update
        .cleared_columns()
        .into_iter()
        .map(|c| format!("{} = NULL", c))
        .collect();
    let ts = now();
    let mut args: Vec<&dyn ToSql> = vec![&host_id];
    if update.mark_unlock_eligible {
        args.push(&ts);
        sets.push(format!("unlock_ref = ?{}", args.len()));
    }

    let mut sql = format!(
        "UPDATE host_mdm_actions SET {} WHERE host_id = ?1",
        sets.join(", ")
    );
    if let Some(expected) = &expected_ref {
        args.push(expected);
        sql.push_str(&format!(" AND {} = ?{}", kind.ref_column(), args.len()));
    }

    let changed = conn.execute(&sql, args.as_slice())? > 0;
    tracing::info!(
        host_id,
        action = %kind,
        succeeded,
        changed,
        "Applied device action result"
    );
    Ok(changed)
}
