use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::HostqError;
use crate::state::now;

/// A command from the local MDM log, with its latest reported status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCommand {
    pub command_uuid: String,
    pub host_uuid: String,
    pub request_type: String,
    /// `None` until the device reports back.
    pub status: Option<String>,
}

pub(super) fn insert_command(
    conn: &Connection,
    command_uuid: &str,
    host_uuid: &str,
    request_type: &str,
    payload: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO mdm_commands (command_uuid, host_uuid, request_type, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![command_uuid, host_uuid, request_type, payload, now()],
    )?;
    Ok(())
}

pub(super) fn get_command(
    conn: &Connection,
    command_uuid: &str,
    host_uuid: &str,
) -> Result<StoredCommand> {
    conn.query_row(
        "SELECT c.command_uuid, c.host_uuid, c.request_type, r.status
         FROM mdm_commands c
         LEFT JOIN mdm_command_results r
            ON r.command_uuid = c.command_uuid AND r.host_uuid = c.host_uuid
         WHERE c.command_uuid = ?1 AND c.host_uuid = ?2",
        params![command_uuid, host_uuid],
        |row| {
            Ok(StoredCommand {
                command_uuid: row.get(0)?,
                host_uuid: row.get(1)?,
                request_type: row.get(2)?,
                status: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HostqError::not_found("MdmCommand", command_uuid).into())
}

pub(super) fn set_status(
    conn: &Connection,
    command_uuid: &str,
    host_uuid: &str,
    status: &str,
) -> Result<()> {
    get_command(conn, command_uuid, host_uuid)?;
    conn.execute(
        "INSERT INTO mdm_command_results (command_uuid, host_uuid, status, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(command_uuid, host_uuid) DO UPDATE SET
            status = excluded.status, updated_at = excluded.updated_at",
        params![command_uuid, host_uuid, status, now()],
    )?;
    Ok(())
}
