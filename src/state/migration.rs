use anyhow::Result;
use rusqlite::Connection;

use super::schema;

/// Bring a database up to [`schema::SCHEMA_VERSION`]. Safe to call on every open.
pub fn check_and_migrate(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)?;

    if !table_exists {
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![schema::SCHEMA_VERSION, super::now(), "Initial schema"],
        )?;
        tracing::debug!(version = schema::SCHEMA_VERSION, "Created hostq schema");
        return Ok(());
    }

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < schema::SCHEMA_VERSION {
        apply_migrations(conn, current_version)?;
    } else if current_version > schema::SCHEMA_VERSION {
        anyhow::bail!(
            "database schema version {} is newer than this build supports ({})",
            current_version,
            schema::SCHEMA_VERSION
        );
    }

    Ok(())
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    if from_version < 1 {
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
        record_version(conn, 1, "Initial schema")?;
    } else if from_version < 2 {
        conn.execute_batch(schema::ADD_UNLOCK_REQUESTED_AT_SQL)?;
    }

    if from_version < 2 {
        record_version(conn, 2, "Track manual unlock requests")?;
    }

    tracing::info!(
        from = from_version,
        to = schema::SCHEMA_VERSION,
        "Migrated hostq schema"
    );
    Ok(())
}

fn record_version(conn: &Connection, version: i32, description: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, super::now(), description],
    )?;
    Ok(())
}
