/// SQL DDL for the hostq database.
///
/// Timestamps are RFC 3339 strings with microsecond precision in UTC, so
/// lexical and chronological order agree.

pub const SCHEMA_VERSION: i32 = 2;

/// Version 2: manual unlock requests are tracked apart from `unlock_ref`.
pub const ADD_UNLOCK_REQUESTED_AT_SQL: &str =
    "ALTER TABLE host_mdm_actions ADD COLUMN unlock_requested_at TEXT";

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- Managed hosts
CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    platform TEXT NOT NULL,
    team_id INTEGER,
    has_agent INTEGER NOT NULL DEFAULT 1,
    scripts_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

-- Content-addressed script bodies
CREATE TABLE IF NOT EXISTS script_contents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum TEXT NOT NULL UNIQUE,
    contents TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Saved scripts; scope_key is 0 for global scripts
CREATE TABLE IF NOT EXISTS scripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER,
    scope_key INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL,
    script_content_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(scope_key, name),
    FOREIGN KEY (script_content_id) REFERENCES script_contents(id)
);

-- Named automations that run a saved script (e.g. on policy failure)
CREATE TABLE IF NOT EXISTS script_automations (
    name TEXT PRIMARY KEY,
    script_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (script_id) REFERENCES scripts(id)
);

-- Per-host activity queue; at most one activated row per host
CREATE TABLE IF NOT EXISTS upcoming_activities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL,
    execution_id TEXT NOT NULL UNIQUE,
    activity_type TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    activated_at TEXT
);

-- Script columns of script and uninstall activities
CREATE TABLE IF NOT EXISTS script_upcoming_activities (
    upcoming_activity_id INTEGER PRIMARY KEY,
    script_id INTEGER,
    script_content_id INTEGER NOT NULL,
    sync_request INTEGER NOT NULL DEFAULT 0,
    requester TEXT,
    FOREIGN KEY (upcoming_activity_id) REFERENCES upcoming_activities(id) ON DELETE CASCADE,
    FOREIGN KEY (script_id) REFERENCES scripts(id) ON DELETE SET NULL,
    FOREIGN KEY (script_content_id) REFERENCES script_contents(id)
);

-- Script results; placeholders (exit_code NULL) exist once activated
CREATE TABLE IF NOT EXISTS host_script_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL,
    execution_id TEXT NOT NULL UNIQUE,
    script_id INTEGER,
    script_content_id INTEGER NOT NULL,
    activity_type TEXT NOT NULL DEFAULT 'script',
    output TEXT NOT NULL DEFAULT '',
    runtime INTEGER NOT NULL DEFAULT 0,
    exit_code INTEGER,
    timed_out INTEGER NOT NULL DEFAULT 0,
    canceled INTEGER NOT NULL DEFAULT 0,
    sync_request INTEGER NOT NULL DEFAULT 0,
    requester TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (script_id) REFERENCES scripts(id) ON DELETE SET NULL,
    FOREIGN KEY (script_content_id) REFERENCES script_contents(id)
);

-- Pending lock/unlock/wipe references per host
CREATE TABLE IF NOT EXISTS host_mdm_actions (
    host_id INTEGER PRIMARY KEY,
    lock_ref TEXT,
    unlock_ref TEXT,
    wipe_ref TEXT,
    unlock_pin TEXT,
    unlock_requested_at TEXT,
    platform TEXT NOT NULL DEFAULT ''
);

-- Batch runs of a saved script
CREATE TABLE IF NOT EXISTS batch_script_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL UNIQUE,
    script_id INTEGER,
    team_id INTEGER,
    requester TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (script_id) REFERENCES scripts(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS batch_script_execution_host_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_execution_id TEXT NOT NULL,
    host_id INTEGER NOT NULL,
    host_execution_id TEXT,
    error TEXT,
    UNIQUE(batch_execution_id, host_id),
    FOREIGN KEY (batch_execution_id) REFERENCES batch_script_executions(execution_id) ON DELETE CASCADE
);

-- Locally recorded MDM commands and their results
CREATE TABLE IF NOT EXISTS mdm_commands (
    command_uuid TEXT PRIMARY KEY,
    host_uuid TEXT NOT NULL,
    request_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mdm_command_results (
    command_uuid TEXT NOT NULL,
    host_uuid TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (command_uuid, host_uuid),
    FOREIGN KEY (command_uuid) REFERENCES mdm_commands(command_uuid) ON DELETE CASCADE
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS idx_upcoming_one_activated
    ON upcoming_activities(host_id) WHERE activated_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_upcoming_host_order
    ON upcoming_activities(host_id, priority DESC, created_at, id);
CREATE INDEX IF NOT EXISTS idx_script_upcoming_script
    ON script_upcoming_activities(script_id);
CREATE INDEX IF NOT EXISTS idx_hsr_host ON host_script_results(host_id, created_at);
CREATE INDEX IF NOT EXISTS idx_hsr_script ON host_script_results(script_id);
CREATE INDEX IF NOT EXISTS idx_scripts_content ON scripts(script_content_id);
CREATE INDEX IF NOT EXISTS idx_batch_host_results_host
    ON batch_script_execution_host_results(host_execution_id);
";
