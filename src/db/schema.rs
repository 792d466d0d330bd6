//! Schema bootstrap and additive column reconciliation.
//!
//! Tables are created with `IF NOT EXISTS`; afterwards each table's
//! column list is compared against the expected set and any missing
//! column is added with its documented default. There are no
//! destructive migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageResult;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    codec TEXT NOT NULL,
    encoder TEXT NOT NULL,
    quality INTEGER NOT NULL,
    container TEXT NOT NULL DEFAULT 'mkv',
    resolution TEXT,
    framerate REAL,
    audio_strategy TEXT NOT NULL DEFAULT 'preserve_all',
    audio_codec TEXT NOT NULL DEFAULT 'aac',
    subtitle_strategy TEXT NOT NULL DEFAULT 'none',
    enable_filters INTEGER NOT NULL DEFAULT 0,
    chapter_markers INTEGER NOT NULL DEFAULT 1,
    hw_accel_enabled INTEGER NOT NULL DEFAULT 0,
    preset TEXT,
    two_pass INTEGER NOT NULL DEFAULT 0,
    custom_args TEXT,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS scan_roots (
    id INTEGER PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    profile_id INTEGER REFERENCES profiles(id),
    library_type TEXT NOT NULL DEFAULT 'custom',
    enabled INTEGER NOT NULL DEFAULT 1,
    recursive INTEGER NOT NULL DEFAULT 1,
    upscale_enabled INTEGER NOT NULL DEFAULT 0,
    upscale_trigger_below_height INTEGER,
    upscale_target_height INTEGER,
    upscale_upscaler TEXT,
    upscale_model TEXT,
    upscale_factor INTEGER
);

CREATE TABLE IF NOT EXISTS queue (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    root_id INTEGER,
    profile_id INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 50,
    current_specs TEXT,
    target_specs TEXT,
    file_size_bytes INTEGER NOT NULL DEFAULT 0,
    estimated_savings_bytes INTEGER NOT NULL DEFAULT 0,
    progress REAL NOT NULL DEFAULT 0.0,
    current_cpu_percent REAL NOT NULL DEFAULT 0.0,
    current_memory_mb REAL NOT NULL DEFAULT 0.0,
    permission_status TEXT,
    permission_message TEXT,
    paused_reason TEXT,
    error_message TEXT,
    upscale_plan TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    profile_name TEXT NOT NULL DEFAULT '',
    original_size_bytes INTEGER NOT NULL DEFAULT 0,
    new_size_bytes INTEGER NOT NULL DEFAULT 0,
    savings_bytes INTEGER NOT NULL DEFAULT 0,
    encoding_time_seconds INTEGER NOT NULL DEFAULT 0,
    codec TEXT NOT NULL DEFAULT '',
    container TEXT NOT NULL DEFAULT '',
    completed_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS folder_watches (
    id INTEGER PRIMARY KEY,
    path TEXT UNIQUE NOT NULL,
    profile_id INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    recursive INTEGER NOT NULL DEFAULT 1,
    auto_queue INTEGER NOT NULL DEFAULT 1,
    extensions TEXT NOT NULL DEFAULT '',
    last_check TEXT
);

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    kind TEXT NOT NULL,
    base_url TEXT NOT NULL,
    api_key_encrypted TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_tested TEXT,
    last_synced TEXT
);

CREATE TABLE IF NOT EXISTS schedule (
    id INTEGER PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0,
    days_of_week TEXT NOT NULL DEFAULT '0,1,2,3,4,5,6',
    start_time TEXT NOT NULL DEFAULT '22:00',
    end_time TEXT NOT NULL DEFAULT '06:00',
    use_host_rest_hours INTEGER NOT NULL DEFAULT 0,
    max_concurrent_jobs INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY,
    key TEXT UNIQUE NOT NULL,
    value TEXT,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_queue_status ON queue(status);
CREATE INDEX IF NOT EXISTS idx_queue_file_path ON queue(file_path);
";

/// Expected column sets per table; anything missing is added with the
/// given declaration. Keeping older columns around is harmless.
const EXPECTED_COLUMNS: &[(&str, &[(&str, &str)])] = &[
    (
        "profiles",
        &[
            ("audio_strategy", "TEXT NOT NULL DEFAULT 'preserve_all'"),
            ("subtitle_strategy", "TEXT NOT NULL DEFAULT 'none'"),
            ("enable_filters", "INTEGER NOT NULL DEFAULT 0"),
            ("chapter_markers", "INTEGER NOT NULL DEFAULT 1"),
            ("hw_accel_enabled", "INTEGER NOT NULL DEFAULT 0"),
            ("container", "TEXT NOT NULL DEFAULT 'mkv'"),
        ],
    ),
    (
        "scan_roots",
        &[
            ("library_type", "TEXT NOT NULL DEFAULT 'custom'"),
            ("upscale_enabled", "INTEGER NOT NULL DEFAULT 0"),
            ("upscale_trigger_below_height", "INTEGER"),
            ("upscale_target_height", "INTEGER"),
            ("upscale_upscaler", "TEXT"),
            ("upscale_model", "TEXT"),
            ("upscale_factor", "INTEGER"),
        ],
    ),
    (
        "queue",
        &[
            ("permission_message", "TEXT"),
            ("paused_reason", "TEXT"),
            ("upscale_plan", "TEXT"),
            ("current_cpu_percent", "REAL NOT NULL DEFAULT 0.0"),
            ("current_memory_mb", "REAL NOT NULL DEFAULT 0.0"),
        ],
    ),
    (
        "history",
        &[
            ("encoding_time_seconds", "INTEGER NOT NULL DEFAULT 0"),
            ("codec", "TEXT NOT NULL DEFAULT ''"),
            ("container", "TEXT NOT NULL DEFAULT ''"),
        ],
    ),
    (
        "schedule",
        &[
            ("use_host_rest_hours", "INTEGER NOT NULL DEFAULT 0"),
            ("max_concurrent_jobs", "INTEGER NOT NULL DEFAULT 1"),
        ],
    ),
    (
        "folder_watches",
        &[("auto_queue", "INTEGER NOT NULL DEFAULT 1"), ("last_check", "TEXT")],
    ),
];

pub(super) fn initialize(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(CREATE_TABLES)?;
    for (table, columns) in EXPECTED_COLUMNS {
        reconcile_columns(conn, table, columns)?;
    }
    seed_schedule(conn)?;
    Ok(())
}

fn reconcile_columns(
    conn: &Connection,
    table: &str,
    expected: &[(&str, &str)],
) -> StorageResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let present: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    for (name, decl) in expected {
        if !present.iter().any(|c| c == name) {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {name} {decl}"))?;
            info!(table, column = name, "added missing column");
        }
    }
    Ok(())
}

fn seed_schedule(conn: &Connection) -> StorageResult<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM schedule", [], |r| r.get(0))?;
    if count == 0 {
        conn.execute(
            "INSERT INTO schedule (enabled, days_of_week, start_time, end_time) \
             VALUES (0, '0,1,2,3,4,5,6', '22:00', '06:00')",
            [],
        )?;
    }
    Ok(())
}
