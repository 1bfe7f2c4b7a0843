/// SQL DDL for the strata-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS contexts (
    level TEXT NOT NULL,
    id TEXT NOT NULL,
    parent_id TEXT,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (level, id)
);

CREATE TABLE IF NOT EXISTS context_versions (
    level TEXT NOT NULL,
    context_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    version INTEGER NOT NULL,
    change_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    summary TEXT,
    author TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    is_milestone INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (level, context_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_contexts_parent ON contexts(level, parent_id);
CREATE INDEX IF NOT EXISTS idx_versions_timestamp ON context_versions(level, context_id, timestamp);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
