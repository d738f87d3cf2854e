/// SQL DDL for the identity store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

// Only the presence columns are owned by this service; the rest of an
// account lives with the account system.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id TEXT NOT NULL,
    kind TEXT NOT NULL,
    display_name TEXT NOT NULL,
    session_ref TEXT,
    status TEXT NOT NULL DEFAULT 'offline',
    last_active_at TEXT,
    presence_generation INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);

CREATE INDEX IF NOT EXISTS idx_identities_status ON identities(status);
CREATE INDEX IF NOT EXISTS idx_identities_session ON identities(session_ref);

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
