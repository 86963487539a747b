//! SQL migration definitions for the catalog database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: actors, assets, changesets, facts",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Configured actor instances; ids are stable once assigned
CREATE TABLE IF NOT EXISTS actors (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    kind        TEXT NOT NULL,
    plugin      TEXT NOT NULL,
    config_json TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Asset identities
CREATE TABLE IF NOT EXISTS assets (
    id          TEXT PRIMARY KEY,
    namespace   TEXT NOT NULL,
    external_id TEXT NOT NULL,
    locator     TEXT NOT NULL,
    created_by  INTEGER NOT NULL REFERENCES actors(id),
    created_in  INTEGER NOT NULL,
    UNIQUE(namespace, external_id)
);

CREATE INDEX IF NOT EXISTS idx_assets_created_by ON assets(created_by);

-- Changeset id allocation (single incrementing sequence)
CREATE TABLE IF NOT EXISTS changeset_seq (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    allocated_at TEXT NOT NULL
);

-- Versioning epochs
CREATE TABLE IF NOT EXISTS changesets (
    id          INTEGER PRIMARY KEY,
    status      TEXT NOT NULL,
    message     TEXT NOT NULL,
    actors_json TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

-- Append-only EAV fact rows
CREATE TABLE IF NOT EXISTS facts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id     TEXT NOT NULL REFERENCES assets(id),
    key          TEXT NOT NULL,
    actor_id     INTEGER NOT NULL,
    changeset_id INTEGER NOT NULL,
    value_kind   TEXT NOT NULL,
    value_text   TEXT NOT NULL,
    removed      INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_facts_asset ON facts(asset_id, changeset_id, id);
CREATE INDEX IF NOT EXISTS idx_facts_actor ON facts(actor_id, asset_id);
CREATE INDEX IF NOT EXISTS idx_facts_changeset ON facts(changeset_id);

CREATE TRIGGER IF NOT EXISTS facts_no_update BEFORE UPDATE ON facts BEGIN
    SELECT RAISE(ABORT, 'facts are append-only');
END;

CREATE TRIGGER IF NOT EXISTS facts_no_delete BEFORE DELETE ON facts BEGIN
    SELECT RAISE(ABORT, 'facts are append-only');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
