//! Database migrations
//!
//! Versioned schema for the operation log, keyframes, sync cursors, remotes
//! and the document view. Each migration is applied in its own transaction and
//! recorded in `schema_version`.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::errors::StoreResult;
use super::types::now_utc_ms;

pub const CURRENT_SCHEMA_VERSION: i32 = 3;

pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Operation log and keyframes",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS operations (
                    ordinal INTEGER PRIMARY KEY AUTOINCREMENT,   -- global write position
                    op_id TEXT NOT NULL UNIQUE,
                    prev_op_id TEXT,
                    document_id TEXT NOT NULL,
                    document_type TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    op_index INTEGER NOT NULL,
                    skip INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    action TEXT NOT NULL,                         -- JSON
                    timestamp_utc_ms INTEGER NOT NULL,
                    resulting_state TEXT,                         -- JSON
                    error TEXT,
                    write_timestamp_utc_ms INTEGER NOT NULL,
                    UNIQUE (document_id, scope, branch, op_index)
                );

                CREATE INDEX IF NOT EXISTS idx_operations_stream_ts
                    ON operations(document_id, scope, branch, timestamp_utc_ms);
                CREATE INDEX IF NOT EXISTS idx_operations_document
                    ON operations(document_id, branch);

                CREATE TABLE IF NOT EXISTS keyframes (
                    document_id TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    revision INTEGER NOT NULL,
                    document_type TEXT NOT NULL,
                    document TEXT NOT NULL,                       -- JSON snapshot
                    created_at_utc_ms INTEGER NOT NULL,
                    PRIMARY KEY (document_id, scope, branch, revision)
                );
            "#,
        },
        Migration {
            version: 2,
            description: "Sync cursors and remotes",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS sync_cursors (
                    remote_name TEXT NOT NULL,
                    cursor_type TEXT NOT NULL CHECK(cursor_type IN ('inbox', 'outbox')),
                    cursor_ordinal INTEGER NOT NULL,
                    last_synced_at_utc_ms INTEGER NOT NULL,
                    PRIMARY KEY (remote_name, cursor_type)
                );

                CREATE TABLE IF NOT EXISTS sync_remotes (
                    name TEXT PRIMARY KEY,
                    id TEXT NOT NULL UNIQUE,
                    collection_id TEXT NOT NULL,
                    channel_config TEXT NOT NULL,                 -- JSON
                    filter TEXT NOT NULL,                         -- JSON
                    options TEXT NOT NULL,                        -- JSON
                    status TEXT NOT NULL,                         -- JSON
                    created_at_utc_ms INTEGER NOT NULL,
                    updated_at_utc_ms INTEGER NOT NULL
                );
            "#,
        },
        Migration {
            version: 3,
            description: "Document view",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS document_snapshots (
                    document_id TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    document_type TEXT NOT NULL,
                    content TEXT NOT NULL,                        -- JSON scope state
                    last_operation_index INTEGER NOT NULL,
                    last_operation_hash TEXT NOT NULL,
                    created_at_utc_ms INTEGER NOT NULL,
                    last_updated_at_utc_ms INTEGER NOT NULL,
                    snapshot_version INTEGER NOT NULL,
                    deleted INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (document_id, scope, branch)
                );

                CREATE INDEX IF NOT EXISTS idx_snapshots_type
                    ON document_snapshots(document_type, deleted);

                CREATE TABLE IF NOT EXISTS view_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    last_ordinal INTEGER NOT NULL
                );
            "#,
        },
    ]
}

fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> StoreResult<i32> {
    let conn = pool.get()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> StoreResult<()> {
    let current_version = get_current_version(pool)?;

    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;

    for migration in pending {
        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, now_utc_ms() as i64],
        )?;

        tx.commit()?;

        info!(version = migration.version, "Applied migration: {}", migration.description);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_pool() -> Pool<SqliteConnectionManager> {
        let manager = SqliteConnectionManager::memory();
        Pool::builder().max_size(1).build(manager).expect("Failed to create pool")
    }

    #[test]
    fn test_initial_migration() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let conn = pool.get().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in ["operations", "keyframes", "sync_cursors", "sync_remotes", "document_snapshots", "view_state"] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_idempotent_migrations() {
        let pool = setup_test_pool();

        migrate(&pool).expect("First migration failed");
        migrate(&pool).expect("Second migration failed");

        assert_eq!(get_current_version(&pool).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_stream_index_is_unique() {
        let pool = setup_test_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        let insert = "INSERT INTO operations (op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, write_timestamp_utc_ms)
                      VALUES (?, 'd', 't', 'global', 'main', 0, 0, '', '{}', 0, 0)";
        conn.execute(insert, params!["a"]).unwrap();
        assert!(conn.execute(insert, params!["b"]).is_err());
    }
}
