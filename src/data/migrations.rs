//! Database migrations using a versioned migration pattern.
//!
//! Each migration runs exactly once and is tracked in the `schema_migrations` table.
//! Migrations are applied in order by version number.

use rusqlite::{params, Connection};

/// A database migration with a version number, name, and SQL to execute.
pub struct Migration {
    /// Unique version number (migrations run in order)
    pub version: i64,
    /// Human-readable name for the migration
    pub name: &'static str,
    /// SQL to execute (can be multiple statements)
    pub sql: &'static str,
}

/// All migrations in order. New migrations should be added at the end.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_targets_table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS targets (
                file TEXT NOT NULL,
                cursor_sequence_id INTEGER,
                cursor_line INTEGER,
                uploaded_at TEXT NOT NULL,
                PRIMARY KEY (file)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "create_active_table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS active (
                singleton_id INTEGER CHECK (singleton_id = 1),
                file TEXT,
                PRIMARY KEY (singleton_id),
                FOREIGN KEY (file) REFERENCES targets(file) ON DELETE SET NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "create_timeline_table",
        sql: r#"
            CREATE TABLE IF NOT EXISTS timeline (
                file TEXT NOT NULL,
                sequence_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                target_name TEXT NOT NULL,
                unit TEXT NOT NULL,
                return_value TEXT,
                frame_id INTEGER NOT NULL,
                function TEXT,
                line_number INTEGER NOT NULL,
                source_text TEXT NOT NULL,
                global_diff TEXT NOT NULL,
                local_diff TEXT NOT NULL,
                traceback TEXT,
                error TEXT,
                PRIMARY KEY (file, sequence_id),
                FOREIGN KEY (file) REFERENCES targets(file) ON DELETE CASCADE
            );
        "#,
    },
];

/// Create the schema_migrations table if it doesn't exist.
fn ensure_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get the set of already-applied migration versions.
fn get_applied_versions(conn: &Connection) -> rusqlite::Result<std::collections::HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<std::collections::HashSet<i64>>>()?;
    Ok(versions)
}

/// Run all pending migrations.
///
/// The server, watcher and traced child may all open the database first;
/// the whole pass runs inside one immediate transaction so only one of them
/// applies any given migration.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(conn)?;

    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let applied = get_applied_versions(&tx)?;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = tx.execute_batch(migration.sql) {
            tracing::error!(
                version = migration.version,
                name = migration.name,
                error = %e,
                "Migration failed"
            );
            return Err(e);
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now],
        )?;
    }

    tx.commit()
}
