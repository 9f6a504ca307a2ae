//! SQLite schema DDL and migration framework.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::errors::{CoreError, CoreResult};
use crate::grouping::fingerprint::FINGERPRINT_ENCODING_VERSION;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Timestamp expression used for every `*_at` column.
pub const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Core DDL statements: 9 CREATE TABLE + 6 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (9) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS core_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS apps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        api_key TEXT NOT NULL UNIQUE,
        notify_on_errs INTEGER NOT NULL DEFAULT 1,
        email_at_notices TEXT NOT NULL DEFAULT '[]',
        issue_tracker TEXT,
        repository_url TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE
    );",
    "CREATE TABLE IF NOT EXISTS watchers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
        address TEXT NOT NULL,
        UNIQUE(app_id, address)
    );",
    "CREATE TABLE IF NOT EXISTS user_watchers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        UNIQUE(app_id, user_id)
    );",
    "CREATE TABLE IF NOT EXISTS problems (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
        fingerprint TEXT NOT NULL,
        error_class TEXT NOT NULL,
        message TEXT,
        environment TEXT NOT NULL,
        location TEXT,
        notices_count INTEGER NOT NULL DEFAULT 0,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT,
        issue_link TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        last_notice_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE(app_id, fingerprint)
    );",
    "CREATE TABLE IF NOT EXISTS notices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        problem_id INTEGER NOT NULL REFERENCES problems(id) ON DELETE CASCADE,
        fingerprint TEXT NOT NULL,
        error_class TEXT NOT NULL,
        message TEXT,
        component TEXT,
        action TEXT,
        environment_name TEXT,
        backtrace TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );",
    "CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        problem_id INTEGER NOT NULL REFERENCES problems(id) ON DELETE CASCADE,
        author TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );",
    // ── indexes (6) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_watchers_app ON watchers(app_id);",
    "CREATE INDEX IF NOT EXISTS idx_user_watchers_app ON user_watchers(app_id);",
    "CREATE INDEX IF NOT EXISTS idx_problems_app_last_notice ON problems(app_id, last_notice_at DESC);",
    "CREATE INDEX IF NOT EXISTS idx_notices_problem ON notices(problem_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_comments_problem ON comments(problem_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_problems_app_resolved ON problems(app_id, resolved);",
];

/// Create every table and index, then run pending migrations.
pub fn init_schema(conn: &Connection) -> CoreResult<()> {
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    migrate_schema(conn)
}

// ─── Migrations ─────────────────────────────────────────────────────────────

type MigrationStep = fn(&Connection) -> CoreResult<()>;

/// Entry `i` upgrades a database at version `i` to version `i + 1`.
const MIGRATIONS: [MigrationStep; SCHEMA_VERSION as usize] =
    [baseline, record_fingerprint_encoding];

/// Bring the stored schema version up to [`SCHEMA_VERSION`], one step per
/// SAVEPOINT. A failing step is rolled back alone, logged to
/// `migration_history`, and its error returned.
pub fn migrate_schema(conn: &Connection) -> CoreResult<()> {
    let current = schema_version(conn)?.max(0) as usize;
    for (from, step) in MIGRATIONS.iter().enumerate().skip(current) {
        apply_step(conn, from as i32, *step)?;
    }
    Ok(())
}

/// Stored schema version; 0 for a database that has never been migrated.
pub fn schema_version(conn: &Connection) -> CoreResult<i32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM core_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Database(format!("unreadable schema_version {raw:?}"))),
    }
}

fn apply_step(conn: &Connection, from: i32, step: MigrationStep) -> CoreResult<()> {
    let to = from + 1;
    conn.execute_batch("SAVEPOINT schema_step;")?;
    let applied = step(conn).and_then(|()| {
        conn.execute(
            "INSERT INTO core_meta(key, value) VALUES('schema_version', ?1) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![to.to_string()],
        )?;
        log_step(conn, from, to, None)
    });

    match applied {
        Ok(()) => {
            conn.execute_batch("RELEASE schema_step;")?;
            debug!(from, to, "schema migrated");
            Ok(())
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO schema_step; RELEASE schema_step;")?;
            if let Err(log_err) = log_step(conn, from, to, Some(&err.to_string())) {
                warn!(from, to, error = %log_err, "could not record failed migration");
            }
            Err(err)
        }
    }
}

fn log_step(conn: &Connection, from: i32, to: i32, error: Option<&str>) -> CoreResult<()> {
    let status = if error.is_some() { "failed" } else { "success" };
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        params![from, to, status, error],
    )?;
    Ok(())
}

/// v0 -> v1: the tables above are the baseline.
fn baseline(_conn: &Connection) -> CoreResult<()> {
    Ok(())
}

/// v1 -> v2: record the fingerprint encoding stored problems were keyed with,
/// so a later encoding bump can tell which apps need a backfill.
fn record_fingerprint_encoding(conn: &Connection) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO core_meta(key, value) VALUES('fingerprint_encoding', ?1) \
         ON CONFLICT(key) DO NOTHING;",
        params![FINGERPRINT_ENCODING_VERSION.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn schema_statement_counts() {
        // 9 tables + 6 indexes
        assert_eq!(SCHEMA_STATEMENTS.len(), 15);
    }

    #[test]
    fn migrate_fresh_database() {
        let conn = fresh();
        init_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let encoding: String = conn
            .query_row(
                "SELECT value FROM core_meta WHERE key = 'fingerprint_encoding';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(encoding, "1");
    }

    #[test]
    fn migrate_idempotent() {
        let conn = fresh();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }

    #[test]
    fn partially_migrated_database_resumes_at_next_step() {
        let conn = fresh();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn.execute(
            "INSERT INTO core_meta(key, value) VALUES('schema_version', '1');",
            [],
        )
        .unwrap();

        migrate_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let steps: Vec<(i32, i32)> = conn
            .prepare("SELECT from_version, to_version FROM migration_history ORDER BY id;")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(steps, vec![(1, 2)]);
    }

    #[test]
    fn unreadable_version_is_a_storage_error() {
        let conn = fresh();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn.execute(
            "INSERT INTO core_meta(key, value) VALUES('schema_version', 'two');",
            [],
        )
        .unwrap();
        assert!(matches!(
            migrate_schema(&conn).unwrap_err(),
            CoreError::Database(_)
        ));
    }

    #[test]
    fn problems_are_unique_per_app_and_fingerprint() {
        let conn = fresh();
        init_schema(&conn).unwrap();
        conn.execute("INSERT INTO apps(name, api_key) VALUES ('a', 'k');", [])
            .unwrap();
        let insert = "INSERT INTO problems(app_id, fingerprint, error_class, environment) \
                      VALUES (1, 'abc', 'E', 'production');";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
