//! SQLite storage layer.
//!
//! Every public method opens its own connection, so a `Database` is just a
//! resolved path plus connection settings and can be cloned freely across
//! threads. Lower-level `find_*` helpers take a `&Connection` so grouping can
//! run them inside its own transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::CoreConfig;
use crate::errors::{CoreError, CoreResult};
use crate::models::{
    App, Backtrace, Comment, IssueTracker, NewApp, Notice, Problem, StoredNotice, User,
    UserWatcher, Watcher,
};
use crate::notify::watchers::normalize_address;
use crate::store::schema::{self, NOW_SQL};

/// Expand a leading `~` to the user's home directory.
fn home_relative(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => Path::new(&home).join(rest),
        _ => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const APP_COLUMNS: &str = "id, name, api_key, notify_on_errs, email_at_notices, \
                           issue_tracker, repository_url, created_at";

const PROBLEM_COLUMNS: &str = "id, app_id, fingerprint, error_class, message, environment, \
                               location, notices_count, resolved, resolved_at, issue_link, \
                               created_at, last_notice_at";

const NOTICE_COLUMNS: &str = "n.id, n.problem_id, n.fingerprint, n.error_class, n.message, \
                              n.component, n.action, n.environment_name, n.backtrace, \
                              n.created_at";

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        api_key: row.get(2)?,
        notify_on_errs: row.get(3)?,
        email_at_notices: json_column::<Vec<i64>>(row, 4)?.unwrap_or_default(),
        issue_tracker: json_column::<IssueTracker>(row, 5)?,
        repository_url: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn problem_from_row(row: &Row<'_>) -> rusqlite::Result<Problem> {
    Ok(Problem {
        id: row.get(0)?,
        app_id: row.get(1)?,
        fingerprint: row.get(2)?,
        error_class: row.get(3)?,
        message: row.get(4)?,
        environment: row.get(5)?,
        location: row.get(6)?,
        notices_count: row.get(7)?,
        resolved: row.get(8)?,
        resolved_at: row.get(9)?,
        issue_link: row.get(10)?,
        created_at: row.get(11)?,
        last_notice_at: row.get(12)?,
    })
}

fn notice_from_row(row: &Row<'_>) -> rusqlite::Result<StoredNotice> {
    Ok(StoredNotice {
        id: row.get(0)?,
        problem_id: row.get(1)?,
        fingerprint: row.get(2)?,
        notice: Notice {
            error_class: row.get(3)?,
            message: row.get(4)?,
            component: row.get(5)?,
            action: row.get(6)?,
            environment_name: row.get(7)?,
            backtrace: json_column::<Backtrace>(row, 8)?,
        },
        created_at: row.get(9)?,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        problem_id: row.get(1)?,
        author: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

pub(crate) fn find_app(conn: &Connection, app_id: i64) -> CoreResult<Option<App>> {
    let app = conn
        .query_row(
            &format!("SELECT {APP_COLUMNS} FROM apps WHERE id = ?1;"),
            params![app_id],
            app_from_row,
        )
        .optional()?;
    Ok(app)
}

pub(crate) fn require_app(conn: &Connection, app_id: i64) -> CoreResult<App> {
    find_app(conn, app_id)?.ok_or_else(|| CoreError::NotFound(format!("app {app_id}")))
}

pub(crate) fn find_problem(conn: &Connection, problem_id: i64) -> CoreResult<Option<Problem>> {
    let problem = conn
        .query_row(
            &format!("SELECT {PROBLEM_COLUMNS} FROM problems WHERE id = ?1;"),
            params![problem_id],
            problem_from_row,
        )
        .optional()?;
    Ok(problem)
}

pub(crate) fn require_problem(conn: &Connection, problem_id: i64) -> CoreResult<Problem> {
    find_problem(conn, problem_id)?
        .ok_or_else(|| CoreError::NotFound(format!("problem {problem_id}")))
}

pub(crate) fn find_problem_by_fingerprint(
    conn: &Connection,
    app_id: i64,
    fingerprint: &str,
) -> CoreResult<Option<Problem>> {
    let problem = conn
        .query_row(
            &format!(
                "SELECT {PROBLEM_COLUMNS} FROM problems WHERE app_id = ?1 AND fingerprint = ?2;"
            ),
            params![app_id, fingerprint],
            problem_from_row,
        )
        .optional()?;
    Ok(problem)
}

/// Insert a notice row under `problem_id` and return its id.
pub(crate) fn insert_notice(
    conn: &Connection,
    problem_id: i64,
    fingerprint: &str,
    notice: &Notice,
) -> CoreResult<i64> {
    let backtrace = notice
        .backtrace
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO notices \
         (problem_id, fingerprint, error_class, message, component, action, \
          environment_name, backtrace) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            problem_id,
            fingerprint,
            notice.error_class,
            notice.message,
            notice.component,
            notice.action,
            notice.environment_name,
            backtrace,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn notices_for_app(conn: &Connection, app_id: i64) -> CoreResult<Vec<StoredNotice>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {NOTICE_COLUMNS} FROM notices n \
         JOIN problems p ON p.id = n.problem_id \
         WHERE p.app_id = ?1 ORDER BY n.id;"
    ))?;
    let rows = stmt.query_map(params![app_id], notice_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite record store for apps, watchers, problems, notices, and comments.
#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
    busy_timeout: Duration,
    default_email_at_notices: Vec<i64>,
}

impl Database {
    /// Resolve `db_path` (expanding `~`, making it absolute) and create its
    /// parent directories. Does not touch the schema.
    pub fn open(db_path: impl AsRef<Path>, config: &CoreConfig) -> CoreResult<Self> {
        let expanded = home_relative(db_path.as_ref());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db_path: resolved,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            default_email_at_notices: config.default_email_at_notices.clone(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new connection with foreign keys enforced and the configured
    /// busy timeout.
    pub fn connect(&self) -> CoreResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Switch to WAL, create all tables and indexes, and run migrations.
    pub fn init_schema(&self) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        schema::init_schema(&conn)
    }

    // -----------------------------------------------------------------------
    // Apps
    // -----------------------------------------------------------------------

    pub fn create_app(&self, new_app: &NewApp) -> CoreResult<App> {
        if new_app.api_key.trim().is_empty() {
            return Err(CoreError::Validation("app api key must not be blank".into()));
        }
        let thresholds = new_app
            .email_at_notices
            .clone()
            .unwrap_or_else(|| self.default_email_at_notices.clone());
        if thresholds.iter().any(|&t| t <= 0) {
            return Err(CoreError::Validation(
                "email_at_notices entries must be positive".into(),
            ));
        }
        let tracker = new_app
            .issue_tracker
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO apps \
             (name, api_key, notify_on_errs, email_at_notices, issue_tracker, repository_url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                new_app.name,
                new_app.api_key,
                new_app.notify_on_errs,
                serde_json::to_string(&thresholds)?,
                tracker,
                new_app.repository_url,
            ],
        )?;
        require_app(&conn, conn.last_insert_rowid())
    }

    pub fn app(&self, app_id: i64) -> CoreResult<App> {
        let conn = self.connect()?;
        require_app(&conn, app_id)
    }

    pub fn set_notify_on_errs(&self, app_id: i64, enabled: bool) -> CoreResult<App> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE apps SET notify_on_errs = ?2 WHERE id = ?1;",
            params![app_id, enabled],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("app {app_id}")));
        }
        require_app(&conn, app_id)
    }

    /// Replace an app's api key. Stored problems keep their fingerprints
    /// until [`crate::grouping::backfill::refingerprint_app`] regroups them.
    pub fn set_api_key(&self, app_id: i64, api_key: &str) -> CoreResult<App> {
        if api_key.trim().is_empty() {
            return Err(CoreError::Validation("app api key must not be blank".into()));
        }
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE apps SET api_key = ?2 WHERE id = ?1;",
            params![app_id, api_key],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("app {app_id}")));
        }
        require_app(&conn, app_id)
    }

    pub fn set_issue_tracker(
        &self,
        app_id: i64,
        tracker: Option<&IssueTracker>,
    ) -> CoreResult<App> {
        let encoded = tracker.map(serde_json::to_string).transpose()?;
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE apps SET issue_tracker = ?2 WHERE id = ?1;",
            params![app_id, encoded],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("app {app_id}")));
        }
        require_app(&conn, app_id)
    }

    pub fn set_email_at_notices(&self, app_id: i64, thresholds: &[i64]) -> CoreResult<App> {
        if thresholds.iter().any(|&t| t <= 0) {
            return Err(CoreError::Validation(
                "email_at_notices entries must be positive".into(),
            ));
        }
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE apps SET email_at_notices = ?2 WHERE id = ?1;",
            params![app_id, serde_json::to_string(thresholds)?],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("app {app_id}")));
        }
        require_app(&conn, app_id)
    }

    // -----------------------------------------------------------------------
    // Users and watchers
    // -----------------------------------------------------------------------

    pub fn create_user(&self, email: &str) -> CoreResult<User> {
        let email = normalize_address(email)?;
        let conn = self.connect()?;
        conn.execute("INSERT INTO users(email) VALUES (?1);", params![email])?;
        Ok(User {
            id: conn.last_insert_rowid(),
            email,
        })
    }

    /// Subscribe a standalone address. Re-adding an existing address returns
    /// the existing watcher.
    pub fn add_watcher(&self, app_id: i64, address: &str) -> CoreResult<Watcher> {
        let address = normalize_address(address)?;
        let conn = self.connect()?;
        require_app(&conn, app_id)?;
        conn.execute(
            "INSERT INTO watchers(app_id, address) VALUES (?1, ?2) \
             ON CONFLICT(app_id, address) DO NOTHING;",
            params![app_id, address],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM watchers WHERE app_id = ?1 AND address = ?2;",
            params![app_id, address],
            |row| row.get(0),
        )?;
        Ok(Watcher {
            id,
            app_id,
            address,
        })
    }

    pub fn remove_watcher(&self, watcher_id: i64) -> CoreResult<()> {
        let conn = self.connect()?;
        let changed = conn.execute("DELETE FROM watchers WHERE id = ?1;", params![watcher_id])?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("watcher {watcher_id}")));
        }
        Ok(())
    }

    pub fn watchers(&self, app_id: i64) -> CoreResult<Vec<Watcher>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id, app_id, address FROM watchers WHERE app_id = ?1 ORDER BY id;")?;
        let rows = stmt.query_map(params![app_id], |row| {
            Ok(Watcher {
                id: row.get(0)?,
                app_id: row.get(1)?,
                address: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn add_user_watcher(&self, app_id: i64, user_id: i64) -> CoreResult<UserWatcher> {
        let conn = self.connect()?;
        require_app(&conn, app_id)?;
        let user_exists = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1;", params![user_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !user_exists {
            return Err(CoreError::NotFound(format!("user {user_id}")));
        }
        conn.execute(
            "INSERT INTO user_watchers(app_id, user_id) VALUES (?1, ?2) \
             ON CONFLICT(app_id, user_id) DO NOTHING;",
            params![app_id, user_id],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM user_watchers WHERE app_id = ?1 AND user_id = ?2;",
            params![app_id, user_id],
            |row| row.get(0),
        )?;
        Ok(UserWatcher {
            id,
            app_id,
            user_id,
        })
    }

    pub fn remove_user_watcher(&self, user_watcher_id: i64) -> CoreResult<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM user_watchers WHERE id = ?1;",
            params![user_watcher_id],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!(
                "user watcher {user_watcher_id}"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Problems
    // -----------------------------------------------------------------------

    pub fn problem(&self, problem_id: i64) -> CoreResult<Problem> {
        let conn = self.connect()?;
        require_problem(&conn, problem_id)
    }

    pub fn problem_by_fingerprint(
        &self,
        app_id: i64,
        fingerprint: &str,
    ) -> CoreResult<Option<Problem>> {
        let conn = self.connect()?;
        find_problem_by_fingerprint(&conn, app_id, fingerprint)
    }

    /// Problems of an app, most recently seen first.
    pub fn problems_for_app(&self, app_id: i64) -> CoreResult<Vec<Problem>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROBLEM_COLUMNS} FROM problems WHERE app_id = ?1 \
             ORDER BY last_notice_at DESC, id DESC;"
        ))?;
        let rows = stmt.query_map(params![app_id], problem_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn notices_for_problem(&self, problem_id: i64) -> CoreResult<Vec<StoredNotice>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTICE_COLUMNS} FROM notices n WHERE n.problem_id = ?1 ORDER BY n.id;"
        ))?;
        let rows = stmt.query_map(params![problem_id], notice_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn notices_for_app(&self, app_id: i64) -> CoreResult<Vec<StoredNotice>> {
        let conn = self.connect()?;
        notices_for_app(&conn, app_id)
    }

    pub fn mark_resolved(&self, problem_id: i64) -> CoreResult<Problem> {
        self.update_problem(
            problem_id,
            &format!(
                "UPDATE problems SET resolved = 1, resolved_at = {NOW_SQL} \
                 WHERE id = ?1 AND resolved = 0;"
            ),
        )
    }

    pub fn mark_unresolved(&self, problem_id: i64) -> CoreResult<Problem> {
        self.update_problem(
            problem_id,
            "UPDATE problems SET resolved = 0, resolved_at = NULL WHERE id = ?1;",
        )
    }

    /// Attach (or with `None`, clear) the tracker issue a problem was filed as.
    pub fn link_issue(&self, problem_id: i64, issue_link: Option<&str>) -> CoreResult<Problem> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE problems SET issue_link = ?2 WHERE id = ?1;",
            params![problem_id, issue_link],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("problem {problem_id}")));
        }
        require_problem(&conn, problem_id)
    }

    /// Explicitly delete a problem together with its notices and comments.
    pub fn delete_problem(&self, problem_id: i64) -> CoreResult<()> {
        let conn = self.connect()?;
        let changed = conn.execute("DELETE FROM problems WHERE id = ?1;", params![problem_id])?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("problem {problem_id}")));
        }
        Ok(())
    }

    fn update_problem(&self, problem_id: i64, sql: &str) -> CoreResult<Problem> {
        let conn = self.connect()?;
        conn.execute(sql, params![problem_id])?;
        require_problem(&conn, problem_id)
    }

    // -----------------------------------------------------------------------
    // Comments
    // -----------------------------------------------------------------------

    pub(crate) fn insert_comment(
        &self,
        problem_id: i64,
        author: &str,
        body: &str,
    ) -> CoreResult<(Comment, Problem)> {
        let conn = self.connect()?;
        let problem = require_problem(&conn, problem_id)?;
        conn.execute(
            "INSERT INTO comments(problem_id, author, body) VALUES (?1, ?2, ?3);",
            params![problem_id, author, body],
        )?;
        let comment = conn.query_row(
            "SELECT id, problem_id, author, body, created_at FROM comments WHERE id = ?1;",
            params![conn.last_insert_rowid()],
            comment_from_row,
        )?;
        Ok((comment, problem))
    }

    pub fn comments_for_problem(&self, problem_id: i64) -> CoreResult<Vec<Comment>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, problem_id, author, body, created_at FROM comments \
             WHERE problem_id = ?1 ORDER BY id;",
        )?;
        let rows = stmt.query_map(params![problem_id], comment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
