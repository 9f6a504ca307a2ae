//! Problem grouping index: fingerprint → problem, get-or-create.
//!
//! Creation is guarded twice. Within one process, callers sharing an
//! `(app, fingerprint)` key serialize on a striped mutex. Across processes,
//! the `UNIQUE(app_id, fingerprint)` constraint plus an IMMEDIATE transaction
//! make the insert atomic; losing a race surfaces as `ConflictRetry`, which
//! is retried here and never returned to the caller.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::errors::{CoreError, CoreResult};
use crate::grouping::fingerprint::DEFAULT_ENVIRONMENT;
use crate::models::{Notice, Problem, StoredNotice};
use crate::store::database::{
    find_problem_by_fingerprint, insert_notice, require_app, require_problem, Database,
};
use crate::store::schema::NOW_SQL;

/// Base delay between conflict retries; grows linearly with the attempt.
const RETRY_BACKOFF_MS: u64 = 5;

/// How a notice landed on its problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupingOutcome {
    /// First notice for this fingerprint; the problem was just created.
    Created,
    /// Joined an existing unresolved problem.
    Attached,
    /// Joined a resolved problem, which is now unresolved again.
    Reopened,
}

impl GroupingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupingOutcome::Created => "created",
            GroupingOutcome::Attached => "attached",
            GroupingOutcome::Reopened => "reopened",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Resolution {
    /// The problem as it stands after the notice was attached.
    pub problem: Problem,
    pub notice_id: i64,
    pub outcome: GroupingOutcome,
}

/// Result of moving a stored notice onto another fingerprint's problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Regrouped {
    pub moved: bool,
    pub created: bool,
}

// ---------------------------------------------------------------------------
// Lock striping
// ---------------------------------------------------------------------------

struct LockStripes {
    stripes: Vec<Mutex<()>>,
}

impl LockStripes {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn index(&self, app_id: i64, fingerprint: &str) -> usize {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&app_id.to_le_bytes());
        hasher.update(fingerprint.as_bytes());
        hasher.finalize() as usize % self.stripes.len()
    }

    fn lock(&self, app_id: i64, fingerprint: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.index(app_id, fingerprint)].lock()
    }
}

// ---------------------------------------------------------------------------
// ProblemIndex
// ---------------------------------------------------------------------------

pub struct ProblemIndex {
    db: Database,
    stripes: LockStripes,
    retries: u32,
}

impl ProblemIndex {
    pub fn new(db: Database, config: &CoreConfig) -> Self {
        Self {
            db,
            stripes: LockStripes::new(config.lock_stripes),
            retries: config.grouping_retries,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Attach `notice` to the problem keyed by `(app_id, fingerprint)`,
    /// creating the problem if this is the first sighting.
    ///
    /// Fails with `NotFound` when the app does not exist; nothing is written
    /// in that case.
    pub fn resolve(
        &self,
        app_id: i64,
        fingerprint: &str,
        notice: &Notice,
    ) -> CoreResult<Resolution> {
        let resolution = self.with_retries(app_id, fingerprint, |conn| {
            resolve_once(conn, app_id, fingerprint, notice)
        })?;

        match resolution.outcome {
            GroupingOutcome::Created => info!(
                app_id,
                problem_id = resolution.problem.id,
                fingerprint,
                error_class = %notice.error_class,
                "created problem"
            ),
            GroupingOutcome::Reopened => info!(
                app_id,
                problem_id = resolution.problem.id,
                notices = resolution.problem.notices_count,
                "reopened resolved problem"
            ),
            GroupingOutcome::Attached => debug!(
                app_id,
                problem_id = resolution.problem.id,
                notices = resolution.problem.notices_count,
                "attached notice to problem"
            ),
        }
        Ok(resolution)
    }

    /// Move an already-stored notice onto the problem for `fingerprint`.
    pub(crate) fn regroup(
        &self,
        app_id: i64,
        stored: &StoredNotice,
        fingerprint: &str,
    ) -> CoreResult<Regrouped> {
        self.with_retries(app_id, fingerprint, |conn| {
            regroup_once(conn, app_id, stored, fingerprint)
        })
    }

    fn with_retries<T, F>(&self, app_id: i64, fingerprint: &str, mut op: F) -> CoreResult<T>
    where
        F: FnMut(&mut Connection) -> CoreResult<T>,
    {
        let _guard = self.stripes.lock(app_id, fingerprint);
        let mut conn = self.db.connect()?;
        let mut attempt: u32 = 0;
        loop {
            match op(&mut conn) {
                Err(CoreError::ConflictRetry(reason)) => {
                    attempt += 1;
                    if attempt > self.retries {
                        warn!(
                            app_id,
                            fingerprint,
                            attempts = attempt,
                            "giving up on conflicting get-or-create"
                        );
                        return Err(CoreError::Database(format!(
                            "get-or-create for {fingerprint} still conflicting after \
                             {attempt} attempts: {reason}"
                        )));
                    }
                    debug!(app_id, fingerprint, attempt, %reason, "retrying get-or-create");
                    std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64));
                }
                other => return other,
            }
        }
    }
}

fn begin(conn: &mut Connection) -> CoreResult<rusqlite::Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(CoreError::from_contended)
}

/// Find the problem for `(app_id, fingerprint)` or insert it, seeded from
/// `notice`. Returns the problem and whether it was created.
fn get_or_create(
    conn: &Connection,
    app_id: i64,
    fingerprint: &str,
    notice: &Notice,
) -> CoreResult<(Problem, bool)> {
    if let Some(problem) = find_problem_by_fingerprint(conn, app_id, fingerprint)? {
        return Ok((problem, false));
    }

    let environment = notice
        .environment_name
        .as_deref()
        .unwrap_or(DEFAULT_ENVIRONMENT);
    let inserted = conn
        .execute(
            "INSERT INTO problems \
             (app_id, fingerprint, error_class, message, environment, location) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(app_id, fingerprint) DO NOTHING;",
            params![
                app_id,
                fingerprint,
                notice.error_class,
                notice.message,
                environment,
                notice.location(),
            ],
        )
        .map_err(CoreError::from_contended)?;
    if inserted == 0 {
        return Err(CoreError::ConflictRetry(format!(
            "problem {fingerprint} created concurrently"
        )));
    }
    let problem = require_problem(conn, conn.last_insert_rowid())?;
    Ok((problem, true))
}

fn resolve_once(
    conn: &mut Connection,
    app_id: i64,
    fingerprint: &str,
    notice: &Notice,
) -> CoreResult<Resolution> {
    let tx = begin(conn)?;
    require_app(&tx, app_id)?;

    let (problem, created) = get_or_create(&tx, app_id, fingerprint, notice)?;
    let was_resolved = problem.resolved;
    let notice_id = insert_notice(&tx, problem.id, fingerprint, notice)?;
    tx.execute(
        &format!(
            "UPDATE problems SET notices_count = notices_count + 1, \
             last_notice_at = {NOW_SQL}, message = COALESCE(?2, message), \
             resolved = 0, resolved_at = NULL \
             WHERE id = ?1;"
        ),
        params![problem.id, notice.message],
    )?;
    let problem = require_problem(&tx, problem.id)?;
    tx.commit().map_err(CoreError::from_contended)?;

    let outcome = if created {
        GroupingOutcome::Created
    } else if was_resolved {
        GroupingOutcome::Reopened
    } else {
        GroupingOutcome::Attached
    };
    Ok(Resolution {
        problem,
        notice_id,
        outcome,
    })
}

fn regroup_once(
    conn: &mut Connection,
    app_id: i64,
    stored: &StoredNotice,
    fingerprint: &str,
) -> CoreResult<Regrouped> {
    let tx = begin(conn)?;
    require_app(&tx, app_id)?;

    // Another writer may have moved or deleted the notice since it was read.
    let still_in_place: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM notices WHERE id = ?1 AND problem_id = ?2);",
        params![stored.id, stored.problem_id],
        |row| row.get(0),
    )?;
    if !still_in_place {
        return Ok(Regrouped {
            moved: false,
            created: false,
        });
    }

    let (target, created) = get_or_create(&tx, app_id, fingerprint, &stored.notice)?;
    let moved = tx.execute(
        "UPDATE notices SET problem_id = ?2, fingerprint = ?3 \
         WHERE id = ?1 AND problem_id = ?4;",
        params![stored.id, target.id, fingerprint, stored.problem_id],
    )?;
    if moved == 1 {
        tx.execute(
            "UPDATE problems SET notices_count = MAX(notices_count - 1, 0) WHERE id = ?1;",
            params![stored.problem_id],
        )?;
        tx.execute(
            "UPDATE problems SET notices_count = notices_count + 1, \
             last_notice_at = MAX(last_notice_at, ?2) WHERE id = ?1;",
            params![target.id, stored.created_at],
        )?;
    }
    tx.commit().map_err(CoreError::from_contended)?;
    Ok(Regrouped {
        moved: moved == 1,
        created: created && moved == 1,
    })
}
