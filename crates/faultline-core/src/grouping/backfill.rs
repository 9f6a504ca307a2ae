//! Reprocessing job: recompute fingerprints of stored notices and regroup
//! the ones that no longer match their problem.
//!
//! Needed after an app's api key changes or the fingerprint encoding is
//! bumped. Fingerprinting runs on a Rayon pool; regrouping goes through the
//! grouping index one notice at a time so it obeys the same get-or-create
//! rules as ingestion. Emptied problems are left in place.

use std::time::Instant;

use rayon::prelude::*;
use tracing::info;

use crate::errors::CoreResult;
use crate::grouping::fingerprint;
use crate::grouping::index::ProblemIndex;
use crate::models::StoredNotice;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub scanned: usize,
    pub moved: usize,
    pub problems_created: usize,
    pub elapsed_ms: u128,
}

fn compute_fingerprints(notices: &[StoredNotice], api_key: &str, workers: usize) -> Vec<String> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();
    match pool {
        Ok(pool) => pool.install(|| {
            notices
                .par_iter()
                .map(|stored| fingerprint::generate(&stored.notice, api_key))
                .collect()
        }),
        Err(_) => notices
            .iter()
            .map(|stored| fingerprint::generate(&stored.notice, api_key))
            .collect(),
    }
}

/// Regroup every notice of `app_id` under its current fingerprint.
pub fn refingerprint_app(
    index: &ProblemIndex,
    app_id: i64,
    workers: usize,
) -> CoreResult<BackfillStats> {
    let started = Instant::now();
    let db = index.database();
    let app = db.app(app_id)?;
    let notices = db.notices_for_app(app_id)?;
    let fingerprints = compute_fingerprints(&notices, &app.api_key, workers);

    let mut stats = BackfillStats {
        scanned: notices.len(),
        ..BackfillStats::default()
    };
    for (stored, fp) in notices.iter().zip(fingerprints) {
        if stored.fingerprint == fp {
            continue;
        }
        let regrouped = index.regroup(app_id, stored, &fp)?;
        if regrouped.moved {
            stats.moved += 1;
        }
        if regrouped.created {
            stats.problems_created += 1;
        }
    }
    stats.elapsed_ms = started.elapsed().as_millis();

    info!(
        app_id,
        scanned = stats.scanned,
        moved = stats.moved,
        problems_created = stats.problems_created,
        elapsed_ms = stats.elapsed_ms as u64,
        "refingerprint complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::grouping::ingest::ingest;
    use crate::models::{NewApp, Notice};
    use crate::store::database::test_support::temp_db;

    #[test]
    fn nothing_moves_when_fingerprints_still_match() {
        let (_dir, db) = temp_db();
        let app = db.create_app(&NewApp::new("shop", "key-1")).unwrap();
        let index = ProblemIndex::new(db.clone(), &CoreConfig::default());
        for class in ["A", "B", "A"] {
            ingest(&index, app.id, &Notice::new(class)).unwrap();
        }
        let stats = refingerprint_app(&index, app.id, 2).unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.moved, 0);
        assert_eq!(stats.problems_created, 0);
    }

    #[test]
    fn key_rotation_regroups_under_new_fingerprints() {
        let (_dir, db) = temp_db();
        let app = db.create_app(&NewApp::new("shop", "old-key")).unwrap();
        let index = ProblemIndex::new(db.clone(), &CoreConfig::default());
        for class in ["A", "B", "A"] {
            ingest(&index, app.id, &Notice::new(class)).unwrap();
        }
        let app = db.set_api_key(app.id, "new-key").unwrap();

        let stats = refingerprint_app(&index, app.id, 4).unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.moved, 3);
        assert_eq!(stats.problems_created, 2);

        let new_a = fingerprint::generate(&Notice::new("A"), &app.api_key);
        let problem = db.problem_by_fingerprint(app.id, &new_a).unwrap().unwrap();
        assert_eq!(problem.notices_count, 2);

        // Old problems survive, emptied.
        let problems = db.problems_for_app(app.id).unwrap();
        assert_eq!(problems.len(), 4);
        let total: i64 = problems.iter().map(|p| p.notices_count).sum();
        assert_eq!(total, 3);

        // A second pass is a no-op, and new notices join the moved problems.
        assert_eq!(refingerprint_app(&index, app.id, 1).unwrap().moved, 0);
        let next = ingest(&index, app.id, &Notice::new("A")).unwrap();
        assert_eq!(next.resolution.problem.id, problem.id);
    }

    #[test]
    fn unknown_app_is_not_found() {
        let (_dir, db) = temp_db();
        let index = ProblemIndex::new(db.clone(), &CoreConfig::default());
        assert!(refingerprint_app(&index, 1, 1).unwrap_err().is_not_found());
    }
}
