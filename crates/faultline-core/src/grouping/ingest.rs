//! Ingestion: validate, fingerprint, group, decide on notification.

use crate::errors::CoreResult;
use crate::grouping::fingerprint;
use crate::grouping::index::{ProblemIndex, Resolution};
use crate::models::Notice;
use crate::notify::events::{occurrence_decision, NotificationDecision};

#[derive(Clone, Debug)]
pub struct IngestOutcome {
    pub fingerprint: String,
    pub resolution: Resolution,
    pub notification: NotificationDecision,
}

/// Record `notice` for `app_id`.
///
/// Invalid notices are rejected before fingerprinting; an unknown app fails
/// with `NotFound` and leaves storage untouched.
pub fn ingest(index: &ProblemIndex, app_id: i64, notice: &Notice) -> CoreResult<IngestOutcome> {
    notice.validate()?;
    let db = index.database();
    let app = db.app(app_id)?;
    let fingerprint = fingerprint::generate(notice, &app.api_key);
    let resolution = index.resolve(app_id, &fingerprint, notice)?;
    let notification = occurrence_decision(db, &app, &resolution)?;
    Ok(IngestOutcome {
        fingerprint,
        resolution,
        notification,
    })
}
