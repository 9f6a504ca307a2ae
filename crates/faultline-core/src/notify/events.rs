//! Notification events: new comments and new occurrences.
//!
//! Each handler resolves recipients, runs the gate, and hands back a
//! [`NotificationDecision`]. Suppression is an ordinary outcome and is only
//! ever logged at debug level. Delivery belongs to the caller.

use indexmap::IndexSet;
use tracing::debug;

use crate::config::MAX_COMMENT_BODY_LEN;
use crate::errors::{CoreError, CoreResult};
use crate::grouping::index::{GroupingOutcome, Resolution};
use crate::models::{App, Comment, Problem};
use crate::notify::gate::emailable;
use crate::notify::recipients::{exclude_actor, notification_recipients};
use crate::notify::watchers;
use crate::store::database::Database;

/// Why an event did not produce a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suppression {
    /// The occurrence is neither new, a reopen, nor a threshold hit.
    NotWarranted,
    /// The problem is already tracked as an issue in the app's tracker.
    LinkedIssue,
    /// The app has `notify_on_errs` turned off.
    NotifyDisabled,
    /// Nobody is left to notify.
    NoRecipients,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationDecision {
    pub recipients: IndexSet<String>,
    pub emailable: bool,
    pub suppressed: Option<Suppression>,
}

impl NotificationDecision {
    fn gated(app: &App, recipients: IndexSet<String>) -> Self {
        let fire = emailable(app, &recipients);
        let suppressed = if fire {
            None
        } else if !app.notify_on_errs {
            Some(Suppression::NotifyDisabled)
        } else {
            Some(Suppression::NoRecipients)
        };
        Self {
            recipients,
            emailable: fire,
            suppressed,
        }
    }

    fn suppressed(reason: Suppression) -> Self {
        Self {
            recipients: IndexSet::new(),
            emailable: false,
            suppressed: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

/// Store a comment on `problem_id` and decide who hears about it.
///
/// The author never receives their own comment, however many ways they
/// watch the app.
pub fn create_comment(
    db: &Database,
    problem_id: i64,
    author: &str,
    body: &str,
) -> CoreResult<(Comment, NotificationDecision)> {
    let author = author.trim();
    if author.is_empty() {
        return Err(CoreError::Validation("comment author must not be blank".into()));
    }
    if body.trim().is_empty() {
        return Err(CoreError::Validation("comment body must not be blank".into()));
    }
    if body.len() > MAX_COMMENT_BODY_LEN {
        return Err(CoreError::Validation(format!(
            "comment body exceeds {MAX_COMMENT_BODY_LEN} bytes"
        )));
    }

    let (comment, problem) = db.insert_comment(problem_id, author, body)?;
    let app = db.app(problem.app_id)?;
    let recipients = notification_recipients(db, app.id, Some(author))?;
    let decision = NotificationDecision::gated(&app, recipients);
    log_decision("comment", &problem, &decision);
    Ok((comment, decision))
}

/// Recipients and gate for an action by `actor` on `app_id`, without
/// storing anything.
pub fn comment_decision(
    db: &Database,
    app_id: i64,
    actor: &str,
) -> CoreResult<NotificationDecision> {
    let app = db.app(app_id)?;
    let recipients = exclude_actor(watchers::addresses(db, app_id)?, Some(actor));
    Ok(NotificationDecision::gated(&app, recipients))
}

// ---------------------------------------------------------------------------
// Occurrences
// ---------------------------------------------------------------------------

/// A new occurrence is worth announcing when it opened or reopened the
/// problem, or when the problem's count hits one of the app's thresholds.
pub fn occurrence_warrants_notification(app: &App, resolution: &Resolution) -> bool {
    match resolution.outcome {
        GroupingOutcome::Created | GroupingOutcome::Reopened => true,
        GroupingOutcome::Attached => app
            .email_at_notices
            .contains(&resolution.problem.notices_count),
    }
}

/// Decide whether the occurrence recorded in `resolution` is announced.
pub fn occurrence_decision(
    db: &Database,
    app: &App,
    resolution: &Resolution,
) -> CoreResult<NotificationDecision> {
    let problem = &resolution.problem;
    let decision = if !occurrence_warrants_notification(app, resolution) {
        NotificationDecision::suppressed(Suppression::NotWarranted)
    } else if app.has_issue_tracker() && problem.issue_link.is_some() {
        NotificationDecision::suppressed(Suppression::LinkedIssue)
    } else {
        let recipients = notification_recipients(db, app.id, None)?;
        NotificationDecision::gated(app, recipients)
    };
    log_decision("occurrence", problem, &decision);
    Ok(decision)
}

fn log_decision(event: &str, problem: &Problem, decision: &NotificationDecision) {
    match decision.suppressed {
        Some(reason) => debug!(
            kind = event,
            app_id = problem.app_id,
            problem_id = problem.id,
            ?reason,
            "notification suppressed"
        ),
        None => debug!(
            kind = event,
            app_id = problem.app_id,
            problem_id = problem.id,
            recipients = decision.recipients.len(),
            "notification emailable"
        ),
    }
}
