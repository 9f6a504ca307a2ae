//! PyO3 bindings: the `_faultline_core` extension module.
//!
//! Records cross the boundary as plain ids, strings, and dicts; the host
//! application owns its own model layer.

use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::CoreConfig;
use crate::grouping::backfill::refingerprint_app;
use crate::grouping::fingerprint::{self, FINGERPRINT_ENCODING_VERSION};
use crate::grouping::index::ProblemIndex;
use crate::grouping::ingest::ingest;
use crate::models::{Backtrace, Frame, IssueTracker, NewApp, Notice};
use crate::notify::events::{self, NotificationDecision};
use crate::notify::gate;
use crate::notify::recipients::notification_recipients;
use crate::store::database::Database;

/// `(file, number, column, method)` as passed from Python.
type PyFrame = (String, Option<i64>, Option<i64>, Option<String>);

fn build_notice(
    error_class: String,
    message: Option<String>,
    component: Option<String>,
    action: Option<String>,
    environment_name: Option<String>,
    backtrace: Option<Vec<PyFrame>>,
) -> Notice {
    Notice {
        error_class,
        message,
        component,
        action,
        environment_name,
        backtrace: backtrace.map(|frames| {
            Backtrace::new(
                frames
                    .into_iter()
                    .map(|(file, number, column, method)| Frame {
                        file,
                        number,
                        column,
                        method,
                    })
                    .collect(),
            )
        }),
    }
}

fn decision_into_dict(dict: &Bound<'_, PyDict>, decision: &NotificationDecision) -> PyResult<()> {
    let recipients: Vec<&str> = decision.recipients.iter().map(String::as_str).collect();
    dict.set_item("recipients", recipients)?;
    dict.set_item("emailable", decision.emailable)?;
    dict.set_item(
        "suppressed",
        decision.suppressed.map(|reason| format!("{reason:?}")),
    )?;
    Ok(())
}

#[pyfunction]
#[pyo3(
    name = "generate_fingerprint",
    signature = (api_key, error_class, message=None, component=None, action=None, environment_name=None, backtrace=None)
)]
#[allow(clippy::too_many_arguments)]
fn py_generate_fingerprint(
    api_key: &str,
    error_class: String,
    message: Option<String>,
    component: Option<String>,
    action: Option<String>,
    environment_name: Option<String>,
    backtrace: Option<Vec<PyFrame>>,
) -> String {
    let notice = build_notice(
        error_class,
        message,
        component,
        action,
        environment_name,
        backtrace,
    );
    fingerprint::generate(&notice, api_key)
}

#[pyclass(name = "Core")]
struct PyCore {
    index: ProblemIndex,
    backfill_workers: usize,
}

#[pymethods]
impl PyCore {
    /// Open (and initialise) the store at `db_path`, configured from the
    /// `FAULTLINE_*` environment.
    #[new]
    fn new(db_path: std::path::PathBuf) -> PyResult<Self> {
        let config = CoreConfig::from_env();
        let db = Database::open(db_path, &config)?;
        db.init_schema()?;
        Ok(Self {
            index: ProblemIndex::new(db, &config),
            backfill_workers: config.backfill_workers,
        })
    }

    #[pyo3(signature = (name, api_key, notify_on_errs=true, email_at_notices=None, repository_url=None))]
    fn create_app(
        &self,
        name: String,
        api_key: String,
        notify_on_errs: bool,
        email_at_notices: Option<Vec<i64>>,
        repository_url: Option<String>,
    ) -> PyResult<i64> {
        let app = self.index.database().create_app(&NewApp {
            name,
            api_key,
            notify_on_errs,
            email_at_notices,
            issue_tracker: None,
            repository_url,
        })?;
        Ok(app.id)
    }

    fn set_notify_on_errs(&self, app_id: i64, enabled: bool) -> PyResult<()> {
        self.index.database().set_notify_on_errs(app_id, enabled)?;
        Ok(())
    }

    /// Configure a tracker with `kind`, or clear it when `kind` is `None`.
    #[pyo3(signature = (app_id, kind=None, project=None))]
    fn set_issue_tracker(
        &self,
        app_id: i64,
        kind: Option<String>,
        project: Option<String>,
    ) -> PyResult<()> {
        let tracker = kind.map(|kind| IssueTracker { kind, project });
        self.index
            .database()
            .set_issue_tracker(app_id, tracker.as_ref())?;
        Ok(())
    }

    fn create_user(&self, email: &str) -> PyResult<i64> {
        Ok(self.index.database().create_user(email)?.id)
    }

    fn add_watcher(&self, app_id: i64, address: &str) -> PyResult<i64> {
        Ok(self.index.database().add_watcher(app_id, address)?.id)
    }

    fn remove_watcher(&self, watcher_id: i64) -> PyResult<()> {
        self.index.database().remove_watcher(watcher_id)?;
        Ok(())
    }

    fn add_user_watcher(&self, app_id: i64, user_id: i64) -> PyResult<i64> {
        Ok(self.index.database().add_user_watcher(app_id, user_id)?.id)
    }

    fn remove_user_watcher(&self, user_watcher_id: i64) -> PyResult<()> {
        self.index.database().remove_user_watcher(user_watcher_id)?;
        Ok(())
    }

    #[pyo3(signature = (app_id, error_class, message=None, component=None, action=None, environment_name=None, backtrace=None))]
    #[allow(clippy::too_many_arguments)]
    fn ingest_notice<'py>(
        &self,
        py: Python<'py>,
        app_id: i64,
        error_class: String,
        message: Option<String>,
        component: Option<String>,
        action: Option<String>,
        environment_name: Option<String>,
        backtrace: Option<Vec<PyFrame>>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let notice = build_notice(
            error_class,
            message,
            component,
            action,
            environment_name,
            backtrace,
        );
        let outcome = py.allow_threads(|| ingest(&self.index, app_id, &notice))?;

        let dict = PyDict::new(py);
        dict.set_item("fingerprint", &outcome.fingerprint)?;
        dict.set_item("problem_id", outcome.resolution.problem.id)?;
        dict.set_item("notice_id", outcome.resolution.notice_id)?;
        dict.set_item("notices_count", outcome.resolution.problem.notices_count)?;
        dict.set_item("outcome", outcome.resolution.outcome.as_str())?;
        decision_into_dict(&dict, &outcome.notification)?;
        Ok(dict)
    }

    fn create_comment<'py>(
        &self,
        py: Python<'py>,
        problem_id: i64,
        author: &str,
        body: &str,
    ) -> PyResult<Bound<'py, PyDict>> {
        let (comment, decision) =
            events::create_comment(self.index.database(), problem_id, author, body)?;
        let dict = PyDict::new(py);
        dict.set_item("comment_id", comment.id)?;
        dict.set_item("created_at", comment.created_at)?;
        decision_into_dict(&dict, &decision)?;
        Ok(dict)
    }

    #[pyo3(signature = (app_id, exclude=None))]
    fn notification_recipients(&self, app_id: i64, exclude: Option<&str>) -> PyResult<Vec<String>> {
        let recipients = notification_recipients(self.index.database(), app_id, exclude)?;
        Ok(recipients.into_iter().collect())
    }

    fn emailable(&self, app_id: i64, recipients: Vec<String>) -> PyResult<bool> {
        let app = self.index.database().app(app_id)?;
        Ok(gate::emailable(&app, &recipients.into_iter().collect()))
    }

    fn mark_resolved(&self, problem_id: i64) -> PyResult<()> {
        self.index.database().mark_resolved(problem_id)?;
        Ok(())
    }

    fn mark_unresolved(&self, problem_id: i64) -> PyResult<()> {
        self.index.database().mark_unresolved(problem_id)?;
        Ok(())
    }

    #[pyo3(signature = (problem_id, issue_link=None))]
    fn link_issue(&self, problem_id: i64, issue_link: Option<&str>) -> PyResult<()> {
        self.index.database().link_issue(problem_id, issue_link)?;
        Ok(())
    }

    fn delete_problem(&self, problem_id: i64) -> PyResult<()> {
        self.index.database().delete_problem(problem_id)?;
        Ok(())
    }

    /// Returns `(scanned, moved, problems_created)`.
    fn refingerprint_app(&self, py: Python<'_>, app_id: i64) -> PyResult<(usize, usize, usize)> {
        let stats =
            py.allow_threads(|| refingerprint_app(&self.index, app_id, self.backfill_workers))?;
        Ok((stats.scanned, stats.moved, stats.problems_created))
    }
}

#[pymodule]
fn _faultline_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("FINGERPRINT_ENCODING_VERSION", FINGERPRINT_ENCODING_VERSION)?;
    m.add("DEFAULT_COMPONENT", fingerprint::DEFAULT_COMPONENT)?;
    m.add("DEFAULT_ENVIRONMENT", fingerprint::DEFAULT_ENVIRONMENT)?;
    m.add_function(wrap_pyfunction!(py_generate_fingerprint, m)?)?;
    m.add_class::<PyCore>()?;
    Ok(())
}
