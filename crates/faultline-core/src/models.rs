//! Shared typed records used across grouping, notification, and storage.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::errors::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Backtrace
// ---------------------------------------------------------------------------

/// One stack frame of a reported backtrace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub number: Option<i64>,
    pub column: Option<i64>,
    pub method: Option<String>,
}

impl Frame {
    pub fn new(file: impl Into<String>, number: Option<i64>, method: Option<&str>) -> Self {
        Self {
            file: file.into(),
            number,
            column: None,
            method: method.map(str::to_string),
        }
    }
}

/// Ordered frame sequence of a notice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backtrace {
    pub frames: Vec<Frame>,
}

impl Backtrace {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// SHA-256 hex digest over the frame sequence.
    ///
    /// Each frame is encoded as the JSON array `[file, number, column, method]`
    /// so that an absent field and an empty one never collide.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::Value::Array(
            self.frames
                .iter()
                .map(|f| json!([f.file, f.number, f.column, f.method]))
                .collect(),
        )
        .to_string();
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Notice
// ---------------------------------------------------------------------------

/// A single raw error occurrence as reported by a client application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub error_class: String,
    pub message: Option<String>,
    pub backtrace: Option<Backtrace>,
    pub component: Option<String>,
    pub action: Option<String>,
    pub environment_name: Option<String>,
}

impl Notice {
    pub fn new(error_class: impl Into<String>) -> Self {
        Self {
            error_class: error_class.into(),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        self.backtrace = Some(backtrace);
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment_name = Some(environment.into());
        self
    }

    /// Reject notices that must never reach the fingerprinter.
    pub fn validate(&self) -> CoreResult<()> {
        if self.error_class.trim().is_empty() {
            return Err(CoreError::Validation(
                "notice is missing an error class".to_string(),
            ));
        }
        Ok(())
    }

    /// `component#action` as shown on a problem, when either is known.
    pub fn location(&self) -> Option<String> {
        match (self.component.as_deref(), self.action.as_deref()) {
            (None, None) => None,
            (Some(c), None) => Some(c.to_string()),
            (None, Some(a)) => Some(format!("#{a}")),
            (Some(c), Some(a)) => Some(format!("{c}#{a}")),
        }
    }
}

/// A notice as persisted under its problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredNotice {
    pub id: i64,
    pub problem_id: i64,
    pub fingerprint: String,
    pub notice: Notice,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

/// Third-party tracker configuration. The core only cares that one exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTracker {
    pub kind: String,
    pub project: Option<String>,
}

/// Tenant boundary owning problems and watchers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct App {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub notify_on_errs: bool,
    pub email_at_notices: Vec<i64>,
    pub issue_tracker: Option<IssueTracker>,
    pub repository_url: Option<String>,
    pub created_at: String,
}

impl App {
    pub fn has_issue_tracker(&self) -> bool {
        self.issue_tracker.is_some()
    }
}

/// Input for creating an app.
#[derive(Clone, Debug, Default)]
pub struct NewApp {
    pub name: String,
    pub api_key: String,
    pub notify_on_errs: bool,
    /// `None` takes the configured default thresholds.
    pub email_at_notices: Option<Vec<i64>>,
    pub issue_tracker: Option<IssueTracker>,
    pub repository_url: Option<String>,
}

impl NewApp {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            notify_on_errs: true,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Problem
// ---------------------------------------------------------------------------

/// Aggregation bucket for notices sharing a fingerprint within one app.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Problem {
    pub id: i64,
    pub app_id: i64,
    pub fingerprint: String,
    pub error_class: String,
    pub message: Option<String>,
    pub environment: String,
    pub location: Option<String>,
    pub notices_count: i64,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub issue_link: Option<String>,
    pub created_at: String,
    pub last_notice_at: String,
}

// ---------------------------------------------------------------------------
// Watchers
// ---------------------------------------------------------------------------

/// A standalone notification address subscribed to an app.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Watcher {
    pub id: i64,
    pub app_id: i64,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
}

/// Join between a registered user and an app.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserWatcher {
    pub id: i64,
    pub app_id: i64,
    pub user_id: i64,
}

// ---------------------------------------------------------------------------
// Comment
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub id: i64,
    pub problem_id: i64,
    pub author: String,
    pub body: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames() -> Vec<Frame> {
        vec![
            Frame::new("app/models/user.rb", Some(10), Some("save")),
            Frame::new("app/controllers/users_controller.rb", Some(42), Some("create")),
        ]
    }

    #[test]
    fn identical_frames_share_a_fingerprint() {
        let a = Backtrace::new(frames());
        let b = Backtrace::new(frames());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn any_frame_change_moves_the_fingerprint() {
        let base = Backtrace::new(frames()).fingerprint();

        let mut moved_line = frames();
        moved_line[1].number = Some(43);
        assert_ne!(base, Backtrace::new(moved_line).fingerprint());

        let mut reordered = frames();
        reordered.reverse();
        assert_ne!(base, Backtrace::new(reordered).fingerprint());

        let mut no_method = frames();
        no_method[0].method = Some(String::new());
        assert_ne!(base, Backtrace::new(no_method.clone()).fingerprint());
        no_method[0].method = None;
        let absent = Backtrace::new(no_method).fingerprint();
        assert_ne!(base, absent);
    }

    #[test]
    fn empty_backtrace_is_stable() {
        assert_eq!(
            Backtrace::default().fingerprint(),
            Backtrace::new(vec![]).fingerprint()
        );
    }

    #[test]
    fn blank_error_class_fails_validation() {
        assert!(Notice::new("  ").validate().is_err());
        assert!(Notice::new("NoMethodError").validate().is_ok());
    }

    #[test]
    fn location_joins_component_and_action() {
        let n = Notice::new("E").with_component("users").with_action("create");
        assert_eq!(n.location().as_deref(), Some("users#create"));
        assert_eq!(Notice::new("E").location(), None);
        assert_eq!(
            Notice::new("E").with_action("index").location().as_deref(),
            Some("#index")
        );
    }
}
