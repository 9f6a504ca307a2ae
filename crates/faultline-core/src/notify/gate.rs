//! Notification gate.

use indexmap::IndexSet;

use crate::models::App;

/// Whether a notification fires: the app opted in and someone is listening.
pub fn emailable(app: &App, recipients: &IndexSet<String>) -> bool {
    app.notify_on_errs && !recipients.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(notify_on_errs: bool) -> App {
        App {
            id: 1,
            name: "shop".into(),
            api_key: "key".into(),
            notify_on_errs,
            email_at_notices: vec![1],
            issue_tracker: None,
            repository_url: None,
            created_at: "2024-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn truth_table() {
        let someone: IndexSet<String> = ["w@x.com".to_string()].into_iter().collect();
        let nobody = IndexSet::new();
        assert!(emailable(&app(true), &someone));
        assert!(!emailable(&app(true), &nobody));
        assert!(!emailable(&app(false), &someone));
        assert!(!emailable(&app(false), &nobody));
    }
}
