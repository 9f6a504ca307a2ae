//! Recipient resolution: who hears about an event.

use indexmap::IndexSet;
use tracing::debug;

use crate::errors::CoreResult;
use crate::notify::watchers::{self, normalize_address};
use crate::store::database::Database;

/// Remove the acting address from `addresses`.
///
/// `exclude` is normalized the same way stored addresses are, then matched
/// by exact value. An exclude that is not a valid address cannot match any
/// stored one and leaves the set untouched.
pub fn exclude_actor(mut addresses: IndexSet<String>, exclude: Option<&str>) -> IndexSet<String> {
    if let Some(actor) = exclude.and_then(|raw| normalize_address(raw).ok()) {
        addresses.shift_remove(&actor);
    }
    addresses
}

/// Watchers of `app_id` that should be told about an action by `exclude`.
pub fn notification_recipients(
    db: &Database,
    app_id: i64,
    exclude: Option<&str>,
) -> CoreResult<IndexSet<String>> {
    let all = watchers::addresses(db, app_id)?;
    let total = all.len();
    let recipients = exclude_actor(all, exclude);
    debug!(
        app_id,
        watchers = total,
        recipients = recipients.len(),
        "resolved notification recipients"
    );
    Ok(recipients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewApp;
    use crate::store::database::test_support::temp_db;

    fn set(items: &[&str]) -> IndexSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn author_is_removed() {
        let out = exclude_actor(set(&["a@x.com", "b@x.com"]), Some("a@x.com"));
        assert_eq!(out, set(&["b@x.com"]));
    }

    #[test]
    fn exclusion_uses_normalized_value() {
        let out = exclude_actor(set(&["a@x.com", "b@x.com"]), Some(" A@X.com "));
        assert_eq!(out, set(&["b@x.com"]));
    }

    #[test]
    fn no_fuzzy_matching() {
        let out = exclude_actor(set(&["a@x.com"]), Some("a@x.co"));
        assert_eq!(out, set(&["a@x.com"]));
    }

    #[test]
    fn absent_or_unmatched_actor_keeps_everyone() {
        let all = set(&["a@x.com", "b@x.com"]);
        assert_eq!(exclude_actor(all.clone(), None), all);
        assert_eq!(exclude_actor(all.clone(), Some("c@x.com")), all);
        assert_eq!(exclude_actor(all.clone(), Some("garbage")), all);
    }

    #[test]
    fn may_resolve_to_nobody() {
        assert!(exclude_actor(set(&["a@x.com"]), Some("a@x.com")).is_empty());
    }

    #[test]
    fn author_watching_twice_is_still_excluded() {
        let (_dir, db) = temp_db();
        let app = db.create_app(&NewApp::new("shop", "key-1")).unwrap();
        db.add_watcher(app.id, "author@example.com").unwrap();
        db.add_watcher(app.id, "b@x.com").unwrap();
        let author = db.create_user("author@example.com").unwrap();
        db.add_user_watcher(app.id, author.id).unwrap();

        let out = notification_recipients(&db, app.id, Some("author@example.com")).unwrap();
        assert_eq!(out, set(&["b@x.com"]));
    }
}
