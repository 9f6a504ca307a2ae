//! Watcher registry: the effective notification address set of an app.
//!
//! The set is the union of standalone watcher addresses and the emails of
//! users subscribed through `user_watchers`, collapsed by address value. It
//! is recomputed from storage on every call; nothing is cached here.

use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;
use rusqlite::{params, Connection};

use crate::errors::{CoreError, CoreResult};
use crate::store::database::{require_app, Database};

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("address pattern is valid"));

/// Canonical form of a notification address: trimmed and ASCII-lowercased.
pub fn normalize_address(raw: &str) -> CoreResult<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if !ADDRESS_RE.is_match(&normalized) {
        return Err(CoreError::Validation(format!(
            "invalid notification address: {raw:?}"
        )));
    }
    Ok(normalized)
}

/// Addresses watching `app_id`, standalone watchers first, then subscribed
/// users, each in subscription order.
pub fn addresses(db: &Database, app_id: i64) -> CoreResult<IndexSet<String>> {
    let mut conn = db.connect()?;
    // One read transaction so the app check and the union see one snapshot.
    let tx = conn.transaction()?;
    require_app(&tx, app_id)?;
    let set = addresses_in(&tx, app_id)?;
    tx.commit()?;
    Ok(set)
}

pub(crate) fn addresses_in(conn: &Connection, app_id: i64) -> CoreResult<IndexSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT address, 0 AS source, id FROM watchers WHERE app_id = ?1 \
         UNION ALL \
         SELECT u.email, 1 AS source, uw.id FROM user_watchers uw \
         JOIN users u ON u.id = uw.user_id WHERE uw.app_id = ?1 \
         ORDER BY source, id;",
    )?;
    let rows = stmt.query_map(params![app_id], |row| row.get::<_, String>(0))?;
    let mut set = IndexSet::new();
    for address in rows {
        set.insert(address?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewApp;
    use crate::store::database::test_support::temp_db;

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize_address("  W@X.Com\n").unwrap(), "w@x.com");
        assert!(normalize_address("").is_err());
        assert!(normalize_address("two@@x.com").is_err());
        assert!(normalize_address("spaced out@x.com").is_err());
    }

    #[test]
    fn union_of_watchers_and_user_watchers() {
        let (_dir, db) = temp_db();
        let app = db.create_app(&NewApp::new("shop", "key-1")).unwrap();
        db.add_watcher(app.id, "w@x.com").unwrap();
        let user = db.create_user("u@x.com").unwrap();
        db.add_user_watcher(app.id, user.id).unwrap();

        let set = addresses(&db, app.id).unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["w@x.com".to_string(), "u@x.com".to_string()]
        );
    }

    #[test]
    fn same_address_from_both_sources_is_collapsed() {
        let (_dir, db) = temp_db();
        let app = db.create_app(&NewApp::new("shop", "key-1")).unwrap();
        db.add_watcher(app.id, "dup@x.com").unwrap();
        let user = db.create_user("DUP@x.com").unwrap();
        db.add_user_watcher(app.id, user.id).unwrap();

        let set = addresses(&db, app.id).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("dup@x.com"));
    }

    #[test]
    fn other_apps_do_not_leak_in() {
        let (_dir, db) = temp_db();
        let mine = db.create_app(&NewApp::new("mine", "key-1")).unwrap();
        let theirs = db.create_app(&NewApp::new("theirs", "key-2")).unwrap();
        db.add_watcher(theirs.id, "them@x.com").unwrap();
        assert!(addresses(&db, mine.id).unwrap().is_empty());
    }

    #[test]
    fn removal_is_reflected_on_next_read() {
        let (_dir, db) = temp_db();
        let app = db.create_app(&NewApp::new("shop", "key-1")).unwrap();
        let watcher = db.add_watcher(app.id, "w@x.com").unwrap();
        assert_eq!(addresses(&db, app.id).unwrap().len(), 1);
        db.remove_watcher(watcher.id).unwrap();
        assert!(addresses(&db, app.id).unwrap().is_empty());
    }

    #[test]
    fn missing_app_is_not_found() {
        let (_dir, db) = temp_db();
        assert!(addresses(&db, 7).unwrap_err().is_not_found());
    }
}
