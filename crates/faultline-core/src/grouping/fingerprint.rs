//! Notice fingerprinting.
//!
//! A fingerprint is the SHA-1 hex digest of a canonical, versioned encoding of
//! the attributes that decide which problem a notice belongs to:
//!
//! ```text
//! {"action":..,"api_key":..,"backtrace_fingerprint":..,"component":..,
//!  "environment":..,"error_class":..,"v":1}
//! ```
//!
//! Keys are emitted in sorted order and absent values as `null`, so any
//! reimplementation that follows the same rules produces byte-identical input.

use serde_json::{json, Value};
use sha1::{Digest, Sha1};

use crate::models::Notice;

/// Bumped whenever the canonical encoding changes. Existing problems keep
/// their old fingerprints; a backfill is needed to regroup them.
pub const FINGERPRINT_ENCODING_VERSION: u32 = 1;

pub const DEFAULT_COMPONENT: &str = "unknown";
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Length of a hex-encoded SHA-1 digest.
pub const FINGERPRINT_LEN: usize = 40;

/// The canonical string that gets hashed.
pub fn fingerprint_source(notice: &Notice, api_key: &str) -> String {
    let backtrace_fingerprint = notice.backtrace.as_ref().map(|bt| bt.fingerprint());
    // Keys are listed in sorted order so the output is the same whether the
    // map type is key-ordered or insertion-ordered.
    let source: Value = json!({
        "action": notice.action,
        "api_key": api_key,
        "backtrace_fingerprint": backtrace_fingerprint,
        "component": notice.component.as_deref().unwrap_or(DEFAULT_COMPONENT),
        "environment": notice.environment_name.as_deref().unwrap_or(DEFAULT_ENVIRONMENT),
        "error_class": notice.error_class,
        "v": FINGERPRINT_ENCODING_VERSION,
    });
    source.to_string()
}

/// Compute the fingerprint of `notice` for the app owning `api_key`.
pub fn generate(notice: &Notice, api_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(fingerprint_source(notice, api_key).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backtrace, Frame};

    const KEY: &str = "a1b2c3d4";

    fn full_notice() -> Notice {
        Notice::new("NoMethodError")
            .with_message("undefined method `name' for nil")
            .with_component("users")
            .with_action("show")
            .with_environment("production")
            .with_backtrace(Backtrace::new(vec![
                Frame::new("app/models/user.rb", Some(3), Some("name")),
                Frame::new("app/controllers/users_controller.rb", Some(8), Some("show")),
            ]))
    }

    #[test]
    fn output_is_lowercase_hex_of_fixed_length() {
        let fp = generate(&full_notice(), KEY);
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn equivalent_notices_share_a_fingerprint() {
        let a = full_notice();
        let mut b = full_notice();
        b.message = Some("a different message".into());
        assert_eq!(generate(&a, KEY), generate(&b, KEY));
    }

    #[test]
    fn every_grouping_attribute_changes_the_fingerprint() {
        let base = generate(&full_notice(), KEY);

        let mut n = full_notice();
        n.error_class = "ArgumentError".into();
        assert_ne!(base, generate(&n, KEY));

        let mut n = full_notice();
        n.component = Some("accounts".into());
        assert_ne!(base, generate(&n, KEY));

        let mut n = full_notice();
        n.action = Some("index".into());
        assert_ne!(base, generate(&n, KEY));

        let mut n = full_notice();
        n.environment_name = Some("staging".into());
        assert_ne!(base, generate(&n, KEY));

        let mut n = full_notice();
        if let Some(bt) = n.backtrace.as_mut() {
            bt.frames[0].number = Some(4);
        }
        assert_ne!(base, generate(&n, KEY));

        assert_ne!(base, generate(&full_notice(), "another-key"));
    }

    #[test]
    fn distinct_api_keys_isolate_tenants() {
        let n = Notice::new("RuntimeError");
        assert_ne!(generate(&n, "app-one"), generate(&n, "app-two"));
    }

    #[test]
    fn absent_component_and_environment_take_defaults() {
        let bare = Notice::new("RuntimeError");
        let explicit = Notice::new("RuntimeError")
            .with_component(DEFAULT_COMPONENT)
            .with_environment(DEFAULT_ENVIRONMENT);
        assert_eq!(generate(&bare, KEY), generate(&explicit, KEY));
    }

    #[test]
    fn empty_strings_are_not_substituted() {
        let bare = Notice::new("RuntimeError");
        assert_ne!(
            generate(&bare, KEY),
            generate(&bare.clone().with_component(""), KEY)
        );
        assert_ne!(
            generate(&bare, KEY),
            generate(&bare.clone().with_environment(""), KEY)
        );
        assert_ne!(
            generate(&bare, KEY),
            generate(&bare.clone().with_action(""), KEY)
        );
    }

    #[test]
    fn missing_backtrace_has_a_stable_placeholder() {
        let bare = Notice::new("RuntimeError");
        let source = fingerprint_source(&bare, KEY);
        assert!(source.contains("\"backtrace_fingerprint\":null"));
        assert_eq!(generate(&bare, KEY), generate(&bare, KEY));

        let empty = bare.clone().with_backtrace(Backtrace::default());
        assert_ne!(generate(&bare, KEY), generate(&empty, KEY));
    }

    #[test]
    fn canonical_source_is_key_sorted_and_versioned() {
        let source = fingerprint_source(&Notice::new("E"), "k");
        assert_eq!(
            source,
            "{\"action\":null,\"api_key\":\"k\",\"backtrace_fingerprint\":null,\
             \"component\":\"unknown\",\"environment\":\"development\",\
             \"error_class\":\"E\",\"v\":1}"
        );
    }
}
