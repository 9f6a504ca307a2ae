//! Runtime configuration for the grouping and notification core.
//!
//! Values come from `FAULTLINE_*` environment variables. Anything missing or
//! unparseable falls back to the default and every numeric knob is clamped,
//! so loading configuration never fails.

pub const DEFAULT_LOCK_STRIPES: usize = 64;
pub const MAX_LOCK_STRIPES: usize = 4096;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const MAX_BUSY_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_GROUPING_RETRIES: u32 = 5;
pub const MAX_GROUPING_RETRIES: u32 = 50;

pub const DEFAULT_EMAIL_AT_NOTICES: &[i64] = &[1, 10, 100];

pub const MAX_BACKFILL_WORKERS: usize = 64;

/// Upper bound on a stored comment body, in bytes.
pub const MAX_COMMENT_BODY_LEN: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    /// Number of in-process mutex stripes guarding get-or-create.
    pub lock_stripes: usize,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout_ms: u64,
    /// How many times a conflicting get-or-create is retried before giving up.
    pub grouping_retries: u32,
    /// Occurrence thresholds given to Apps created without explicit ones.
    pub default_email_at_notices: Vec<i64>,
    pub backfill_workers: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lock_stripes: DEFAULT_LOCK_STRIPES,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            grouping_retries: DEFAULT_GROUPING_RETRIES,
            default_email_at_notices: DEFAULT_EMAIL_AT_NOTICES.to_vec(),
            backfill_workers: default_workers(),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` is this with
    /// the process environment plugged in.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lock_stripes = parse_num(lookup("FAULTLINE_LOCK_STRIPES"))
            .map(|v: usize| v.clamp(1, MAX_LOCK_STRIPES))
            .unwrap_or(defaults.lock_stripes);
        let busy_timeout_ms = parse_num(lookup("FAULTLINE_BUSY_TIMEOUT_MS"))
            .map(|v: u64| v.min(MAX_BUSY_TIMEOUT_MS))
            .unwrap_or(defaults.busy_timeout_ms);
        let grouping_retries = parse_num(lookup("FAULTLINE_GROUPING_RETRIES"))
            .map(|v: u32| v.clamp(1, MAX_GROUPING_RETRIES))
            .unwrap_or(defaults.grouping_retries);
        let default_email_at_notices = lookup("FAULTLINE_EMAIL_AT_NOTICES")
            .and_then(|raw| parse_thresholds(&raw))
            .unwrap_or(defaults.default_email_at_notices);
        let backfill_workers = parse_num(lookup("FAULTLINE_BACKFILL_WORKERS"))
            .map(|v: usize| v.clamp(1, MAX_BACKFILL_WORKERS))
            .unwrap_or(defaults.backfill_workers);

        Self {
            lock_stripes,
            busy_timeout_ms,
            grouping_retries,
            default_email_at_notices,
            backfill_workers,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_BACKFILL_WORKERS)
}

fn parse_num<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse::<T>().ok())
}

/// Parse a comma-separated list of positive counts, e.g. `"1, 10, 100"`.
/// Returns `None` if any entry is invalid so a typo never silently drops a
/// threshold.
pub fn parse_thresholds(raw: &str) -> Option<Vec<i64>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<i64>() {
            Ok(v) if v > 0 => out.push(v),
            _ => return None,
        }
    }
    out.sort_unstable();
    out.dedup();
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = CoreConfig::from_lookup(|_| None);
        assert_eq!(cfg, CoreConfig::default());
        assert_eq!(cfg.default_email_at_notices, vec![1, 10, 100]);
    }

    #[test]
    fn values_are_parsed_and_clamped() {
        let cfg = CoreConfig::from_lookup(lookup_from(&[
            ("FAULTLINE_LOCK_STRIPES", "0"),
            ("FAULTLINE_BUSY_TIMEOUT_MS", "999999"),
            ("FAULTLINE_GROUPING_RETRIES", " 3 "),
            ("FAULTLINE_EMAIL_AT_NOTICES", "100, 1,5"),
            ("FAULTLINE_BACKFILL_WORKERS", "1000"),
        ]));
        assert_eq!(cfg.lock_stripes, 1);
        assert_eq!(cfg.busy_timeout_ms, MAX_BUSY_TIMEOUT_MS);
        assert_eq!(cfg.grouping_retries, 3);
        assert_eq!(cfg.default_email_at_notices, vec![1, 5, 100]);
        assert_eq!(cfg.backfill_workers, MAX_BACKFILL_WORKERS);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = CoreConfig::from_lookup(lookup_from(&[
            ("FAULTLINE_LOCK_STRIPES", "many"),
            ("FAULTLINE_EMAIL_AT_NOTICES", "1,ten"),
        ]));
        assert_eq!(cfg.lock_stripes, DEFAULT_LOCK_STRIPES);
        assert_eq!(cfg.default_email_at_notices, DEFAULT_EMAIL_AT_NOTICES.to_vec());
    }

    #[test]
    fn thresholds_reject_non_positive() {
        assert_eq!(parse_thresholds("1,0"), None);
        assert_eq!(parse_thresholds(""), Some(vec![]));
        assert_eq!(parse_thresholds("10,10,1"), Some(vec![1, 10]));
    }
}
