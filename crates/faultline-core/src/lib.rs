//! Faultline core: error-notice deduplication and watcher notification.
//!
//! Incoming notices are fingerprinted per app, grouped into problems through
//! an atomic get-or-create on `(app, fingerprint)`, and events on those
//! problems (new comments, new occurrences) are resolved to the set of
//! watcher addresses that should hear about them. Storage is SQLite; email
//! delivery is left to the caller.
//!
//! With the `python` feature the crate also builds the `_faultline_core`
//! extension module for embedding in a host application.

pub mod config;
pub mod errors;
pub mod grouping;
pub mod models;
pub mod notify;
pub mod store;

#[cfg(feature = "python")]
mod python;

pub use config::CoreConfig;
pub use errors::{CoreError, CoreResult};
pub use grouping::fingerprint::generate as generate_fingerprint;
pub use grouping::index::{GroupingOutcome, ProblemIndex, Resolution};
pub use grouping::ingest::{ingest, IngestOutcome};
pub use notify::events::{NotificationDecision, Suppression};
pub use store::database::Database;
