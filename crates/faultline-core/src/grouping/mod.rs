pub mod backfill;
pub mod fingerprint;
pub mod index;
pub mod ingest;
