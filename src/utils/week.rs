//! ISO week epoch helpers
//!
//! Free-tier usage counters reset on ISO week boundaries (Monday-based).
//! The epoch string "YYYY-W##" is stored on every usage record and compared
//! on read.

use chrono::{DateTime, Datelike, Utc};

/// Current ISO week epoch, e.g. "2026-W01"
pub fn current_week_epoch() -> String {
    week_epoch_for(Utc::now())
}

/// ISO week epoch for an arbitrary instant
pub fn week_epoch_for(instant: DateTime<Utc>) -> String {
    let iso = instant.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}
