//! Canonical timestamp handling: UTC, microsecond precision, `Z` suffix.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::errors::{LedgerError, Result};

/// Returns the current instant as a canonical UTC timestamp string.
pub fn now_canonical() -> String {
    format_canonical(&Utc::now())
}

/// Formats an instant using this crate's canonical representation:
/// `YYYY-MM-DDTHH:MM:SS.ffffffZ`, always UTC, always microsecond precision.
pub fn format_canonical(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a canonical timestamp string back into a `DateTime<Utc>`.
///
/// Accepts any RFC3339-compatible string (not only ones this crate produced)
/// so that entries written by other microsecond- or millisecond-precision
/// implementations of this system remain verifiable.
pub fn parse_canonical(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::InvalidValue {
            reason: format!("timestamp '{value}' is not valid RFC3339: {e}"),
        })
}

/// Builds a `DateTime<Utc>` from a Unix timestamp, used by tests and
/// deterministic synthetic-ledger generators that must not call
/// `Utc::now()` directly.
pub fn from_unix_seconds(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| LedgerError::InvalidValue {
            reason: format!("'{seconds}' is not a representable unix timestamp"),
        })
}
