//! Owner ids and timestamp formatting.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generates a new UUID v4, used as owner id outside a scheduler job.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Formats a timestamp as `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Parses a timestamp written by [`format_timestamp`] or any RFC 3339 string.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_uuid_is_valid() {
        assert_eq!(generate_uuid().get_version_num(), 4);
    }

    #[test]
    fn test_timestamp_format_parses_back() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let text = format_timestamp(&ts);
        assert_eq!(text, "2024-03-01T12:30:05.000000+00:00");
        assert_eq!(parse_timestamp(&text), Some(ts));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
