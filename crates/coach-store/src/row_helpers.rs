use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Get a column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

pub fn parse_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_round_trip_keeps_micros() {
        let t = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(1234);
        let raw = format_time(&t);
        assert_eq!(raw, "2026-10-01T12:00:00.001234Z");
        assert_eq!(parse_time(&raw, "t", "c").unwrap(), t);
    }

    #[test]
    fn formatted_times_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 59, 59).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(format_time(&a) < format_time(&b));
    }

    #[test]
    fn bad_values_are_corrupt_rows() {
        assert!(matches!(
            parse_time("yesterday", "trace_events", "timestamp"),
            Err(StoreError::CorruptRow { table: "trace_events", .. })
        ));
        assert!(matches!(
            parse_json::<Vec<String>>("{", "shadow_suggestions", "suggestions"),
            Err(StoreError::CorruptRow { .. })
        ));
        assert!(matches!(
            parse_enum::<coach_core::messages::Role>("robot", "conversation_messages", "role"),
            Err(StoreError::CorruptRow { .. })
        ));
    }
}
