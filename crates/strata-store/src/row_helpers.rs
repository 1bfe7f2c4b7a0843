use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
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

/// Parse a JSON object column, returning CorruptRow on parse failure.
pub fn parse_object(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::CorruptRow {
            table,
            column,
            detail: format!("expected JSON object, got {other}"),
        }),
        Err(e) => Err(StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid JSON: {e}"),
        }),
    }
}

/// Parse a string into an enum, returning CorruptRow on failure.
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

/// Parse an RFC 3339 timestamp column.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp: {e}"),
        })
}

/// Current time at the precision `format_timestamp` stores, so a context
/// built in memory compares equal to the same row read back.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC timestamp, so stored values order lexicographically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Level;

    #[test]
    fn now_survives_a_storage_round_trip() {
        let ts = now();
        let stored = format_timestamp(ts);
        assert_eq!(parse_timestamp(&stored, "contexts", "updated_at").unwrap(), ts);
    }

    #[test]
    fn parse_enum_success() {
        let result: Result<Level, _> = parse_enum("branch", "contexts", "level");
        assert_eq!(result.unwrap(), Level::Branch);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<Level, _> = parse_enum("tenant", "contexts", "level");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "contexts", column: "level", .. })
        ));
    }

    #[test]
    fn parse_object_rejects_non_objects() {
        assert!(parse_object(r#"{"key": "value"}"#, "contexts", "payload").is_ok());
        assert!(matches!(
            parse_object("[1, 2]", "contexts", "payload"),
            Err(StoreError::CorruptRow { .. })
        ));
        assert!(matches!(
            parse_object("not valid json", "contexts", "payload"),
            Err(StoreError::CorruptRow { .. })
        ));
    }

    #[test]
    fn timestamps_roundtrip_and_order() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(5);
        let (fa, fb) = (format_timestamp(a), format_timestamp(b));
        assert!(fa < fb);
        assert_eq!(parse_timestamp(&fa, "t", "c").unwrap().timestamp_micros(), a.timestamp_micros());
    }
}
