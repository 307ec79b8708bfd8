//! Column decoding helpers.

use crate::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Reads a column, reporting failures as a corrupt row.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> StorageResult<T> {
    row.get(idx)
        .map_err(|e| StorageError::corrupt(table, column, e.to_string()))
}

/// Decodes a JSON text column.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> StorageResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| StorageError::corrupt(table, column, format!("invalid JSON: {e}")))
}

/// Decodes a nullable JSON text column.
pub fn parse_json_opt<T: DeserializeOwned>(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> StorageResult<Option<T>> {
    raw.map(|raw| parse_json(&raw, table, column)).transpose()
}

/// Encodes a value for a JSON text column.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Database(format!("encode JSON: {e}")))
}

/// `?, ?, ?` placeholders for an `IN` list.
pub fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

/// Converts a row limit to the integer SQLite binds.
pub fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_comma_separated() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn parse_json_reports_column() {
        let err = parse_json::<Vec<i64>>("not json", "roomserver_rooms", "latest_event_nids")
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::CorruptRow {
                column: "latest_event_nids",
                ..
            }
        ));
    }
}
