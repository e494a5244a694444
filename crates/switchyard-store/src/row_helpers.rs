use std::fmt::Display;

use rusqlite::types::FromSql;
use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Reads columns of one table's rows, mapping every decode failure to
/// `StoreError::CorruptRow` tagged with the table and column.
pub struct RowReader<'r, 's> {
    row: &'r Row<'s>,
    table: &'static str,
}

impl<'r, 's> RowReader<'r, 's> {
    pub fn new(row: &'r Row<'s>, table: &'static str) -> Self {
        Self { row, table }
    }

    /// Nullable columns read as `Option<T>`.
    pub fn get<T: FromSql>(&self, idx: usize, column: &'static str) -> Result<T, StoreError> {
        self.row.get(idx).map_err(|e| corrupt(self.table, column, e))
    }

    /// SQLite has no boolean type; anything non-zero is true.
    pub fn flag(&self, idx: usize, column: &'static str) -> Result<bool, StoreError> {
        self.get::<i64>(idx, column).map(|v| v != 0)
    }
}

pub fn corrupt(table: &'static str, column: &'static str, detail: impl Display) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail: detail.to_string(),
    }
}

pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format_args!("invalid JSON: {e}")))
}

pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format_args!("unknown variant: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use switchyard_core::EventType;

    #[test]
    fn enum_columns() {
        let ok: EventType = parse_enum("project-created", "events", "type").unwrap();
        assert_eq!(ok, EventType::ProjectCreated);

        let err = parse_enum::<EventType>("INVALID", "events", "type").unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { table: "events", column: "type", .. }));
    }

    #[test]
    fn json_columns() {
        let value: Value = parse_json(r#"{"key": "value"}"#, "events", "data").unwrap();
        assert_eq!(value["key"], "value");

        let err = parse_json::<Value>("not valid json", "features", "strategies").unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow { table: "features", column: "strategies", .. }
        ));
    }

    #[test]
    fn reader_decodes_flags_and_nulls() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let (on, off, missing) = conn
            .query_row("SELECT 1, 0, NULL", [], |row| {
                let r = RowReader::new(row, "features");
                Ok((
                    r.flag(0, "enabled").unwrap(),
                    r.flag(1, "archived").unwrap(),
                    r.get::<Option<String>>(2, "description").unwrap(),
                ))
            })
            .unwrap();
        assert!(on);
        assert!(!off);
        assert_eq!(missing, None);
    }

    #[test]
    fn reader_reports_type_mismatch() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT 'text'", [], |row| {
                Ok(RowReader::new(row, "projects").get::<i64>(0, "id"))
            })
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { table: "projects", column: "id", .. }));
    }
}
