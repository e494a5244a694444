//! Generic base for projection stores: a relational table derived entirely
//! from the event log and written only by its own store.

use std::marker::PhantomData;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use switchyard_core::{EventType, StoredEvent};

use crate::database::Database;
use crate::dispatch::EventHandler;
use crate::error::StoreError;

/// `column = value` pairs, ANDed together. Column names are always static
/// schema names, never caller input.
pub type Filter<'a> = &'a [(&'static str, Value)];

/// Table layout and row mapping for one entity kind.
///
/// `read_row` turns a SQL row (columns in `COLUMNS` order) into the storage
/// shape; `to_entity` turns the storage shape into the public entity. The
/// latter is partial over "row exists": `None` maps to `NotFound`, never to
/// an empty entity.
pub trait ProjectionSchema: Send + Sync + 'static {
    type Row;
    type Entity;

    /// Singular noun used in error messages.
    const ENTITY: &'static str;
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    const KEY: &'static str;
    /// Stable display order for listings.
    const ORDER_BY: &'static str;

    fn read_row(row: &rusqlite::Row<'_>) -> Result<Self::Row, StoreError>;

    fn to_entity(row: Option<Self::Row>) -> Result<Self::Entity, StoreError>;
}

/// An event handler that owns a projection table.
///
/// `apply` folds one event into the table over a connection the caller
/// already holds, so live dispatch and a transactional replay share one
/// code path. Its outcome goes to the dispatcher for logging, counting and
/// (for transient errors) retry; it is never surfaced to whoever stored
/// the event.
pub trait Projection: EventHandler {
    /// Event types this projection folds. Fixed for the process lifetime.
    fn subscriptions(&self) -> &'static [EventType];

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<(), StoreError>;

    /// Remove every row, leaving the empty state a replay starts from.
    fn reset(&self, conn: &Connection) -> Result<(), StoreError>;

    /// Rows a client can currently see.
    fn row_count(&self) -> Result<u64, StoreError>;
}

pub struct ProjectionTable<S> {
    db: Database,
    _schema: PhantomData<fn() -> S>,
}

impl<S: ProjectionSchema> ProjectionTable<S> {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            _schema: PhantomData,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Every row matching `filter`, mapped to entities, in display order.
    /// No rows is an empty vec, not an error.
    pub fn list(&self, filter: Filter<'_>) -> Result<Vec<S::Entity>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            S::COLUMNS.join(", "),
            S::TABLE,
            where_clause(filter, 1),
            S::ORDER_BY
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(filter.iter().map(|(_, v)| v)))?;
            let mut entities = Vec::new();
            while let Some(row) = rows.next()? {
                entities.push(S::to_entity(Some(S::read_row(row)?))?);
            }
            Ok(entities)
        })
    }

    /// The storage row for `key`, if any, further restricted by `filter`.
    pub fn find(&self, key: &str, filter: Filter<'_>) -> Result<Option<S::Row>, StoreError> {
        self.db.with_conn(|conn| self.find_in(conn, key, filter))
    }

    /// `find` over a connection the caller already holds.
    pub fn find_in(&self, conn: &Connection, key: &str, filter: Filter<'_>) -> Result<Option<S::Row>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1{} LIMIT 1",
            S::COLUMNS.join(", "),
            S::TABLE,
            S::KEY,
            and_clause(filter, 2)
        );
        let params = std::iter::once(Value::Text(key.to_string())).chain(filter.iter().map(|(_, v)| v.clone()));
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        match rows.next()? {
            Some(row) => Ok(Some(S::read_row(row)?)),
            None => Ok(None),
        }
    }

    /// Like `find`, mapped to the entity; `NotFound` when nothing matches.
    pub fn get(&self, key: &str, filter: Filter<'_>) -> Result<S::Entity, StoreError> {
        match self.find(key, filter)? {
            None => Err(StoreError::NotFound(format!("{} {key}", S::ENTITY))),
            row => S::to_entity(row),
        }
    }

    pub fn exists(&self, key: &str, filter: Filter<'_>) -> Result<bool, StoreError> {
        Ok(self.find(key, filter)?.is_some())
    }

    /// Insert one row. A duplicate key fails with `Conflict`.
    pub fn insert(&self, conn: &Connection, values: Filter<'_>) -> Result<(), StoreError> {
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            S::TABLE,
            columns.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?;
        Ok(())
    }

    /// Overwrite `changes` on the row for `key` matching `filter`.
    /// `NotFound` when no such row exists.
    pub fn update(
        &self,
        conn: &Connection,
        key: &str,
        filter: Filter<'_>,
        changes: Filter<'_>,
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = changes
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
            .collect();
        let key_param = changes.len() + 1;
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{key_param}{}",
            S::TABLE,
            assignments.join(", "),
            S::KEY,
            and_clause(filter, key_param + 1)
        );
        let params = changes
            .iter()
            .map(|(_, v)| v.clone())
            .chain(std::iter::once(Value::Text(key.to_string())))
            .chain(filter.iter().map(|(_, v)| v.clone()));
        if conn.execute(&sql, params_from_iter(params))? == 0 {
            return Err(StoreError::NotFound(format!("{} {key}", S::ENTITY)));
        }
        Ok(())
    }

    pub fn clear(&self, conn: &Connection) -> Result<usize, StoreError> {
        Ok(conn.execute(&format!("DELETE FROM {}", S::TABLE), [])?)
    }

    pub fn count(&self, filter: Filter<'_>) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}{}", S::TABLE, where_clause(filter, 1));
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(&sql, params_from_iter(filter.iter().map(|(_, v)| v)), |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

fn where_clause(filter: Filter<'_>, first: usize) -> String {
    if filter.is_empty() {
        return String::new();
    }
    format!(" WHERE {}", conditions(filter, first).join(" AND "))
}

fn and_clause(filter: Filter<'_>, first: usize) -> String {
    conditions(filter, first)
        .into_iter()
        .map(|c| format!(" AND {c}"))
        .collect()
}

fn conditions(filter: Filter<'_>, first: usize) -> Vec<String> {
    filter
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{column} = ?{}", first + i))
        .collect()
}
