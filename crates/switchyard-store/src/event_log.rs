use std::sync::Arc;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use tracing::{info, instrument, warn};

use switchyard_core::{EntityKind, EventPayload, EventType, NewEvent, StoredEvent};

use crate::database::Database;
use crate::dispatch::Dispatcher;
use crate::error::StoreError;
use crate::projection::Projection;
use crate::row_helpers::{self, RowReader};

const EVENT_COLUMNS: &str = "id, type, created_by, data, created_at";

/// Page size used when replaying the log into a projection.
const REPLAY_PAGE: usize = 500;

/// Outcome of replaying the log into one projection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub projection: String,
    pub replayed: u64,
    pub failed: u64,
    pub rows: u64,
}

struct Inner {
    db: Database,
    dispatcher: Dispatcher,
    /// Serializes append + dispatch so each projection sees its events in
    /// append order, and keeps new events out of a running replay.
    write_lane: tokio::sync::Mutex<()>,
}

/// The append-only event log: source of truth for every projection.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    pub fn new(db: Database, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                dispatcher,
                write_lane: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Durably append an event and return it with its assigned id. Does not
    /// dispatch; see [`store`](Self::store).
    #[instrument(skip(self, event), fields(event_type = %event.event_type()))]
    pub fn append(&self, event: &NewEvent) -> Result<StoredEvent, StoreError> {
        let data = serde_json::to_string(&event.payload.data()?)?;
        let created_at = Utc::now().to_rfc3339();
        let event_type = event.event_type();

        let id = self.inner.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (type, created_by, entity_key, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    event_type.as_str(),
                    event.created_by,
                    event.payload.entity_key(),
                    data,
                    created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        if let Some(metrics) = self.inner.dispatcher.metrics() {
            metrics.counter_inc("events.appended", &[("type", event_type.as_str())], 1);
        }

        Ok(StoredEvent {
            id,
            created_by: event.created_by.clone(),
            created_at,
            payload: event.payload.clone(),
        })
    }

    /// Append an event, then hand it to every subscribed projection.
    ///
    /// Returns once the event is durable and dispatch has finished. The work
    /// runs on its own task: dropping this future does not cancel the append
    /// or the dispatch. Projection failures are logged and never change the
    /// result; an `Err` means the event was not recorded.
    pub async fn store(&self, event: NewEvent) -> Result<StoredEvent, StoreError> {
        let log = self.clone();
        tokio::spawn(async move { log.append_and_dispatch(event).await })
            .await
            .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }

    async fn append_and_dispatch(&self, event: NewEvent) -> Result<StoredEvent, StoreError> {
        let _lane = self.inner.write_lane.lock().await;
        let stored = self.append(&event)?;
        let report = self.inner.dispatcher.emit(&stored).await;
        if !report.is_clean() {
            warn!(
                event_id = stored.id,
                event_type = %stored.event_type(),
                delivered = report.delivered,
                failed = report.failures.len(),
                "event stored; some projections did not apply it"
            );
        }
        Ok(stored)
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<StoredEvent, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
        self.query(&sql, vec![Value::Integer(id)])?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("event {id}")))
    }

    /// Latest events, newest first.
    #[instrument(skip(self))]
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC LIMIT ?1");
        self.query(&sql, vec![Value::Integer(limit as i64)])
    }

    /// History of one project or feature, newest first. Project ids and
    /// feature names may coincide, so the kind scopes the key.
    #[instrument(skip(self))]
    pub fn for_entity(&self, kind: EntityKind, entity_key: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let types = kind.event_types();
        let mut params = vec![Value::Text(entity_key.to_string())];
        params.extend(types.iter().map(|t| Value::Text(t.as_str().to_string())));
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE entity_key = ?1 AND type IN ({}) ORDER BY id DESC",
            placeholders(2, types.len())
        );
        self.query(&sql, params)
    }

    /// Events with `id > after_id`, oldest first, restricted to `types`
    /// unless it is empty.
    #[instrument(skip(self, types))]
    pub fn list_after(
        &self,
        after_id: i64,
        types: &[EventType],
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.db.with_conn(|conn| list_after_in(conn, after_id, types, limit))
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.inner.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))? as u64)
        })
    }

    /// Rebuild a projection from an empty state by re-applying every event it
    /// subscribes to, in log order.
    ///
    /// Holds the write lane, so no event is appended mid-replay, and runs in
    /// one transaction, so readers never see a half-built table. Events the
    /// projection rejects as stale are logged and counted; any other error
    /// rolls the projection back to its previous rows.
    pub async fn rebuild<P: Projection + ?Sized>(&self, projection: &P) -> Result<RebuildReport, StoreError> {
        let _lane = self.inner.write_lane.lock().await;
        let (replayed, failed) = self.inner.db.transaction(|conn| {
            projection.reset(conn)?;
            let (mut replayed, mut failed) = (0, 0);
            let mut after = 0;
            loop {
                let page = list_after_in(conn, after, projection.subscriptions(), REPLAY_PAGE)?;
                let Some(last) = page.last() else {
                    break;
                };
                after = last.id;
                for event in &page {
                    match projection.apply(conn, event) {
                        Ok(()) => replayed += 1,
                        Err(e) if e.is_skippable() => {
                            warn!(
                                event_id = event.id,
                                handler = %projection.name(),
                                kind = e.error_kind(),
                                error = %e,
                                "replay skipped event"
                            );
                            failed += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok((replayed, failed))
        })?;

        let report = RebuildReport {
            projection: projection.name().to_string(),
            replayed,
            failed,
            rows: projection.row_count()?,
        };
        info!(
            projection = %report.projection,
            replayed = report.replayed,
            failed = report.failed,
            rows = report.rows,
            "projection rebuilt"
        );
        Ok(report)
    }

    fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.db.with_conn(|conn| query_events(conn, sql, params))
    }
}

fn list_after_in(
    conn: &Connection,
    after_id: i64,
    types: &[EventType],
    limit: usize,
) -> Result<Vec<StoredEvent>, StoreError> {
    let mut params = vec![Value::Integer(after_id)];
    let type_filter = if types.is_empty() {
        String::new()
    } else {
        params.extend(types.iter().map(|t| Value::Text(t.as_str().to_string())));
        format!(" AND type IN ({})", placeholders(2, types.len()))
    };
    params.push(Value::Integer(limit as i64));
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id > ?1{type_filter} ORDER BY id ASC LIMIT ?{}",
        params.len()
    );
    query_events(conn, &sql, params)
}

fn query_events(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<StoredEvent>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(row_to_event(row)?);
    }
    Ok(events)
}

/// `?first, ?first+1, ...` for `n` parameters.
fn placeholders(first: usize, n: usize) -> String {
    (first..first + n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<StoredEvent, StoreError> {
    let r = RowReader::new(row, "events");
    let event_type: EventType = row_helpers::parse_enum(&r.get::<String>(1, "type")?, "events", "type")?;
    let data: serde_json::Value = row_helpers::parse_json(&r.get::<String>(3, "data")?, "events", "data")?;
    let payload =
        EventPayload::from_parts(event_type, data).map_err(|e| row_helpers::corrupt("events", "data", e))?;

    Ok(StoredEvent {
        id: r.get(0, "id")?,
        created_by: r.get(2, "created_by")?,
        created_at: r.get(4, "created_at")?,
        payload,
    })
}
