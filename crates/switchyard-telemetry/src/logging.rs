use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS warn_log (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    at       TEXT NOT NULL,
    level    TEXT NOT NULL,
    target   TEXT NOT NULL,
    message  TEXT NOT NULL,
    event_id INTEGER,
    handler  TEXT,
    span     TEXT,
    extra    TEXT
);
CREATE INDEX IF NOT EXISTS warn_log_by_event ON warn_log(event_id, handler);
CREATE INDEX IF NOT EXISTS warn_log_by_time ON warn_log(at);
";

/// One persisted warn or error line. `id` is zero until stored.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    /// RFC 3339, UTC.
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub event_id: Option<i64>,
    pub handler: Option<String>,
    pub span: Option<String>,
    /// Every event field other than message, `event_id` and `handler`.
    pub extra: Option<Json>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let extra: Option<String> = row.get(8)?;
        Ok(Self {
            id: row.get(0)?,
            at: row.get(1)?,
            level: row.get(2)?,
            target: row.get(3)?,
            message: row.get(4)?,
            event_id: row.get(5)?,
            handler: row.get(6)?,
            span: row.get(7)?,
            extra: extra.and_then(|text| serde_json::from_str(&text).ok()),
        })
    }
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring of the tracing target.
    pub target: Option<String>,
    pub event_id: Option<i64>,
    pub handler: Option<String>,
    /// RFC 3339 lower bound on `at`.
    pub since: Option<String>,
    /// Defaults to 100.
    pub limit: Option<u32>,
}

/// Warn+ log store. Projection failures land here tagged with the event id
/// and handler, so a skipped delivery can be traced after the fact.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = db_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        Self::from_conn(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, record: &LogRecord) -> rusqlite::Result<usize> {
        let extra = record.extra.as_ref().map(Json::to_string);
        self.conn.lock().execute(
            "INSERT INTO warn_log (at, level, target, message, event_id, handler, span, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.at,
                record.level,
                record.target,
                record.message,
                record.event_id,
                record.handler,
                record.span,
                extra,
            ],
        )
    }

    /// Matching records, newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        let mut add = |clause: &str, arg: Value| {
            args.push(arg);
            clauses.push(format!("{clause} ?{}", args.len()));
        };
        if let Some(level) = &q.level {
            add("level =", Value::Text(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            add("target LIKE", Value::Text(format!("%{target}%")));
        }
        if let Some(event_id) = q.event_id {
            add("event_id =", Value::Integer(event_id));
        }
        if let Some(handler) = &q.handler {
            add("handler =", Value::Text(handler.clone()));
        }
        if let Some(since) = &q.since {
            add("at >=", Value::Text(since.clone()));
        }

        let mut sql = String::from("SELECT id, at, level, target, message, event_id, handler, span, extra FROM warn_log");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), LogRecord::from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<u64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM warn_log", [], |row| row.get(0))
    }
}

/// Subscriber layer feeding a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// `event_id` and `handler` as seen on a span, inherited by events inside it.
#[derive(Clone, Default)]
struct Correlation {
    event_id: Option<i64>,
    handler: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.event_id.is_none() && self.handler.is_none()
    }

    fn fill_from(&mut self, outer: &Correlation) {
        if self.event_id.is_none() {
            self.event_id = outer.event_id;
        }
        if self.handler.is_none() {
            self.handler.clone_from(&outer.handler);
        }
    }
}

#[derive(Default)]
struct Fields {
    message: Option<String>,
    correlation: Correlation,
    extra: Map<String, Json>,
}

impl Fields {
    fn put(&mut self, field: &Field, value: Json) {
        match (field.name(), value) {
            ("message", Json::String(s)) => self.message = Some(s),
            ("handler", Json::String(s)) => self.correlation.handler = Some(s),
            ("event_id", Json::Number(n)) => self.correlation.event_id = n.as_i64(),
            ("event_id", Json::String(s)) => self.correlation.event_id = s.parse().ok(),
            (name, value) => {
                self.extra.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%x` values arrive unquoted; plain strings sent through Debug do not.
        let text = format!("{value:?}");
        let text = match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            Some(inner) => inner.to_string(),
            None => text,
        };
        self.put(field, Json::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Json::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Json::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Json::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Json::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Json::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        if fields.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.correlation);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut fields = Fields::default();
        event.record(&mut fields);

        let mut span = None;
        if let Some(scope) = ctx.event_scope(event) {
            for (depth, outer) in scope.enumerate() {
                if depth == 0 {
                    span = Some(format!("{}#{}", outer.name(), outer.id().into_u64()));
                }
                if let Some(seen) = outer.extensions().get::<Correlation>() {
                    fields.correlation.fill_from(seen);
                }
            }
        }

        let record = LogRecord {
            id: 0,
            at: Utc::now().to_rfc3339(),
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message: fields.message.unwrap_or_default(),
            event_id: fields.correlation.event_id,
            handler: fields.correlation.handler,
            span,
            extra: (!fields.extra.is_empty()).then(|| Json::Object(fields.extra)),
        };
        // Nowhere better to report a failed log write.
        let _ = self.sink.write(&record);
    }
}
