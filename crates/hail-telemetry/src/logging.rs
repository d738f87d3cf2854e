use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        session_id TEXT,
        identity_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
    CREATE INDEX IF NOT EXISTS idx_logs_identity ON logs(identity_id);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub identity_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub identity_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs, tagged with the session and
/// identity they concern so a reconnect storm can be traced per rider.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist one record. The `id` field is ignored.
    pub fn insert(&self, record: &LogRecord) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, identity_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.session_id,
                record.identity_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, identity_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();

        let mut filter = |clause: &str, value: Option<String>| {
            if let Some(value) = value {
                params.push(value);
                sql.push_str(&format!(" AND {clause} ?{}", params.len()));
            }
        };
        filter("level =", q.level.clone());
        filter("target LIKE", q.target.as_ref().map(|t| format!("%{t}%")));
        filter("session_id =", q.session_id.clone());
        filter("identity_id =", q.identity_id.clone());
        filter("timestamp >=", q.since.clone());

        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                identity_id: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }

    /// Delete records older than `timestamp` (RFC 3339). Returns rows removed.
    pub fn prune_before(&self, timestamp: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM logs WHERE timestamp < ?1", [timestamp])
    }

    /// Delete records older than `max_age`.
    pub fn prune_older_than(&self, max_age: chrono::Duration) -> Result<usize, rusqlite::Error> {
        let cutoff = Utc::now() - max_age;
        self.prune_before(&cutoff.to_rfc3339())
    }
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    correlation: SpanFields,
}

impl FieldVisitor {
    fn record_value(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        self.record_str(field, val.trim_matches('"'));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "session_id" => self.correlation.session_id = Some(value.to_string()),
            "identity_id" => self.correlation.identity_id = Some(value.to_string()),
            _ => self.record_value(field, serde_json::Value::String(value.to_string())),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.record_value(field, serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        // Fill correlation ids from the innermost enclosing span that has them.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    visitor.correlation.fill_from(fields);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogRecord {
            id: 0,
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            session_id: visitor.correlation.session_id,
            identity_id: visitor.correlation.identity_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if !visitor.correlation.is_empty() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(visitor.correlation);
            }
        }
    }
}

/// Correlation ids carried on spans and inherited by child events.
#[derive(Default)]
struct SpanFields {
    session_id: Option<String>,
    identity_id: Option<String>,
}

impl SpanFields {
    fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.identity_id.is_none()
    }

    fn fill_from(&mut self, other: &SpanFields) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&other.session_id);
        }
        if self.identity_id.is_none() {
            self.identity_id.clone_from(&other.identity_id);
        }
    }
}
