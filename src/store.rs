//! Signal and session persistence
//!
//! Embedded sqlite behind a single writer task. Producers enqueue jobs into
//! a bounded backlog; the writer drains it in order. The pipeline never
//! blocks on the store: past the backlog limit the oldest pending writes are
//! dropped and counted. Reads go straight through the connection lock.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Direction, Mode, Outcome, SignalType};

/// Default bound on pending writes
pub const DEFAULT_BACKLOG: usize = 10_000;

/// Attempts per job before it is dropped
const MAX_ATTEMPTS: u32 = 3;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    signal_type TEXT NOT NULL,
    direction TEXT NOT NULL,
    price_at_emit REAL NOT NULL,
    price_after_1m REAL,
    price_after_5m REAL,
    outcome TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_signals_timestamp ON signals(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_signals_type ON signals(signal_type, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_signals_session ON signals(session_id);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    mode TEXT NOT NULL,
    symbols TEXT NOT NULL,
    session_high REAL,
    session_low REAL,
    total_volume INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at DESC);
"#;

/// Persisted signal record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: Uuid,
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub timestamp: u64,
    #[serde(rename = "signalType")]
    pub signal_type: SignalType,
    pub direction: Direction,
    #[serde(rename = "priceAtEmit")]
    pub price_at_emit: f64,
    #[serde(rename = "priceAfter1m")]
    pub price_after_1m: Option<f64>,
    #[serde(rename = "priceAfter5m")]
    pub price_after_5m: Option<f64>,
    pub outcome: Outcome,
}

/// Persisted session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: Uuid,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "endedAt")]
    pub ended_at: Option<String>,
    pub mode: Mode,
    pub symbols: String,
    #[serde(rename = "sessionHigh")]
    pub session_high: Option<f64>,
    #[serde(rename = "sessionLow")]
    pub session_low: Option<f64>,
    #[serde(rename = "totalVolume")]
    pub total_volume: u64,
}

/// Write operations accepted by the writer task
#[derive(Debug, Clone)]
pub enum StoreJob {
    InsertSignal(SignalRow),
    MarkSignal1m {
        id: Uuid,
        price_after_1m: f64,
    },
    ResolveSignal {
        id: Uuid,
        price_after_1m: f64,
        price_after_5m: f64,
        outcome: Outcome,
    },
    OpenSession(SessionRow),
    CloseSession {
        id: Uuid,
        ended_at: String,
        session_high: f64,
        session_low: f64,
        total_volume: u64,
    },
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job: StoreJob,
    attempts: u32,
}

/// Filter for signal queries and exports
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SignalQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub signal_type: Option<String>,
    pub direction: Option<String>,
    pub outcome: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Per-(type, direction) aggregate row for /api/stats
#[derive(Debug, Clone, Serialize)]
pub struct SignalStatsRow {
    #[serde(rename = "signalType")]
    pub signal_type: String,
    pub direction: String,
    pub count: u32,
    pub wins: u32,
    pub losses: u32,
    pub breakeven: u32,
    pub pending: u32,
    #[serde(rename = "winRate")]
    pub win_rate: f64,
}

struct StoreInner {
    conn: Mutex<Connection>,
    queue: Mutex<VecDeque<QueuedJob>>,
    notify: Notify,
    dropped: AtomicU64,
    backlog: usize,
    closing: AtomicBool,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                backlog: DEFAULT_BACKLOG,
                closing: AtomicBool::new(false),
            }),
        })
    }

    /// Queue a write without blocking. Past the backlog bound the oldest
    /// pending job is discarded and counted.
    pub fn enqueue(&self, job: StoreJob) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.backlog {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(QueuedJob { job, attempts: 0 });
        }
        self.inner.notify.notify_one();
    }

    /// Writes discarded due to backlog overflow or persistent failure
    pub fn dropped_writes(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Single writer: drains the backlog in order until `close` is called
    /// and the queue is empty.
    pub async fn run_writer(self) {
        info!("Store writer started");
        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(mut queued) => {
                    if let Err(e) = self.execute(&queued.job) {
                        queued.attempts += 1;
                        if queued.attempts >= MAX_ATTEMPTS {
                            warn!("Store write dropped after {} attempts: {}", queued.attempts, e);
                            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        } else {
                            warn!("Store write failed, retrying: {}", e);
                            // Back to the front: later updates must not
                            // overtake the write they depend on
                            self.inner.queue.lock().push_front(queued);
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        }
                    }
                }
                None => {
                    if self.inner.closing.load(Ordering::Acquire) {
                        break;
                    }
                    self.inner.notify.notified().await;
                }
            }
        }
        info!("Store writer stopped");
    }

    /// Ask the writer to exit once the backlog is flushed
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    fn execute(&self, job: &StoreJob) -> Result<()> {
        let conn = self.inner.conn.lock();
        match job {
            StoreJob::InsertSignal(row) => {
                conn.execute(
                    "INSERT OR REPLACE INTO signals
                     (id, session_id, created_at, timestamp, signal_type, direction,
                      price_at_emit, price_after_1m, price_after_5m, outcome)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        row.id.to_string(),
                        row.session_id.to_string(),
                        row.created_at,
                        row.timestamp as i64,
                        row.signal_type.as_str(),
                        row.direction.as_str(),
                        row.price_at_emit,
                        row.price_after_1m,
                        row.price_after_5m,
                        row.outcome.as_str(),
                    ],
                )?;
            }
            StoreJob::MarkSignal1m { id, price_after_1m } => {
                conn.execute(
                    "UPDATE signals SET price_after_1m = ?2 WHERE id = ?1",
                    params![id.to_string(), price_after_1m],
                )?;
            }
            StoreJob::ResolveSignal {
                id,
                price_after_1m,
                price_after_5m,
                outcome,
            } => {
                conn.execute(
                    "UPDATE signals SET price_after_1m = ?2, price_after_5m = ?3,
                     outcome = ?4 WHERE id = ?1",
                    params![
                        id.to_string(),
                        price_after_1m,
                        price_after_5m,
                        outcome.as_str()
                    ],
                )?;
            }
            StoreJob::OpenSession(row) => {
                conn.execute(
                    "INSERT OR REPLACE INTO sessions
                     (id, started_at, ended_at, mode, symbols, session_high,
                      session_low, total_volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id.to_string(),
                        row.started_at,
                        row.ended_at,
                        row.mode.as_str(),
                        row.symbols,
                        row.session_high,
                        row.session_low,
                        row.total_volume as i64,
                    ],
                )?;
            }
            StoreJob::CloseSession {
                id,
                ended_at,
                session_high,
                session_low,
                total_volume,
            } => {
                conn.execute(
                    "UPDATE sessions SET ended_at = ?2, session_high = ?3,
                     session_low = ?4, total_volume = ?5 WHERE id = ?1",
                    params![
                        id.to_string(),
                        ended_at,
                        session_high,
                        session_low,
                        *total_volume as i64,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Flush everything currently queued, synchronously. Test helper and
    /// shutdown path.
    pub fn flush_blocking(&self) {
        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(queued) => {
                    if let Err(e) = self.execute(&queued.job) {
                        warn!("Store write dropped during flush: {}", e);
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }

    fn build_where(query: &SignalQuery) -> (String, Vec<rusqlite::types::Value>) {
        use rusqlite::types::Value;

        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(ref t) = query.signal_type {
            clauses.push(format!("signal_type = ?{}", args.len() + 1));
            args.push(Value::Text(t.clone()));
        }
        if let Some(ref d) = query.direction {
            clauses.push(format!("direction = ?{}", args.len() + 1));
            args.push(Value::Text(d.clone()));
        }
        if let Some(ref o) = query.outcome {
            clauses.push(format!("outcome = ?{}", args.len() + 1));
            args.push(Value::Text(o.clone()));
        }
        if let Some(ms) = query.start_date.as_deref().and_then(parse_date_ms) {
            clauses.push(format!("timestamp >= ?{}", args.len() + 1));
            args.push(Value::Integer(ms));
        }
        if let Some(ms) = query.end_date.as_deref().and_then(parse_date_ms) {
            clauses.push(format!("timestamp <= ?{}", args.len() + 1));
            args.push(Value::Integer(ms));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_sql, args)
    }

    pub fn query_signals(&self, query: &SignalQuery) -> Result<Vec<SignalRow>> {
        let (where_sql, mut args) = Self::build_where(query);
        let limit = query.limit.unwrap_or(100).min(10_000);
        let offset = query.offset.unwrap_or(0);
        let sql = format!(
            "SELECT id, session_id, created_at, timestamp, signal_type, direction,
             price_at_emit, price_after_1m, price_after_5m, outcome
             FROM signals{} ORDER BY timestamp DESC LIMIT ?{} OFFSET ?{}",
            where_sql,
            args.len() + 1,
            args.len() + 2
        );
        args.push(rusqlite::types::Value::Integer(limit as i64));
        args.push(rusqlite::types::Value::Integer(offset as i64));

        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok(SignalRow {
                id: row
                    .get::<_, String>(0)?
                    .parse()
                    .unwrap_or_else(|_| Uuid::nil()),
                session_id: row
                    .get::<_, String>(1)?
                    .parse()
                    .unwrap_or_else(|_| Uuid::nil()),
                created_at: row.get(2)?,
                timestamp: row.get::<_, i64>(3)? as u64,
                signal_type: SignalType::parse(&row.get::<_, String>(4)?)
                    .unwrap_or(SignalType::DeltaFlip),
                direction: if row.get::<_, String>(5)? == "bullish" {
                    Direction::Bullish
                } else {
                    Direction::Bearish
                },
                price_at_emit: row.get(6)?,
                price_after_1m: row.get(7)?,
                price_after_5m: row.get(8)?,
                outcome: Outcome::parse(&row.get::<_, String>(9)?).unwrap_or(Outcome::Pending),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn count_signals(&self, query: &SignalQuery) -> Result<u32> {
        let (where_sql, args) = Self::build_where(query);
        let sql = format!("SELECT COUNT(*) FROM signals{}", where_sql);
        let conn = self.inner.conn.lock();
        let count: u32 = conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(count)
    }

    /// Aggregate stats grouped by type and direction
    pub fn signal_stats(&self) -> Result<Vec<SignalStatsRow>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT signal_type, direction,
                    COUNT(*),
                    SUM(CASE WHEN outcome = 'win' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN outcome = 'loss' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN outcome = 'breakeven' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN outcome = 'pending' THEN 1 ELSE 0 END)
             FROM signals GROUP BY signal_type, direction
             ORDER BY signal_type, direction",
        )?;
        let rows = stmt.query_map([], |row| {
            let wins: u32 = row.get(3)?;
            let losses: u32 = row.get(4)?;
            let resolved = wins + losses;
            Ok(SignalStatsRow {
                signal_type: row.get(0)?,
                direction: row.get(1)?,
                count: row.get(2)?,
                wins,
                losses,
                breakeven: row.get(5)?,
                pending: row.get(6)?,
                win_rate: if resolved > 0 {
                    wins as f64 / resolved as f64
                } else {
                    0.0
                },
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn query_sessions(&self, limit: u32) -> Result<Vec<SessionRow>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, ended_at, mode, symbols, session_high,
             session_low, total_volume
             FROM sessions ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(SessionRow {
                id: row
                    .get::<_, String>(0)?
                    .parse()
                    .unwrap_or_else(|_| Uuid::nil()),
                started_at: row.get(1)?,
                ended_at: row.get(2)?,
                mode: match row.get::<_, String>(3)?.as_str() {
                    "live" => Mode::Live,
                    "replay" => Mode::Replay,
                    _ => Mode::Demo,
                },
                symbols: row.get(4)?,
                session_high: row.get(5)?,
                session_low: row.get(6)?,
                total_volume: row.get::<_, i64>(7)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// CSV export of the filtered signal set
    pub fn export_csv(&self, query: &SignalQuery) -> Result<String> {
        let signals = self.query_signals(query)?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "id",
            "session_id",
            "created_at",
            "timestamp",
            "signal_type",
            "direction",
            "price_at_emit",
            "price_after_1m",
            "price_after_5m",
            "outcome",
        ])?;
        for s in &signals {
            writer.write_record([
                s.id.to_string(),
                s.session_id.to_string(),
                s.created_at.clone(),
                s.timestamp.to_string(),
                s.signal_type.as_str().to_string(),
                s.direction.as_str().to_string(),
                s.price_at_emit.to_string(),
                s.price_after_1m.map(|p| p.to_string()).unwrap_or_default(),
                s.price_after_5m.map(|p| p.to_string()).unwrap_or_default(),
                s.outcome.as_str().to_string(),
            ])?;
        }
        let bytes = writer.into_inner().context("CSV flush failed")?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Parse a filter date (RFC3339 or YYYY-MM-DD) into epoch milliseconds
fn parse_date_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: u128, signal_type: SignalType, direction: Direction, ts: u64) -> SignalRow {
        SignalRow {
            id: Uuid::from_u128(id),
            session_id: Uuid::from_u128(999),
            created_at: "2025-01-03T14:30:00+00:00".to_string(),
            timestamp: ts,
            signal_type,
            direction,
            price_at_emit: 21500.0,
            price_after_1m: None,
            price_after_5m: None,
            outcome: Outcome::Pending,
        }
    }

    #[test]
    fn test_insert_and_query() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue(StoreJob::InsertSignal(signal(
            1,
            SignalType::DeltaFlip,
            Direction::Bullish,
            1000,
        )));
        store.enqueue(StoreJob::InsertSignal(signal(
            2,
            SignalType::Absorption,
            Direction::Bearish,
            2000,
        )));
        store.flush_blocking();

        let all = store.query_signals(&SignalQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].id, Uuid::from_u128(2));

        let flips = store
            .query_signals(&SignalQuery {
                signal_type: Some("delta_flip".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].direction, Direction::Bullish);
    }

    #[test]
    fn test_outcome_updates() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue(StoreJob::InsertSignal(signal(
            1,
            SignalType::Confluence,
            Direction::Bullish,
            1000,
        )));
        store.enqueue(StoreJob::MarkSignal1m {
            id: Uuid::from_u128(1),
            price_after_1m: 21510.0,
        });
        store.enqueue(StoreJob::ResolveSignal {
            id: Uuid::from_u128(1),
            price_after_1m: 21510.0,
            price_after_5m: 21520.0,
            outcome: Outcome::Win,
        });
        store.flush_blocking();

        let rows = store.query_signals(&SignalQuery::default()).unwrap();
        assert_eq!(rows[0].outcome, Outcome::Win);
        assert_eq!(rows[0].price_after_1m, Some(21510.0));
        assert_eq!(rows[0].price_after_5m, Some(21520.0));
    }

    #[test]
    fn test_stats_grouping() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            store.enqueue(StoreJob::InsertSignal(signal(
                i,
                SignalType::DeltaFlip,
                Direction::Bullish,
                i as u64,
            )));
        }
        store.enqueue(StoreJob::ResolveSignal {
            id: Uuid::from_u128(0),
            price_after_1m: 21501.0,
            price_after_5m: 21502.0,
            outcome: Outcome::Win,
        });
        store.flush_blocking();

        let stats = store.signal_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].wins, 1);
        assert_eq!(stats[0].pending, 2);
        assert_eq!(stats[0].win_rate, 1.0);
    }

    #[test]
    fn test_sessions_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::from_u128(7);
        store.enqueue(StoreJob::OpenSession(SessionRow {
            id,
            started_at: "2025-01-03T14:30:00+00:00".to_string(),
            ended_at: None,
            mode: Mode::Demo,
            symbols: "NQ.c.0".to_string(),
            session_high: None,
            session_low: None,
            total_volume: 0,
        }));
        store.enqueue(StoreJob::CloseSession {
            id,
            ended_at: "2025-01-03T16:00:00+00:00".to_string(),
            session_high: 21600.0,
            session_low: 21400.0,
            total_volume: 123456,
        });
        store.flush_blocking();

        let sessions = store.query_sessions(10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].mode, Mode::Demo);
        assert_eq!(sessions[0].total_volume, 123456);
        assert!(sessions[0].ended_at.is_some());
    }

    #[test]
    fn test_backlog_drops_oldest() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..(DEFAULT_BACKLOG + 5) {
            store.enqueue(StoreJob::MarkSignal1m {
                id: Uuid::from_u128(i as u128),
                price_after_1m: 0.0,
            });
        }
        assert_eq!(store.queue_len(), DEFAULT_BACKLOG);
        assert_eq!(store.dropped_writes(), 5);
    }

    #[test]
    fn test_date_filter() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue(StoreJob::InsertSignal(signal(
            1,
            SignalType::DeltaFlip,
            Direction::Bullish,
            1_735_900_000_000, // 2025-01-03
        )));
        store.flush_blocking();

        let hit = store
            .query_signals(&SignalQuery {
                start_date: Some("2025-01-01".to_string()),
                end_date: Some("2025-01-05".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = store
            .query_signals(&SignalQuery {
                start_date: Some("2025-02-01".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn test_csv_export_reimports_identically() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue(StoreJob::InsertSignal(signal(
            1,
            SignalType::StackedImbalance,
            Direction::Bearish,
            5000,
        )));
        store.flush_blocking();

        let csv_text = store.export_csv(&SignalQuery::default()).unwrap();
        let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
        let rows: Vec<csv::StringRecord> =
            reader.records().collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][4], "stacked_imbalance");
        assert_eq!(&rows[0][5], "bearish");
        assert_eq!(&rows[0][9], "pending");
    }
}
