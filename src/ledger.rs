//! Durable usage accounting.
//!
//! Every completed call appends one [`UsageRecord`] row to a SQLite table;
//! rows are never mutated. A connection is opened per operation and released
//! when it goes out of scope — writes are short, and the gateway never holds
//! a long-lived handle that could pin the file.
//!
//! All aggregate queries return zeros (never nulls) when the requested slice
//! is empty.

use std::path::PathBuf;

use anyhow::Context;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

/// One metered call.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub api_key: String,
    /// Public model name (not the upstream id).
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: f64,
    pub session_id: Option<String>,
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Current wall-clock time as fractional epoch seconds.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Aggregate over one key's calls.
#[derive(Debug, Serialize, PartialEq)]
pub struct KeyUsage {
    pub request_count: i64,
    pub total_input: i64,
    pub total_output: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
}

/// Aggregate over one model's calls (no input/output split).
#[derive(Debug, Serialize, PartialEq)]
pub struct ModelUsage {
    pub request_count: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
}

/// Aggregate over one session, with its first/last request times.
#[derive(Debug, Serialize, PartialEq)]
pub struct SessionUsage {
    pub request_count: i64,
    pub total_input: i64,
    pub total_output: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
    pub first_request: f64,
    pub last_request: f64,
}

/// One row of a key's per-model breakdown.
#[derive(Debug, Serialize, PartialEq)]
pub struct ModelBreakdown {
    pub model: String,
    pub request_count: i64,
    pub total_input: i64,
    pub total_output: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
}

/// Gateway-wide aggregate.
#[derive(Debug, Serialize, PartialEq)]
pub struct GlobalUsage {
    pub total_requests: i64,
    pub active_keys: i64,
    pub active_models: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
}

/// Append-only SQLite usage table.
pub struct UsageLedger {
    db_path: PathBuf,
}

impl UsageLedger {
    /// Open (creating if needed) the ledger at `db_path` and ensure the
    /// schema exists.
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let ledger = Self { db_path };
        let conn = ledger.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 api_key       TEXT NOT NULL,
                 model         TEXT NOT NULL,
                 input_tokens  INTEGER NOT NULL,
                 output_tokens INTEGER NOT NULL,
                 total_tokens  INTEGER NOT NULL,
                 latency_ms    REAL NOT NULL,
                 session_id    TEXT,
                 timestamp     REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_usage_key_time ON usage (api_key, timestamp);
             CREATE INDEX IF NOT EXISTS idx_usage_model_time ON usage (model, timestamp);
             CREATE INDEX IF NOT EXISTS idx_usage_session ON usage (session_id);",
        )
        .context("initializing usage schema")?;
        Ok(ledger)
    }

    fn conn(&self) -> anyhow::Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("opening {}", self.db_path.display()))
    }

    /// Append one record.
    pub fn record(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO usage
                 (api_key, model, input_tokens, output_tokens, total_tokens,
                  latency_ms, session_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.api_key,
                record.model,
                record.input_tokens,
                record.output_tokens,
                record.total_tokens,
                record.latency_ms,
                record.session_id,
                record.timestamp,
            ],
        )
        .context("inserting usage record")?;
        Ok(())
    }

    /// Aggregate usage for one key since `since`.
    pub fn by_key(&self, api_key: &str, since: f64) -> anyhow::Result<KeyUsage> {
        let conn = self.conn()?;
        let usage = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(AVG(latency_ms), 0)
                 FROM usage WHERE api_key = ?1 AND timestamp > ?2",
                params![api_key, since],
                |row| {
                    Ok(KeyUsage {
                        request_count: row.get(0)?,
                        total_input: row.get(1)?,
                        total_output: row.get(2)?,
                        total_tokens: row.get(3)?,
                        avg_latency_ms: row.get(4)?,
                    })
                },
            )
            .context("querying usage by key")?;
        Ok(usage)
    }

    /// Aggregate usage for one model since `since`.
    pub fn by_model(&self, model: &str, since: f64) -> anyhow::Result<ModelUsage> {
        let conn = self.conn()?;
        let usage = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(AVG(latency_ms), 0)
                 FROM usage WHERE model = ?1 AND timestamp > ?2",
                params![model, since],
                |row| {
                    Ok(ModelUsage {
                        request_count: row.get(0)?,
                        total_tokens: row.get(1)?,
                        avg_latency_ms: row.get(2)?,
                    })
                },
            )
            .context("querying usage by model")?;
        Ok(usage)
    }

    /// Aggregate usage for one session, including first/last request times.
    pub fn by_session(&self, session_id: &str) -> anyhow::Result<SessionUsage> {
        let conn = self.conn()?;
        let usage = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(AVG(latency_ms), 0),
                        COALESCE(MIN(timestamp), 0),
                        COALESCE(MAX(timestamp), 0)
                 FROM usage WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionUsage {
                        request_count: row.get(0)?,
                        total_input: row.get(1)?,
                        total_output: row.get(2)?,
                        total_tokens: row.get(3)?,
                        avg_latency_ms: row.get(4)?,
                        first_request: row.get(5)?,
                        last_request: row.get(6)?,
                    })
                },
            )
            .context("querying usage by session")?;
        Ok(usage)
    }

    /// Per-model breakdown of one key's usage since `since`.
    pub fn breakdown(&self, api_key: &str, since: f64) -> anyhow::Result<Vec<ModelBreakdown>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT model,
                        COUNT(*),
                        SUM(input_tokens),
                        SUM(output_tokens),
                        SUM(total_tokens),
                        AVG(latency_ms)
                 FROM usage
                 WHERE api_key = ?1 AND timestamp > ?2
                 GROUP BY model
                 ORDER BY model",
            )
            .context("preparing breakdown query")?;
        let rows = stmt
            .query_map(params![api_key, since], |row: &Row<'_>| {
                Ok(ModelBreakdown {
                    model: row.get(0)?,
                    request_count: row.get(1)?,
                    total_input: row.get(2)?,
                    total_output: row.get(3)?,
                    total_tokens: row.get(4)?,
                    avg_latency_ms: row.get(5)?,
                })
            })
            .context("querying usage breakdown")?
            .collect::<Result<Vec<_>, _>>()
            .context("reading breakdown rows")?;
        Ok(rows)
    }

    /// Gateway-wide usage since `since`, with distinct key/model counts.
    pub fn global(&self, since: f64) -> anyhow::Result<GlobalUsage> {
        let conn = self.conn()?;
        let usage = conn
            .query_row(
                "SELECT COUNT(*),
                        COUNT(DISTINCT api_key),
                        COUNT(DISTINCT model),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(AVG(latency_ms), 0)
                 FROM usage WHERE timestamp > ?1",
                params![since],
                |row| {
                    Ok(GlobalUsage {
                        total_requests: row.get(0)?,
                        active_keys: row.get(1)?,
                        active_models: row.get(2)?,
                        total_tokens: row.get(3)?,
                        avg_latency_ms: row.get(4)?,
                    })
                },
            )
            .context("querying global usage")?;
        Ok(usage)
    }
}
