//! Global logger module
//!
//! Source-tagged leveled logging with asynchronous batched persistence to
//! SQLite, so the hot request path never waits on a disk write.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Once, RwLock};
use std::time::Duration;

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
}

fn open_conn() -> Option<Connection> {
    Connection::open(crate::db::db_path()).ok()
}

/// Initialize the log table and spawn the batch writer thread.
pub fn init() {
    INIT.call_once(|| {
        if let Some(conn) = open_conn() {
            let _ = conn.execute(
                "create table if not exists gateway_logs (
                    id integer primary key autoincrement,
                    timestamp integer,
                    level text,
                    source text,
                    message text
                )",
                [],
            );
            let _ = conn.execute(
                "create index if not exists idx_gateway_logs_ts on gateway_logs(timestamp desc)",
                [],
            );
        }

        let (tx, rx) = mpsc::channel::<LogMessage>();
        if let Ok(mut sender) = LOG_SENDER.write() {
            *sender = Some(tx);
        }

        std::thread::spawn(move || {
            let mut batch: Vec<LogMessage> = Vec::new();
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(msg) => {
                        batch.push(msg);
                        if batch.len() >= 64 {
                            flush_batch(&mut batch);
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => flush_batch(&mut batch),
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        flush_batch(&mut batch);
                        break;
                    }
                }
            }
        });
    });
}

fn flush_batch(batch: &mut Vec<LogMessage>) {
    if batch.is_empty() {
        return;
    }
    let Some(mut conn) = open_conn() else {
        batch.clear();
        return;
    };
    if let Ok(tx) = conn.transaction() {
        for msg in batch.iter() {
            let _ = tx.execute(
                "insert into gateway_logs(timestamp, level, source, message) values(?,?,?,?)",
                params![msg.timestamp, msg.level, msg.source, msg.message],
            );
        }
        let _ = tx.commit();
    }
    batch.clear();
}

fn log(level: LogLevel, source: &str, message: &str) {
    if matches!(level, LogLevel::Warn | LogLevel::Error) {
        eprintln!("[{}] {}: {}", level.as_str(), source, message);
    }
    let entry = LogMessage {
        timestamp: chrono::Utc::now().timestamp(),
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };
    if let Ok(sender) = LOG_SENDER.read() {
        if let Some(tx) = sender.as_ref() {
            let _ = tx.send(entry);
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log(LogLevel::Error, source, message);
}

/// Query persisted log entries, newest first.
pub fn list(query: &LogQuery) -> Vec<LogEntry> {
    let Some(conn) = open_conn() else {
        return Vec::new();
    };
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    let level = query.level.map(|l| l.as_str().to_string());
    let source = query.source.clone();

    let mut sql = String::from(
        "select id, timestamp, level, source, message from gateway_logs where 1=1",
    );
    if level.is_some() {
        sql.push_str(" and level = ?1");
    }
    if source.is_some() {
        sql.push_str(if level.is_some() { " and source = ?2" } else { " and source = ?1" });
    }
    sql.push_str(" order by timestamp desc, id desc limit ");
    sql.push_str(&limit.to_string());
    sql.push_str(" offset ");
    sql.push_str(&offset.to_string());

    let Ok(mut stmt) = conn.prepare_cached(&sql) else {
        return Vec::new();
    };
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<LogEntry> {
        Ok(LogEntry {
            id: r.get(0)?,
            timestamp: r.get(1)?,
            level: LogLevel::from_str(&r.get::<_, String>(2)?).unwrap_or(LogLevel::Info),
            source: r.get(3)?,
            message: r.get(4)?,
        })
    };
    let rows = match (level, source) {
        (Some(l), Some(s)) => stmt.query_map(params![l, s], map_row),
        (Some(l), None) => stmt.query_map(params![l], map_row),
        (None, Some(s)) => stmt.query_map(params![s], map_row),
        (None, None) => stmt.query_map([], map_row),
    };
    match rows {
        Ok(iter) => iter.filter_map(|x| x.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Delete log entries older than the given epoch second.
pub fn prune(before_time: i64) -> usize {
    let Some(conn) = open_conn() else {
        return 0;
    };
    conn.execute(
        "delete from gateway_logs where timestamp < ?1",
        params![before_time],
    )
    .unwrap_or(0)
}
