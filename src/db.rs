//! Durable persistence for usage, errors, debug captures, cooldowns,
//! performance samples, quota state, and stored responses.
//!
//! SQLite in WAL mode, one short-lived connection per call with cached
//! statements. Every write is idempotent by natural key and best-effort: a
//! failed write is logged and swallowed because the request it describes has
//! already succeeded or failed on its own.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn db_path() -> PathBuf {
    if let Ok(p) = std::env::var("PLEXUS_DB_PATH") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("plexus");
    std::fs::create_dir_all(&p).ok();
    p.push("plexus.db");
    p
}

fn open_conn() -> Option<Connection> {
    match Connection::open(db_path()) {
        Ok(conn) => {
            conn.pragma_update(None, "journal_mode", &"WAL").ok();
            conn.pragma_update(None, "synchronous", &"NORMAL").ok();
            Some(conn)
        }
        Err(e) => {
            crate::logger::error("db", &format!("failed to open database: {}", e));
            None
        }
    }
}

pub fn init() {
    let Some(conn) = open_conn() else { return };
    let schema = [
        "create table if not exists request_usage (
            request_id text primary key,
            date text not null,
            source_ip text,
            api_key text,
            attribution text,
            incoming_api_type text,
            outgoing_api_type text,
            provider text,
            incoming_model_alias text,
            canonical_model_name text,
            selected_model_name text,
            attempt_count integer default 0,
            final_attempt_provider text,
            final_attempt_model text,
            all_attempted_providers text,
            tokens_input integer default 0,
            tokens_output integer default 0,
            tokens_reasoning integer default 0,
            tokens_cached integer default 0,
            tokens_cache_write integer default 0,
            cost_input real default 0,
            cost_output real default 0,
            cost_cached real default 0,
            cost_cache_write real default 0,
            cost_total real default 0,
            cost_source text,
            cost_metadata text,
            start_time integer,
            duration_ms integer,
            ttft_ms integer,
            tokens_per_sec real,
            is_streamed integer default 0,
            is_passthrough integer default 0,
            response_status text,
            tokens_estimated integer default 0,
            kwh_used real,
            tools_defined integer,
            message_count integer,
            tool_calls_count integer,
            finish_reason text
        )",
        "create index if not exists idx_request_usage_date on request_usage(date desc)",
        "create index if not exists idx_request_usage_provider_model on request_usage(provider, selected_model_name)",
        "create table if not exists provider_cooldowns (
            provider text not null,
            model text not null,
            account_id text not null default '',
            expiry_epoch integer not null,
            consecutive_failures integer not null default 0,
            reason text,
            created_at integer not null,
            primary key (provider, model, account_id)
        )",
        "create table if not exists debug_logs (
            request_id text primary key,
            raw_request text,
            transformed_request text,
            raw_response text,
            transformed_response text,
            raw_response_snapshot text,
            transformed_response_snapshot text,
            created_at integer not null
        )",
        "create table if not exists inference_errors (
            id integer primary key autoincrement,
            request_id text,
            message text,
            details text,
            created_at integer not null
        )",
        "create index if not exists idx_inference_errors_request on inference_errors(request_id)",
        "create table if not exists provider_performance (
            id integer primary key autoincrement,
            provider text not null,
            model text not null,
            canonical_model text,
            request_id text,
            ttft_ms integer,
            total_tokens integer,
            duration_ms integer not null,
            tokens_per_sec real,
            created_at integer not null
        )",
        "create index if not exists idx_provider_performance_window on provider_performance(provider, model, created_at)",
        "create table if not exists quota_state (
            key_name text not null,
            quota_name text not null,
            limit_type text not null,
            current_usage real not null default 0,
            last_updated_epoch integer not null,
            last_known_limit real not null default 0,
            last_known_limit_type text,
            primary key (key_name, quota_name)
        )",
        "create table if not exists quota_snapshots (
            id integer primary key autoincrement,
            key_name text not null,
            quota_name text not null,
            usage real not null,
            limit_value real not null,
            created_at integer not null
        )",
        "create table if not exists responses (
            id text primary key,
            conversation_id text,
            model text,
            body text,
            created_at integer not null
        )",
        "create table if not exists conversations (
            id text primary key,
            metadata text,
            created_at integer not null
        )",
        "create table if not exists response_items (
            id integer primary key autoincrement,
            response_id text not null,
            position integer not null,
            item text not null,
            created_at integer not null
        )",
        "create index if not exists idx_response_items_response on response_items(response_id, position)",
    ];
    for sql in schema {
        if let Err(e) = conn.execute(sql, []) {
            crate::logger::error("db", &format!("schema statement failed: {}", e));
        }
    }
}

// ============================================================================
// Usage records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub date: String,
    pub source_ip: Option<String>,
    pub api_key: Option<String>,
    pub attribution: Option<String>,
    pub incoming_api_type: String,
    pub outgoing_api_type: Option<String>,
    pub provider: Option<String>,
    pub incoming_model_alias: Option<String>,
    pub canonical_model_name: Option<String>,
    pub selected_model_name: Option<String>,
    pub attempt_count: i64,
    pub final_attempt_provider: Option<String>,
    pub final_attempt_model: Option<String>,
    pub all_attempted_providers: Vec<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub tokens_reasoning: i64,
    pub tokens_cached: i64,
    pub tokens_cache_write: i64,
    pub cost_input: f64,
    pub cost_output: f64,
    pub cost_cached: f64,
    pub cost_cache_write: f64,
    pub cost_total: f64,
    pub cost_source: String,
    pub cost_metadata: Option<String>,
    pub start_time: i64,
    pub duration_ms: Option<i64>,
    pub ttft_ms: Option<i64>,
    pub tokens_per_sec: Option<f64>,
    pub is_streamed: bool,
    pub is_passthrough: bool,
    pub response_status: String,
    pub tokens_estimated: bool,
    pub kwh_used: Option<f64>,
    pub tools_defined: Option<i64>,
    pub message_count: Option<i64>,
    pub tool_calls_count: Option<i64>,
    pub finish_reason: Option<String>,
}

impl UsageRecord {
    pub fn new(request_id: impl Into<String>, incoming_api_type: &str) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            date: now.to_rfc3339(),
            source_ip: None,
            api_key: None,
            attribution: None,
            incoming_api_type: incoming_api_type.to_string(),
            outgoing_api_type: None,
            provider: None,
            incoming_model_alias: None,
            canonical_model_name: None,
            selected_model_name: None,
            attempt_count: 0,
            final_attempt_provider: None,
            final_attempt_model: None,
            all_attempted_providers: Vec::new(),
            tokens_input: 0,
            tokens_output: 0,
            tokens_reasoning: 0,
            tokens_cached: 0,
            tokens_cache_write: 0,
            cost_input: 0.0,
            cost_output: 0.0,
            cost_cached: 0.0,
            cost_cache_write: 0.0,
            cost_total: 0.0,
            cost_source: "default".to_string(),
            cost_metadata: None,
            start_time: now.timestamp_millis(),
            duration_ms: None,
            ttft_ms: None,
            tokens_per_sec: None,
            is_streamed: false,
            is_passthrough: false,
            response_status: "error".to_string(),
            tokens_estimated: false,
            kwh_used: None,
            tools_defined: None,
            message_count: None,
            tool_calls_count: None,
            finish_reason: None,
        }
    }
}

/// Upsert a usage record by request id.
pub fn save_request(record: &UsageRecord) {
    let Some(conn) = open_conn() else { return };
    let attempted = serde_json::to_string(&record.all_attempted_providers).unwrap_or_else(|_| "[]".to_string());
    let result = conn.execute(
        "insert into request_usage (
            request_id, date, source_ip, api_key, attribution,
            incoming_api_type, outgoing_api_type, provider,
            incoming_model_alias, canonical_model_name, selected_model_name,
            attempt_count, final_attempt_provider, final_attempt_model, all_attempted_providers,
            tokens_input, tokens_output, tokens_reasoning, tokens_cached, tokens_cache_write,
            cost_input, cost_output, cost_cached, cost_cache_write, cost_total,
            cost_source, cost_metadata,
            start_time, duration_ms, ttft_ms, tokens_per_sec,
            is_streamed, is_passthrough, response_status, tokens_estimated,
            kwh_used, tools_defined, message_count, tool_calls_count, finish_reason
        ) values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,
                  ?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33,?34,?35,?36,?37,?38,?39,?40)
        on conflict(request_id) do update set
            date=excluded.date, source_ip=excluded.source_ip, api_key=excluded.api_key,
            attribution=excluded.attribution, incoming_api_type=excluded.incoming_api_type,
            outgoing_api_type=excluded.outgoing_api_type, provider=excluded.provider,
            incoming_model_alias=excluded.incoming_model_alias,
            canonical_model_name=excluded.canonical_model_name,
            selected_model_name=excluded.selected_model_name,
            attempt_count=excluded.attempt_count,
            final_attempt_provider=excluded.final_attempt_provider,
            final_attempt_model=excluded.final_attempt_model,
            all_attempted_providers=excluded.all_attempted_providers,
            tokens_input=excluded.tokens_input, tokens_output=excluded.tokens_output,
            tokens_reasoning=excluded.tokens_reasoning, tokens_cached=excluded.tokens_cached,
            tokens_cache_write=excluded.tokens_cache_write,
            cost_input=excluded.cost_input, cost_output=excluded.cost_output,
            cost_cached=excluded.cost_cached, cost_cache_write=excluded.cost_cache_write,
            cost_total=excluded.cost_total, cost_source=excluded.cost_source,
            cost_metadata=excluded.cost_metadata,
            start_time=excluded.start_time, duration_ms=excluded.duration_ms,
            ttft_ms=excluded.ttft_ms, tokens_per_sec=excluded.tokens_per_sec,
            is_streamed=excluded.is_streamed, is_passthrough=excluded.is_passthrough,
            response_status=excluded.response_status, tokens_estimated=excluded.tokens_estimated,
            kwh_used=excluded.kwh_used, tools_defined=excluded.tools_defined,
            message_count=excluded.message_count, tool_calls_count=excluded.tool_calls_count,
            finish_reason=excluded.finish_reason",
        params![
            record.request_id, record.date, record.source_ip, record.api_key, record.attribution,
            record.incoming_api_type, record.outgoing_api_type, record.provider,
            record.incoming_model_alias, record.canonical_model_name, record.selected_model_name,
            record.attempt_count, record.final_attempt_provider, record.final_attempt_model, attempted,
            record.tokens_input, record.tokens_output, record.tokens_reasoning, record.tokens_cached,
            record.tokens_cache_write,
            record.cost_input, record.cost_output, record.cost_cached, record.cost_cache_write,
            record.cost_total, record.cost_source, record.cost_metadata,
            record.start_time, record.duration_ms, record.ttft_ms, record.tokens_per_sec,
            record.is_streamed as i64, record.is_passthrough as i64, record.response_status,
            record.tokens_estimated as i64,
            record.kwh_used, record.tools_defined, record.message_count, record.tool_calls_count,
            record.finish_reason,
        ],
    );
    if let Err(e) = result {
        crate::logger::error("db", &format!("save_request({}) failed: {}", record.request_id, e));
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct UsageFilters {
    pub provider: Option<String>,
    pub alias: Option<String>,
    pub model: Option<String>,
}

fn row_to_usage(r: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
    let attempted: Option<String> = r.get("all_attempted_providers")?;
    Ok(UsageRecord {
        request_id: r.get("request_id")?,
        date: r.get("date")?,
        source_ip: r.get("source_ip")?,
        api_key: r.get("api_key")?,
        attribution: r.get("attribution")?,
        incoming_api_type: r.get::<_, Option<String>>("incoming_api_type")?.unwrap_or_default(),
        outgoing_api_type: r.get("outgoing_api_type")?,
        provider: r.get("provider")?,
        incoming_model_alias: r.get("incoming_model_alias")?,
        canonical_model_name: r.get("canonical_model_name")?,
        selected_model_name: r.get("selected_model_name")?,
        attempt_count: r.get::<_, Option<i64>>("attempt_count")?.unwrap_or(0),
        final_attempt_provider: r.get("final_attempt_provider")?,
        final_attempt_model: r.get("final_attempt_model")?,
        all_attempted_providers: attempted
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        tokens_input: r.get::<_, Option<i64>>("tokens_input")?.unwrap_or(0),
        tokens_output: r.get::<_, Option<i64>>("tokens_output")?.unwrap_or(0),
        tokens_reasoning: r.get::<_, Option<i64>>("tokens_reasoning")?.unwrap_or(0),
        tokens_cached: r.get::<_, Option<i64>>("tokens_cached")?.unwrap_or(0),
        tokens_cache_write: r.get::<_, Option<i64>>("tokens_cache_write")?.unwrap_or(0),
        cost_input: r.get::<_, Option<f64>>("cost_input")?.unwrap_or(0.0),
        cost_output: r.get::<_, Option<f64>>("cost_output")?.unwrap_or(0.0),
        cost_cached: r.get::<_, Option<f64>>("cost_cached")?.unwrap_or(0.0),
        cost_cache_write: r.get::<_, Option<f64>>("cost_cache_write")?.unwrap_or(0.0),
        cost_total: r.get::<_, Option<f64>>("cost_total")?.unwrap_or(0.0),
        cost_source: r.get::<_, Option<String>>("cost_source")?.unwrap_or_else(|| "default".to_string()),
        cost_metadata: r.get("cost_metadata")?,
        start_time: r.get::<_, Option<i64>>("start_time")?.unwrap_or(0),
        duration_ms: r.get("duration_ms")?,
        ttft_ms: r.get("ttft_ms")?,
        tokens_per_sec: r.get("tokens_per_sec")?,
        is_streamed: r.get::<_, Option<i64>>("is_streamed")?.unwrap_or(0) != 0,
        is_passthrough: r.get::<_, Option<i64>>("is_passthrough")?.unwrap_or(0) != 0,
        response_status: r.get::<_, Option<String>>("response_status")?.unwrap_or_default(),
        tokens_estimated: r.get::<_, Option<i64>>("tokens_estimated")?.unwrap_or(0) != 0,
        kwh_used: r.get("kwh_used")?,
        tools_defined: r.get("tools_defined")?,
        message_count: r.get("message_count")?,
        tool_calls_count: r.get("tool_calls_count")?,
        finish_reason: r.get("finish_reason")?,
    })
}

/// Filtered usage listing, newest first.
pub fn get_usage(filters: &UsageFilters, limit: i64, offset: i64) -> Vec<UsageRecord> {
    let Some(conn) = open_conn() else { return Vec::new() };
    let mut sql = String::from("select * from request_usage where 1=1");
    let mut args: Vec<String> = Vec::new();
    if let Some(p) = &filters.provider {
        args.push(format!("%{}%", p));
        sql.push_str(&format!(" and provider like ?{}", args.len()));
    }
    if let Some(a) = &filters.alias {
        args.push(format!("%{}%", a));
        sql.push_str(&format!(" and incoming_model_alias like ?{}", args.len()));
    }
    if let Some(m) = &filters.model {
        args.push(format!("%{}%", m));
        sql.push_str(&format!(" and selected_model_name like ?{}", args.len()));
    }
    sql.push_str(&format!(" order by date desc limit {} offset {}", limit.max(0), offset.max(0)));

    let Ok(mut stmt) = conn.prepare_cached(&sql) else { return Vec::new() };
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_usage);
    match rows {
        Ok(iter) => iter.filter_map(|x| x.ok()).collect(),
        Err(e) => {
            crate::logger::error("db", &format!("get_usage failed: {}", e));
            Vec::new()
        }
    }
}

pub fn get_usage_by_id(request_id: &str) -> Option<UsageRecord> {
    let conn = open_conn()?;
    let mut stmt = conn
        .prepare_cached("select * from request_usage where request_id = ?1")
        .ok()?;
    stmt.query_row(params![request_id], row_to_usage)
        .optional()
        .ok()
        .flatten()
}

pub fn delete_all_usage_logs(older_than: Option<&str>) -> usize {
    let Some(conn) = open_conn() else { return 0 };
    let result = match older_than {
        Some(cutoff) => conn.execute("delete from request_usage where date < ?1", params![cutoff]),
        None => conn.execute("delete from request_usage", []),
    };
    result.unwrap_or_else(|e| {
        crate::logger::error("db", &format!("delete_all_usage_logs failed: {}", e));
        0
    })
}

/// Late update of the performance columns on a usage row.
pub fn update_performance_metrics(
    request_id: &str,
    ttft_ms: Option<i64>,
    duration_ms: Option<i64>,
    tokens_per_sec: Option<f64>,
) {
    let Some(conn) = open_conn() else { return };
    if let Err(e) = conn.execute(
        "update request_usage set ttft_ms = coalesce(?2, ttft_ms),
            duration_ms = coalesce(?3, duration_ms),
            tokens_per_sec = coalesce(?4, tokens_per_sec)
         where request_id = ?1",
        params![request_id, ttft_ms, duration_ms, tokens_per_sec],
    ) {
        crate::logger::error("db", &format!("update_performance_metrics failed: {}", e));
    }
}

pub fn save_error(request_id: &str, message: &str, details: Option<&str>) {
    let Some(conn) = open_conn() else { return };
    if let Err(e) = conn.execute(
        "insert into inference_errors(request_id, message, details, created_at) values(?,?,?,?)",
        params![request_id, message, details, Utc::now().timestamp()],
    ) {
        crate::logger::error("db", &format!("save_error failed: {}", e));
    }
}

// ============================================================================
// Debug logs
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugLog {
    pub request_id: String,
    pub raw_request: Option<String>,
    pub transformed_request: Option<String>,
    pub raw_response: Option<String>,
    pub transformed_response: Option<String>,
    pub raw_response_snapshot: Option<String>,
    pub transformed_response_snapshot: Option<String>,
    pub created_at: i64,
}

pub fn save_debug_log(log: &DebugLog) {
    let Some(conn) = open_conn() else { return };
    if let Err(e) = conn.execute(
        "insert into debug_logs(request_id, raw_request, transformed_request, raw_response,
            transformed_response, raw_response_snapshot, transformed_response_snapshot, created_at)
         values(?1,?2,?3,?4,?5,?6,?7,?8)
         on conflict(request_id) do update set
            raw_request=excluded.raw_request,
            transformed_request=excluded.transformed_request,
            raw_response=excluded.raw_response,
            transformed_response=excluded.transformed_response,
            raw_response_snapshot=excluded.raw_response_snapshot,
            transformed_response_snapshot=excluded.transformed_response_snapshot",
        params![
            log.request_id, log.raw_request, log.transformed_request, log.raw_response,
            log.transformed_response, log.raw_response_snapshot, log.transformed_response_snapshot,
            log.created_at,
        ],
    ) {
        crate::logger::error("db", &format!("save_debug_log failed: {}", e));
    }
}

pub fn get_debug_log(request_id: &str) -> Option<DebugLog> {
    let conn = open_conn()?;
    let mut stmt = conn
        .prepare_cached("select request_id, raw_request, transformed_request, raw_response, transformed_response, raw_response_snapshot, transformed_response_snapshot, created_at from debug_logs where request_id = ?1")
        .ok()?;
    stmt.query_row(params![request_id], |r| {
            Ok(DebugLog {
                request_id: r.get(0)?,
                raw_request: r.get(1)?,
                transformed_request: r.get(2)?,
                raw_response: r.get(3)?,
                transformed_response: r.get(4)?,
                raw_response_snapshot: r.get(5)?,
                transformed_response_snapshot: r.get(6)?,
                created_at: r.get(7)?,
            })
        })
        .optional()
        .ok()
        .flatten()
}

pub fn delete_debug_log(request_id: &str) -> bool {
    let Some(conn) = open_conn() else { return false };
    conn.execute("delete from debug_logs where request_id = ?1", params![request_id])
        .map(|n| n > 0)
        .unwrap_or(false)
}

// ============================================================================
// Cooldowns
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PersistedCooldown {
    pub provider: String,
    pub model: String,
    pub account_id: String,
    pub expiry_epoch: i64,
    pub consecutive_failures: i64,
    pub reason: Option<String>,
    pub created_at: i64,
}

pub fn upsert_cooldown(entry: &PersistedCooldown) {
    let Some(conn) = open_conn() else { return };
    if let Err(e) = conn.execute(
        "insert into provider_cooldowns(provider, model, account_id, expiry_epoch, consecutive_failures, reason, created_at)
         values(?1,?2,?3,?4,?5,?6,?7)
         on conflict(provider, model, account_id) do update set
            expiry_epoch=excluded.expiry_epoch,
            consecutive_failures=excluded.consecutive_failures,
            reason=excluded.reason",
        params![
            entry.provider, entry.model, entry.account_id, entry.expiry_epoch,
            entry.consecutive_failures, entry.reason, entry.created_at,
        ],
    ) {
        crate::logger::error("db", &format!("upsert_cooldown failed: {}", e));
    }
}

pub fn delete_cooldown(provider: &str, model: &str, account_id: &str) {
    let Some(conn) = open_conn() else { return };
    let _ = conn.execute(
        "delete from provider_cooldowns where provider=?1 and model=?2 and account_id=?3",
        params![provider, model, account_id],
    );
}

pub fn clear_cooldowns(provider: Option<&str>) -> usize {
    let Some(conn) = open_conn() else { return 0 };
    let result = match provider {
        Some(p) => conn.execute("delete from provider_cooldowns where provider=?1", params![p]),
        None => conn.execute("delete from provider_cooldowns", []),
    };
    result.unwrap_or(0)
}

pub fn load_cooldowns() -> Vec<PersistedCooldown> {
    let Some(conn) = open_conn() else { return Vec::new() };
    let Ok(mut stmt) = conn.prepare_cached(
        "select provider, model, account_id, expiry_epoch, consecutive_failures, reason, created_at from provider_cooldowns",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map([], |r| {
        Ok(PersistedCooldown {
            provider: r.get(0)?,
            model: r.get(1)?,
            account_id: r.get(2)?,
            expiry_epoch: r.get(3)?,
            consecutive_failures: r.get(4)?,
            reason: r.get(5)?,
            created_at: r.get(6)?,
        })
    });
    match rows {
        Ok(iter) => iter.filter_map(|x| x.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// Performance samples
// ============================================================================

pub fn insert_performance_sample(
    provider: &str,
    model: &str,
    canonical_model: Option<&str>,
    request_id: &str,
    ttft_ms: Option<i64>,
    total_tokens: Option<i64>,
    duration_ms: i64,
    tokens_per_sec: Option<f64>,
) {
    let Some(conn) = open_conn() else { return };
    if let Err(e) = conn.execute(
        "insert into provider_performance(provider, model, canonical_model, request_id, ttft_ms, total_tokens, duration_ms, tokens_per_sec, created_at)
         values(?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        params![
            provider, model, canonical_model, request_id, ttft_ms, total_tokens,
            duration_ms, tokens_per_sec, Utc::now().timestamp(),
        ],
    ) {
        crate::logger::error("db", &format!("insert_performance_sample failed: {}", e));
    }
}

// ============================================================================
// Quota state
// ============================================================================

#[derive(Debug, Clone)]
pub struct PersistedQuotaState {
    pub key_name: String,
    pub quota_name: String,
    pub limit_type: String,
    pub current_usage: f64,
    pub last_updated_epoch: i64,
    pub last_known_limit: f64,
    pub last_known_limit_type: Option<String>,
}

pub fn upsert_quota_state(state: &PersistedQuotaState) {
    let Some(conn) = open_conn() else { return };
    if let Err(e) = conn.execute(
        "insert into quota_state(key_name, quota_name, limit_type, current_usage, last_updated_epoch, last_known_limit, last_known_limit_type)
         values(?1,?2,?3,?4,?5,?6,?7)
         on conflict(key_name, quota_name) do update set
            limit_type=excluded.limit_type,
            current_usage=excluded.current_usage,
            last_updated_epoch=excluded.last_updated_epoch,
            last_known_limit=excluded.last_known_limit,
            last_known_limit_type=excluded.last_known_limit_type",
        params![
            state.key_name, state.quota_name, state.limit_type, state.current_usage,
            state.last_updated_epoch, state.last_known_limit, state.last_known_limit_type,
        ],
    ) {
        crate::logger::error("db", &format!("upsert_quota_state failed: {}", e));
    }
}

pub fn load_quota_state(key_name: &str, quota_name: &str) -> Option<PersistedQuotaState> {
    let conn = open_conn()?;
    let mut stmt = conn
        .prepare_cached(
            "select key_name, quota_name, limit_type, current_usage, last_updated_epoch, last_known_limit, last_known_limit_type
             from quota_state where key_name=?1 and quota_name=?2",
        )
        .ok()?;
    stmt.query_row(params![key_name, quota_name], |r| {
        Ok(PersistedQuotaState {
            key_name: r.get(0)?,
            quota_name: r.get(1)?,
            limit_type: r.get(2)?,
            current_usage: r.get(3)?,
            last_updated_epoch: r.get(4)?,
            last_known_limit: r.get(5)?,
            last_known_limit_type: r.get(6)?,
        })
    })
    .optional()
    .ok()
    .flatten()
}

pub fn insert_quota_snapshot(key_name: &str, quota_name: &str, usage: f64, limit_value: f64) {
    let Some(conn) = open_conn() else { return };
    let _ = conn.execute(
        "insert into quota_snapshots(key_name, quota_name, usage, limit_value, created_at) values(?1,?2,?3,?4,?5)",
        params![key_name, quota_name, usage, limit_value, Utc::now().timestamp()],
    );
}

// ============================================================================
// Stored responses (responses dialect chaining)
// ============================================================================

pub fn save_response(
    id: &str,
    conversation_id: Option<&str>,
    model: &str,
    body: &str,
    items: &[serde_json::Value],
) {
    let Some(mut conn) = open_conn() else { return };
    let now = Utc::now().timestamp();
    let Ok(tx) = conn.transaction() else { return };
    let mut failed = false;
    if let Some(cid) = conversation_id {
        failed |= tx
            .execute(
                "insert into conversations(id, metadata, created_at) values(?1, null, ?2)
                 on conflict(id) do nothing",
                params![cid, now],
            )
            .is_err();
    }
    failed |= tx
        .execute(
            "insert into responses(id, conversation_id, model, body, created_at) values(?1,?2,?3,?4,?5)
             on conflict(id) do update set body=excluded.body, model=excluded.model",
            params![id, conversation_id, model, body, now],
        )
        .is_err();
    let _ = tx.execute("delete from response_items where response_id=?1", params![id]);
    for (position, item) in items.iter().enumerate() {
        failed |= tx
            .execute(
                "insert into response_items(response_id, position, item, created_at) values(?1,?2,?3,?4)",
                params![id, position as i64, item.to_string(), now],
            )
            .is_err();
    }
    if failed {
        crate::logger::error("db", &format!("save_response({}) had failed statements", id));
    }
    let _ = tx.commit();
}

/// Output items of a stored response, in order. Used to resolve
/// `previous_response_id` chains.
pub fn get_response_items(response_id: &str) -> Vec<serde_json::Value> {
    let Some(conn) = open_conn() else { return Vec::new() };
    let Ok(mut stmt) = conn.prepare_cached(
        "select item from response_items where response_id=?1 order by position asc",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map(params![response_id], |r| r.get::<_, String>(0));
    match rows {
        Ok(iter) => iter
            .filter_map(|x| x.ok())
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// Stats roll-ups
// ============================================================================

#[derive(Debug, Serialize, Clone)]
pub struct ModelStats {
    pub provider: String,
    pub model: String,
    pub requests: i64,
    pub tokens: i64,
    pub cost_usd: f64,
}

pub fn summary_since(days: i64) -> (i64, i64, f64) {
    let Some(conn) = open_conn() else { return (0, 0, 0.0) };
    let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    conn.prepare_cached(
        "select count(*), ifnull(sum(tokens_input + tokens_output), 0), ifnull(sum(cost_total), 0)
         from request_usage where date >= ?1",
    )
    .and_then(|mut stmt| stmt.query_row(params![cutoff], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?))))
    .unwrap_or((0, 0, 0.0))
}

pub fn models_cost_since(days: i64) -> Vec<ModelStats> {
    let Some(conn) = open_conn() else { return Vec::new() };
    let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    let Ok(mut stmt) = conn.prepare_cached(
        "select ifnull(provider, ''), ifnull(selected_model_name, ''), count(*),
                ifnull(sum(tokens_input + tokens_output), 0), ifnull(sum(cost_total), 0)
         from request_usage where date >= ?1 group by 1, 2 order by 5 desc",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map(params![cutoff], |r| {
        Ok(ModelStats {
            provider: r.get(0)?,
            model: r.get(1)?,
            requests: r.get(2)?,
            tokens: r.get(3)?,
            cost_usd: r.get(4)?,
        })
    });
    match rows {
        Ok(iter) => iter.filter_map(|x| x.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() {
        let mut p = std::env::temp_dir();
        p.push(format!("plexus-test-{}.db", std::process::id()));
        std::env::set_var("PLEXUS_DB_PATH", &p);
        init();
    }

    #[test]
    fn usage_upsert_is_idempotent() {
        test_db();
        let mut record = UsageRecord::new("req-upsert", "chat");
        record.provider = Some("openai".to_string());
        record.tokens_input = 10;
        save_request(&record);
        record.tokens_input = 25;
        record.response_status = "success".to_string();
        save_request(&record);

        let rows = get_usage(
            &UsageFilters { provider: Some("openai".to_string()), ..Default::default() },
            100,
            0,
        );
        let matched: Vec<_> = rows.iter().filter(|r| r.request_id == "req-upsert").collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].tokens_input, 25);
        assert_eq!(matched[0].response_status, "success");
    }

    #[test]
    fn debug_log_round_trip() {
        test_db();
        save_debug_log(&DebugLog {
            request_id: "req-debug".to_string(),
            raw_request: Some("{\"model\":\"x\"}".to_string()),
            created_at: 123,
            ..Default::default()
        });
        let loaded = get_debug_log("req-debug").unwrap();
        assert_eq!(loaded.raw_request.as_deref(), Some("{\"model\":\"x\"}"));
        assert!(delete_debug_log("req-debug"));
        assert!(get_debug_log("req-debug").is_none());
    }

    #[test]
    fn cooldown_persistence_round_trip() {
        test_db();
        upsert_cooldown(&PersistedCooldown {
            provider: "stima".to_string(),
            model: "m1".to_string(),
            account_id: String::new(),
            expiry_epoch: 9_999_999_999,
            consecutive_failures: 2,
            reason: Some("rate_limit".to_string()),
            created_at: 1,
        });
        let loaded = load_cooldowns();
        assert!(loaded.iter().any(|c| c.provider == "stima" && c.model == "m1"));
        clear_cooldowns(Some("stima"));
        assert!(!load_cooldowns().iter().any(|c| c.provider == "stima"));
    }

    #[test]
    fn response_items_round_trip() {
        test_db();
        let items = vec![
            serde_json::json!({"type": "message", "role": "assistant"}),
            serde_json::json!({"type": "function_call", "name": "f"}),
        ];
        save_response("resp_1", None, "gpt-4o", "{}", &items);
        let loaded = get_response_items("resp_1");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["type"], "message");
    }
}
