//! Per-key quota enforcement.
//!
//! Rolling quotas leak usage continuously at `limit / duration`; daily and
//! weekly quotas clear at fixed UTC instants. A changed limit or limit type
//! in config resets accumulated usage. Denials surface as 429 upstream of
//! any provider contact.

use chrono::{Datelike, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{QuotaConfig, QuotaLimitType, QuotaPeriod};
use crate::pricing::TokenCounts;

#[derive(Debug, Clone)]
struct QuotaState {
    current_usage: f64,
    last_updated_epoch: i64,
    last_known_limit: f64,
    last_known_limit_type: QuotaLimitType,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub current_usage: f64,
    pub limit: f64,
    pub remaining: f64,
    pub resets_at: Option<i64>,
    pub limit_type: QuotaLimitType,
    pub retry_after_secs: Option<i64>,
}

pub struct QuotaEnforcer {
    state: Mutex<HashMap<(String, String), QuotaState>>,
    persist: bool,
}

fn next_daily_reset(now: i64) -> i64 {
    let dt = Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now);
    let next = (dt.date_naive() + chrono::Days::new(1))
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    Utc.from_utc_datetime(&next).timestamp()
}

fn next_weekly_reset(now: i64) -> i64 {
    let dt = Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now);
    // Sunday 00:00 UTC.
    let days_ahead = 7 - dt.weekday().num_days_from_sunday() as u64;
    let next = (dt.date_naive() + chrono::Days::new(days_ahead))
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    Utc.from_utc_datetime(&next).timestamp()
}

fn period_start(period: QuotaPeriod, now: i64) -> i64 {
    match period {
        QuotaPeriod::Rolling => now,
        QuotaPeriod::Daily => next_daily_reset(now) - 86_400,
        QuotaPeriod::Weekly => next_weekly_reset(now) - 7 * 86_400,
    }
}

impl QuotaEnforcer {
    pub fn new(persist: bool) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            persist,
        }
    }

    fn load_or_default(
        &self,
        states: &mut HashMap<(String, String), QuotaState>,
        key_name: &str,
        quota: &QuotaConfig,
        now: i64,
    ) -> QuotaState {
        let map_key = (key_name.to_string(), quota.name.clone());
        if let Some(existing) = states.get(&map_key) {
            return existing.clone();
        }
        if self.persist {
            if let Some(row) = crate::db::load_quota_state(key_name, &quota.name) {
                let restored = QuotaState {
                    current_usage: row.current_usage,
                    last_updated_epoch: row.last_updated_epoch,
                    last_known_limit: row.last_known_limit,
                    last_known_limit_type: match row.last_known_limit_type.as_deref() {
                        Some("requests") => QuotaLimitType::Requests,
                        _ => QuotaLimitType::Tokens,
                    },
                };
                states.insert(map_key, restored.clone());
                return restored;
            }
        }
        let fresh = QuotaState {
            current_usage: 0.0,
            last_updated_epoch: now,
            last_known_limit: quota.limit as f64,
            last_known_limit_type: quota.limit_type,
        };
        states.insert(map_key, fresh.clone());
        fresh
    }

    fn refresh(state: &mut QuotaState, quota: &QuotaConfig, now: i64) {
        // Redefined quota: start counting from scratch.
        if state.last_known_limit != quota.limit as f64
            || state.last_known_limit_type != quota.limit_type
        {
            state.current_usage = 0.0;
            state.last_known_limit = quota.limit as f64;
            state.last_known_limit_type = quota.limit_type;
            state.last_updated_epoch = now;
            return;
        }

        match quota.period {
            QuotaPeriod::Rolling => {
                let elapsed = (now - state.last_updated_epoch).max(0) as f64;
                let duration = quota.duration_secs.max(1) as f64;
                let leak = quota.limit as f64 * elapsed / duration;
                state.current_usage = (state.current_usage - leak).max(0.0);
                state.last_updated_epoch = now;
            }
            QuotaPeriod::Daily | QuotaPeriod::Weekly => {
                let start = period_start(quota.period, now);
                if state.last_updated_epoch < start {
                    state.current_usage = 0.0;
                }
                state.last_updated_epoch = now;
            }
        }
    }

    fn persist_state(&self, key_name: &str, quota: &QuotaConfig, state: &QuotaState) {
        if !self.persist {
            return;
        }
        crate::db::upsert_quota_state(&crate::db::PersistedQuotaState {
            key_name: key_name.to_string(),
            quota_name: quota.name.clone(),
            limit_type: quota.limit_type.as_str().to_string(),
            current_usage: state.current_usage,
            last_updated_epoch: state.last_updated_epoch,
            last_known_limit: state.last_known_limit,
            last_known_limit_type: Some(state.last_known_limit_type.as_str().to_string()),
        });
    }

    pub fn check(&self, key_name: &str, quota: &QuotaConfig) -> QuotaDecision {
        self.check_at(key_name, quota, Utc::now().timestamp())
    }

    pub fn check_at(&self, key_name: &str, quota: &QuotaConfig, now: i64) -> QuotaDecision {
        let mut states = self.state.lock().unwrap();
        let mut state = self.load_or_default(&mut states, key_name, quota, now);
        Self::refresh(&mut state, quota, now);
        states.insert((key_name.to_string(), quota.name.clone()), state.clone());
        drop(states);
        self.persist_state(key_name, quota, &state);

        let limit = quota.limit as f64;
        let allowed = state.current_usage < limit;
        let resets_at = match quota.period {
            QuotaPeriod::Rolling => None,
            QuotaPeriod::Daily => Some(next_daily_reset(now)),
            QuotaPeriod::Weekly => Some(next_weekly_reset(now)),
        };
        let retry_after_secs = if allowed {
            None
        } else {
            Some(match quota.period {
                QuotaPeriod::Rolling => {
                    // Time for enough usage to leak back under the limit.
                    let excess = state.current_usage - limit + 1.0;
                    let duration = quota.duration_secs.max(1) as f64;
                    ((excess * duration / limit.max(1.0)).ceil() as i64).max(1)
                }
                _ => (resets_at.unwrap_or(now) - now).max(1),
            })
        };

        QuotaDecision {
            allowed,
            current_usage: state.current_usage,
            limit,
            remaining: (limit - state.current_usage).max(0.0),
            resets_at,
            limit_type: quota.limit_type,
            retry_after_secs,
        }
    }

    pub fn record(&self, key_name: &str, quota: &QuotaConfig, usage: &TokenCounts) {
        self.record_at(key_name, quota, usage, Utc::now().timestamp())
    }

    pub fn record_at(&self, key_name: &str, quota: &QuotaConfig, usage: &TokenCounts, now: i64) {
        let amount = match quota.limit_type {
            QuotaLimitType::Tokens => usage.total() as f64,
            QuotaLimitType::Requests => 1.0,
        };
        let mut states = self.state.lock().unwrap();
        let mut state = self.load_or_default(&mut states, key_name, quota, now);
        Self::refresh(&mut state, quota, now);
        state.current_usage += amount;
        state.last_updated_epoch = now;
        states.insert((key_name.to_string(), quota.name.clone()), state.clone());
        drop(states);
        self.persist_state(key_name, quota, &state);
        if self.persist {
            crate::db::insert_quota_snapshot(key_name, &quota.name, state.current_usage, quota.limit as f64);
        }
    }

    /// Peek without mutating; used by tests and the operator API.
    pub fn current_usage(&self, key_name: &str, quota_name: &str) -> Option<f64> {
        let states = self.state.lock().unwrap();
        states
            .get(&(key_name.to_string(), quota_name.to_string()))
            .map(|s| s.current_usage)
    }
}

static GLOBAL: Lazy<QuotaEnforcer> = Lazy::new(|| QuotaEnforcer::new(true));

pub fn global() -> &'static QuotaEnforcer {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rolling_quota(limit: i64, duration_secs: u64) -> QuotaConfig {
        QuotaConfig {
            name: "test".to_string(),
            limit,
            limit_type: QuotaLimitType::Tokens,
            period: QuotaPeriod::Rolling,
            duration_secs,
        }
    }

    fn tokens(input: i64, output: i64) -> TokenCounts {
        TokenCounts { input, output, ..Default::default() }
    }

    #[test]
    fn denies_over_limit_rolling_quota() {
        let q = QuotaEnforcer::new(false);
        let quota = rolling_quota(100, 3600);
        let now = 1_700_000_000;

        q.record_at("alice", &quota, &tokens(150, 0), now);
        let decision = q.check_at("alice", &quota, now);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs.unwrap() > 0);
        assert_eq!(decision.remaining, 0.0);
    }

    #[test]
    fn rolling_leak_identity() {
        let q = QuotaEnforcer::new(false);
        let quota = rolling_quota(100, 3600);
        let now = 1_700_000_000;

        q.record_at("bob", &quota, &tokens(80, 0), now);
        // Half the window elapses: leak = 100 * 1800 / 3600 = 50.
        let decision = q.check_at("bob", &quota, now + 1800);
        assert!((decision.current_usage - 30.0).abs() < 1e-9);
        assert!(decision.allowed);
    }

    #[test]
    fn leak_floors_at_zero() {
        let q = QuotaEnforcer::new(false);
        let quota = rolling_quota(100, 3600);
        let now = 1_700_000_000;
        q.record_at("carol", &quota, &tokens(10, 0), now);
        let decision = q.check_at("carol", &quota, now + 100_000);
        assert_eq!(decision.current_usage, 0.0);
    }

    #[test]
    fn daily_quota_resets_at_midnight_utc() {
        let q = QuotaEnforcer::new(false);
        let quota = QuotaConfig {
            period: QuotaPeriod::Daily,
            limit: 10,
            ..rolling_quota(10, 0)
        };
        // 2026-03-02 23:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap().timestamp();
        q.record_at("dave", &quota, &tokens(12, 0), now);
        assert!(!q.check_at("dave", &quota, now).allowed);
        // Past midnight the bucket clears.
        let tomorrow = Utc.with_ymd_and_hms(2026, 3, 3, 0, 5, 0).unwrap().timestamp();
        let decision = q.check_at("dave", &quota, tomorrow);
        assert!(decision.allowed);
        assert_eq!(decision.current_usage, 0.0);
    }

    #[test]
    fn weekly_reset_is_sunday() {
        // 2026-03-04 is a Wednesday; the following Sunday is 2026-03-08.
        let wed = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap().timestamp();
        let reset = next_weekly_reset(wed);
        let expected = Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap().timestamp();
        assert_eq!(reset, expected);
    }

    #[test]
    fn limit_change_resets_usage() {
        let q = QuotaEnforcer::new(false);
        let quota = rolling_quota(100, 3600);
        let now = 1_700_000_000;
        q.record_at("erin", &quota, &tokens(90, 0), now);

        let raised = rolling_quota(500, 3600);
        let decision = q.check_at("erin", &raised, now + 1);
        assert_eq!(decision.current_usage, 0.0);
        assert!(decision.allowed);
    }

    #[test]
    fn request_count_quota_adds_one() {
        let q = QuotaEnforcer::new(false);
        let quota = QuotaConfig {
            limit_type: QuotaLimitType::Requests,
            ..rolling_quota(2, 3600)
        };
        let now = 1_700_000_000;
        q.record_at("frank", &quota, &tokens(9999, 9999), now);
        let decision = q.check_at("frank", &quota, now);
        assert!((decision.current_usage - 1.0).abs() < 1e-9);
        assert!(decision.allowed);
    }
}
