//! Cooldown tracking for provider targets.
//!
//! A failed dispatch puts its `(provider, model[, account])` tuple on a timed
//! cooldown; the router filters cooled-down targets out of selection until
//! the timer expires. Consecutive failures escalate the duration within the
//! configured bounds, and a successful dispatch resets the entry. Entries are
//! written through to `provider_cooldowns` so restarts keep active timers.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::CooldownSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    RateLimit,
    AuthError,
    Timeout,
    ServerError,
    ConnectionError,
}

impl CooldownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::RateLimit => "rate_limit",
            CooldownReason::AuthError => "auth_error",
            CooldownReason::Timeout => "timeout",
            CooldownReason::ServerError => "server_error",
            CooldownReason::ConnectionError => "connection_error",
        }
    }

    fn base_secs(&self, settings: &CooldownSettings) -> u64 {
        match self {
            CooldownReason::RateLimit => settings.rate_limit_secs,
            CooldownReason::AuthError => settings.auth_error_secs,
            CooldownReason::Timeout => settings.timeout_secs,
            CooldownReason::ServerError => settings.server_error_secs,
            CooldownReason::ConnectionError => settings.connection_error_secs,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CooldownKey {
    provider: String,
    model: String,
    account_id: String,
}

impl CooldownKey {
    fn new(provider: &str, model: &str, account_id: Option<&str>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            account_id: account_id.unwrap_or("").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CooldownRecord {
    expiry_epoch: i64,
    consecutive_failures: u32,
    created_at: i64,
}

/// Snapshot of one active cooldown, for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCooldown {
    pub provider: String,
    pub model: String,
    pub account_id: Option<String>,
    pub remaining_secs: i64,
    pub consecutive_failures: u32,
}

pub struct CooldownManager {
    entries: Mutex<HashMap<CooldownKey, CooldownRecord>>,
    persist: bool,
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

impl CooldownManager {
    pub fn new(persist: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            persist,
        }
    }

    /// Restore active entries from the database. Expired rows are dropped.
    pub fn load_persisted(&self) {
        if !self.persist {
            return;
        }
        let now = now_epoch();
        let mut entries = self.entries.lock().unwrap();
        for row in crate::db::load_cooldowns() {
            if row.expiry_epoch <= now {
                continue;
            }
            entries.insert(
                CooldownKey {
                    provider: row.provider,
                    model: row.model,
                    account_id: row.account_id,
                },
                CooldownRecord {
                    expiry_epoch: row.expiry_epoch,
                    consecutive_failures: row.consecutive_failures as u32,
                    created_at: row.created_at,
                },
            );
        }
    }

    pub fn is_on_cooldown(&self, provider: &str, model: &str, account_id: Option<&str>) -> bool {
        self.remaining_secs(provider, model, account_id) > 0
    }

    pub fn remaining_secs(&self, provider: &str, model: &str, account_id: Option<&str>) -> i64 {
        self.remaining_secs_at(provider, model, account_id, now_epoch())
    }

    pub fn remaining_secs_at(
        &self,
        provider: &str,
        model: &str,
        account_id: Option<&str>,
        now: i64,
    ) -> i64 {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&CooldownKey::new(provider, model, account_id))
            .map(|r| (r.expiry_epoch - now).max(0))
            .unwrap_or(0)
    }

    /// Put a target on cooldown. `retry_after_secs` (from a Retry-After
    /// header) overrides the reason's base duration; consecutive failures
    /// double the base duration, all clamped to the configured bounds.
    pub fn set_cooldown(
        &self,
        provider: &str,
        model: &str,
        account_id: Option<&str>,
        reason: CooldownReason,
        retry_after_secs: Option<u64>,
        settings: &CooldownSettings,
    ) -> i64 {
        let key = CooldownKey::new(provider, model, account_id);
        let now = now_epoch();

        let mut entries = self.entries.lock().unwrap();
        let failures = entries
            .get(&key)
            .map(|r| r.consecutive_failures + 1)
            .unwrap_or(1);

        let base = retry_after_secs.unwrap_or_else(|| {
            let escalated = reason.base_secs(settings).saturating_mul(1u64 << (failures - 1).min(6));
            escalated
        });
        let duration = base.clamp(settings.min_secs, settings.max_secs.max(settings.min_secs));
        let record = CooldownRecord {
            expiry_epoch: now + duration as i64,
            consecutive_failures: failures,
            created_at: now,
        };
        entries.insert(key.clone(), record);
        drop(entries);

        crate::logger::warn(
            "cooldown",
            &format!(
                "{}/{} on {}s cooldown (reason={}, failures={})",
                provider,
                model,
                duration,
                reason.as_str(),
                failures
            ),
        );

        if self.persist {
            crate::db::upsert_cooldown(&crate::db::PersistedCooldown {
                provider: key.provider,
                model: key.model,
                account_id: key.account_id,
                expiry_epoch: record.expiry_epoch,
                consecutive_failures: failures as i64,
                reason: Some(reason.as_str().to_string()),
                created_at: record.created_at,
            });
        }
        duration as i64
    }

    /// Successful dispatch: forget the failure history for this target.
    pub fn reset(&self, provider: &str, model: &str, account_id: Option<&str>) {
        let key = CooldownKey::new(provider, model, account_id);
        let removed = self.entries.lock().unwrap().remove(&key).is_some();
        if removed && self.persist {
            crate::db::delete_cooldown(&key.provider, &key.model, &key.account_id);
        }
    }

    /// Operator action: clear one provider's cooldowns, or all of them.
    pub fn clear(&self, provider: Option<&str>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        match provider {
            Some(p) => entries.retain(|k, _| k.provider != p),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        drop(entries);
        if self.persist {
            crate::db::clear_cooldowns(provider);
        }
        removed
    }

    /// Keep only targets not currently on cooldown.
    pub fn filter_healthy<T>(
        &self,
        targets: Vec<T>,
        key_of: impl Fn(&T) -> (&str, &str),
    ) -> Vec<T> {
        targets
            .into_iter()
            .filter(|t| {
                let (provider, model) = key_of(t);
                !self.is_on_cooldown(provider, model, None)
            })
            .collect()
    }

    pub fn active(&self) -> Vec<ActiveCooldown> {
        let now = now_epoch();
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, r)| r.expiry_epoch > now)
            .map(|(k, r)| ActiveCooldown {
                provider: k.provider.clone(),
                model: k.model.clone(),
                account_id: if k.account_id.is_empty() { None } else { Some(k.account_id.clone()) },
                remaining_secs: r.expiry_epoch - now,
                consecutive_failures: r.consecutive_failures,
            })
            .collect()
    }
}

static GLOBAL: Lazy<CooldownManager> = Lazy::new(|| CooldownManager::new(true));

pub fn global() -> &'static CooldownManager {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CooldownSettings {
        CooldownSettings::default()
    }

    fn manager() -> CooldownManager {
        CooldownManager::new(false)
    }

    #[test]
    fn set_and_expire() {
        let m = manager();
        let dur = m.set_cooldown("p", "m", None, CooldownReason::RateLimit, None, &settings());
        assert_eq!(dur, 60);
        assert!(m.is_on_cooldown("p", "m", None));
        assert!(!m.is_on_cooldown("p", "other", None));
    }

    #[test]
    fn remaining_is_monotonic_in_now() {
        let m = manager();
        m.set_cooldown("p", "m", None, CooldownReason::ServerError, None, &settings());
        let now = chrono::Utc::now().timestamp();
        let r0 = m.remaining_secs_at("p", "m", None, now);
        let r1 = m.remaining_secs_at("p", "m", None, now + 10);
        let r2 = m.remaining_secs_at("p", "m", None, now + 10_000);
        assert!(r1 <= r0);
        assert!(r2 <= r1);
        assert_eq!(r2, 0);
    }

    #[test]
    fn consecutive_failures_escalate() {
        let m = manager();
        let d1 = m.set_cooldown("p", "m", None, CooldownReason::Timeout, None, &settings());
        let d2 = m.set_cooldown("p", "m", None, CooldownReason::Timeout, None, &settings());
        let d3 = m.set_cooldown("p", "m", None, CooldownReason::Timeout, None, &settings());
        assert!(d2 >= d1);
        assert!(d3 >= d2);
        assert!(d3 <= settings().max_secs as i64);
    }

    #[test]
    fn retry_after_overrides_base() {
        let m = manager();
        let dur = m.set_cooldown("p", "m", None, CooldownReason::RateLimit, Some(120), &settings());
        assert_eq!(dur, 120);
    }

    #[test]
    fn success_resets_failures() {
        let m = manager();
        m.set_cooldown("p", "m", None, CooldownReason::ServerError, None, &settings());
        m.set_cooldown("p", "m", None, CooldownReason::ServerError, None, &settings());
        m.reset("p", "m", None);
        assert!(!m.is_on_cooldown("p", "m", None));
        let d = m.set_cooldown("p", "m", None, CooldownReason::ServerError, None, &settings());
        assert_eq!(d, settings().server_error_secs as i64);
    }

    #[test]
    fn account_scoped_entries_are_distinct() {
        let m = manager();
        m.set_cooldown("p", "m", Some("acct-1"), CooldownReason::AuthError, None, &settings());
        assert!(m.is_on_cooldown("p", "m", Some("acct-1")));
        assert!(!m.is_on_cooldown("p", "m", None));
    }

    #[test]
    fn filter_healthy_drops_cooled_targets() {
        let m = manager();
        m.set_cooldown("a", "m1", None, CooldownReason::RateLimit, None, &settings());
        let targets = vec![("a", "m1"), ("b", "m2")];
        let healthy = m.filter_healthy(targets, |t| (t.0, t.1));
        assert_eq!(healthy, vec![("b", "m2")]);
    }

    #[test]
    fn clear_by_provider() {
        let m = manager();
        m.set_cooldown("a", "m", None, CooldownReason::RateLimit, None, &settings());
        m.set_cooldown("b", "m", None, CooldownReason::RateLimit, None, &settings());
        assert_eq!(m.clear(Some("a")), 1);
        assert!(!m.is_on_cooldown("a", "m", None));
        assert!(m.is_on_cooldown("b", "m", None));
    }
}
