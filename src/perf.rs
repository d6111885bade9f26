//! Sliding-window performance metrics per provider target.
//!
//! Completed requests record time-to-first-token, duration, and throughput;
//! the `latency` and `performance` selector strategies read aggregates back
//! out. The in-memory window is a bounded ring per (provider, model); samples
//! are also written through to `provider_performance`.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const WINDOW_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub provider: String,
    pub model: String,
    pub canonical_model: Option<String>,
    pub request_id: String,
    pub ttft_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub duration_ms: i64,
    pub tokens_per_sec: Option<f64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TtftMs,
    DurationMs,
    TokensPerSec,
}

pub struct PerformanceStore {
    windows: Mutex<HashMap<(String, String), VecDeque<PerformanceSample>>>,
    persist: bool,
}

impl PerformanceStore {
    pub fn new(persist: bool) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            persist,
        }
    }

    pub fn record(&self, sample: PerformanceSample) {
        if self.persist {
            crate::db::insert_performance_sample(
                &sample.provider,
                &sample.model,
                sample.canonical_model.as_deref(),
                &sample.request_id,
                sample.ttft_ms,
                sample.total_tokens,
                sample.duration_ms,
                sample.tokens_per_sec,
            );
            crate::db::update_performance_metrics(
                &sample.request_id,
                sample.ttft_ms,
                Some(sample.duration_ms),
                sample.tokens_per_sec,
            );
        }
        let key = (sample.provider.clone(), sample.model.clone());
        let mut windows = self.windows.lock().unwrap();
        let ring = windows.entry(key).or_default();
        ring.push_back(sample);
        while ring.len() > WINDOW_SIZE {
            ring.pop_front();
        }
    }

    fn values(&self, provider: &str, model: &str, metric: Metric, max_age_secs: Option<i64>) -> Vec<f64> {
        let cutoff = max_age_secs.map(|age| chrono::Utc::now().timestamp() - age);
        let windows = self.windows.lock().unwrap();
        let Some(ring) = windows.get(&(provider.to_string(), model.to_string())) else {
            return Vec::new();
        };
        ring.iter()
            .filter(|s| cutoff.map(|c| s.created_at >= c).unwrap_or(true))
            .filter_map(|s| match metric {
                Metric::TtftMs => s.ttft_ms.map(|v| v as f64),
                Metric::DurationMs => Some(s.duration_ms as f64),
                Metric::TokensPerSec => s.tokens_per_sec,
            })
            .collect()
    }

    pub fn mean(&self, provider: &str, model: &str, metric: Metric) -> Option<f64> {
        let values = self.values(provider, model, metric, None);
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Nearest-rank percentile over the window, `p` in [0, 100].
    pub fn percentile(&self, provider: &str, model: &str, metric: Metric, p: f64) -> Option<f64> {
        let mut values = self.values(provider, model, metric, None);
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
        Some(values[rank.clamp(1, values.len()) - 1])
    }

    /// Mean milliseconds per output token; the `performance` strategy ranks
    /// targets by this.
    pub fn mean_ms_per_token(&self, provider: &str, model: &str) -> Option<f64> {
        let windows = self.windows.lock().unwrap();
        let ring = windows.get(&(provider.to_string(), model.to_string()))?;
        let ratios: Vec<f64> = ring
            .iter()
            .filter_map(|s| match s.total_tokens {
                Some(tokens) if tokens > 0 => Some(s.duration_ms as f64 / tokens as f64),
                _ => None,
            })
            .collect();
        if ratios.is_empty() {
            return None;
        }
        Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
    }

    pub fn sample_count(&self, provider: &str, model: &str) -> usize {
        let windows = self.windows.lock().unwrap();
        windows
            .get(&(provider.to_string(), model.to_string()))
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

static GLOBAL: Lazy<PerformanceStore> = Lazy::new(|| PerformanceStore::new(true));

pub fn global() -> &'static PerformanceStore {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(provider: &str, model: &str, duration_ms: i64, tokens: i64) -> PerformanceSample {
        PerformanceSample {
            provider: provider.to_string(),
            model: model.to_string(),
            canonical_model: None,
            request_id: "r".to_string(),
            ttft_ms: Some(duration_ms / 10),
            total_tokens: Some(tokens),
            duration_ms,
            tokens_per_sec: Some(tokens as f64 / (duration_ms as f64 / 1000.0)),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    #[test]
    fn mean_and_percentile() {
        let store = PerformanceStore::new(false);
        for d in [100, 200, 300, 400, 500] {
            store.record(sample("p", "m", d, 100));
        }
        assert_eq!(store.mean("p", "m", Metric::DurationMs), Some(300.0));
        assert_eq!(store.percentile("p", "m", Metric::DurationMs, 95.0), Some(500.0));
        assert_eq!(store.percentile("p", "m", Metric::DurationMs, 50.0), Some(300.0));
    }

    #[test]
    fn empty_window_is_none() {
        let store = PerformanceStore::new(false);
        assert!(store.mean("p", "m", Metric::DurationMs).is_none());
        assert!(store.percentile("p", "m", Metric::TtftMs, 95.0).is_none());
    }

    #[test]
    fn window_is_bounded() {
        let store = PerformanceStore::new(false);
        for i in 0..(WINDOW_SIZE + 50) {
            store.record(sample("p", "m", i as i64 + 1, 10));
        }
        assert_eq!(store.sample_count("p", "m"), WINDOW_SIZE);
        // Oldest samples were evicted, so the minimum survives from the tail.
        assert!(store.percentile("p", "m", Metric::DurationMs, 1.0).unwrap() > 50.0);
    }

    #[test]
    fn ms_per_token_ranks_throughput() {
        let store = PerformanceStore::new(false);
        store.record(sample("fast", "m", 1000, 1000));
        store.record(sample("slow", "m", 1000, 10));
        assert!(store.mean_ms_per_token("fast", "m").unwrap() < store.mean_ms_per_token("slow", "m").unwrap());
    }
}
