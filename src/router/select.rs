//! Target selection strategies.
//!
//! Given the eligible targets for an alias, pick the next one to attempt.
//! Targets already attempted in this dispatch are never returned again; when
//! every target has been attempted the selector returns `None` and the
//! dispatcher gives up.

use rand::Rng;
use std::collections::BTreeMap;

use super::RouteTarget;
use crate::config::SelectorStrategy;
use crate::perf::{Metric, PerformanceStore};
use crate::pricing::OpenRouterRates;

pub struct SelectorContext<'a> {
    /// `(provider, model)` pairs already attempted in this dispatch.
    pub previous_attempts: &'a [(String, String)],
    pub perf: Option<&'a PerformanceStore>,
    pub openrouter: &'a BTreeMap<String, OpenRouterRates>,
}

impl<'a> SelectorContext<'a> {
    fn attempted(&self, target: &RouteTarget) -> bool {
        self.previous_attempts
            .iter()
            .any(|(p, m)| p == &target.provider && m == &target.model)
    }
}

fn weighted_pick(targets: Vec<RouteTarget>) -> Option<RouteTarget> {
    if targets.is_empty() {
        return None;
    }
    let weights: Vec<f64> = targets
        .iter()
        .map(|t| t.weight.unwrap_or(1.0).max(0.0))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        let index = rand::thread_rng().gen_range(0..targets.len());
        return targets.into_iter().nth(index);
    }
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if roll < *weight {
            return targets.into_iter().nth(index);
        }
        roll -= weight;
    }
    targets.into_iter().last()
}

fn min_by_score(
    targets: Vec<RouteTarget>,
    score: impl Fn(&RouteTarget) -> f64,
    random_tie_break: bool,
) -> Option<RouteTarget> {
    if targets.is_empty() {
        return None;
    }
    let scores: Vec<f64> = targets.iter().map(&score).collect();
    let best = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut candidates: Vec<RouteTarget> = targets
        .into_iter()
        .zip(scores)
        .filter(|(_, s)| (*s - best).abs() < f64::EPSILON || (s.is_infinite() && best.is_infinite()))
        .map(|(t, _)| t)
        .collect();
    if candidates.len() == 1 {
        return candidates.pop();
    }
    if random_tie_break {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.into_iter().nth(index)
    } else {
        candidates.sort_by(|a, b| a.provider.cmp(&b.provider));
        candidates.into_iter().next()
    }
}

/// Pick the next target, or `None` when no un-attempted target remains.
pub fn select(
    targets: &[RouteTarget],
    strategy: SelectorStrategy,
    ctx: &SelectorContext<'_>,
) -> Option<RouteTarget> {
    let remaining: Vec<RouteTarget> = targets
        .iter()
        .filter(|t| !ctx.attempted(t))
        .cloned()
        .collect();
    if remaining.is_empty() {
        return None;
    }

    match strategy {
        SelectorStrategy::InOrder => remaining.into_iter().next(),
        SelectorStrategy::Weighted => weighted_pick(remaining),
        SelectorStrategy::Random => {
            // Uniform unless any target carries a weight.
            if remaining.iter().any(|t| t.weight.is_some()) {
                weighted_pick(remaining)
            } else {
                let index = rand::thread_rng().gen_range(0..remaining.len());
                remaining.into_iter().nth(index)
            }
        }
        SelectorStrategy::Cost => min_by_score(
            remaining,
            |t| {
                t.model_config
                    .as_ref()
                    .and_then(|mc| mc.pricing.as_ref())
                    .map(|p| p.rank_per_million(ctx.openrouter))
                    .unwrap_or(f64::INFINITY)
            },
            false,
        ),
        SelectorStrategy::Latency => min_by_score(
            remaining,
            |t| {
                ctx.perf
                    .and_then(|perf| perf.percentile(&t.provider, &t.model, Metric::DurationMs, 95.0))
                    .unwrap_or(f64::INFINITY)
            },
            true,
        ),
        SelectorStrategy::Performance => min_by_score(
            remaining,
            |t| {
                ctx.perf
                    .and_then(|perf| perf.mean_ms_per_token(&t.provider, &t.model))
                    .unwrap_or(f64::INFINITY)
            },
            true,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, ProviderModelConfig};
    use crate::perf::PerformanceSample;
    use crate::pricing::Pricing;
    use crate::transform::ApiType;

    fn target(provider: &str, model: &str) -> RouteTarget {
        RouteTarget {
            provider: provider.to_string(),
            model: model.to_string(),
            weight: None,
            api_type: ApiType::Chat,
            provider_config: ProviderConfig::default(),
            model_config: None,
            provider_discount: None,
        }
    }

    fn priced_target(provider: &str, input: f64, output: f64) -> RouteTarget {
        let mut t = target(provider, "m");
        t.model_config = Some(ProviderModelConfig {
            pricing: Some(Pricing::Simple { input, output, cached: 0.0 }),
            access_via: Vec::new(),
        });
        t
    }

    fn ctx<'a>(
        attempts: &'a [(String, String)],
        perf: Option<&'a PerformanceStore>,
        table: &'a BTreeMap<String, OpenRouterRates>,
    ) -> SelectorContext<'a> {
        SelectorContext { previous_attempts: attempts, perf, openrouter: table }
    }

    #[test]
    fn in_order_skips_attempted() {
        let targets = vec![target("a", "m"), target("b", "m")];
        let table = BTreeMap::new();

        let none: Vec<(String, String)> = Vec::new();
        let picked = select(&targets, SelectorStrategy::InOrder, &ctx(&none, None, &table)).unwrap();
        assert_eq!(picked.provider, "a");

        let attempted = vec![("a".to_string(), "m".to_string())];
        let picked = select(&targets, SelectorStrategy::InOrder, &ctx(&attempted, None, &table)).unwrap();
        assert_eq!(picked.provider, "b");

        let all = vec![
            ("a".to_string(), "m".to_string()),
            ("b".to_string(), "m".to_string()),
        ];
        assert!(select(&targets, SelectorStrategy::InOrder, &ctx(&all, None, &table)).is_none());
    }

    #[test]
    fn random_returns_one_of_the_targets() {
        let targets = vec![target("a", "m"), target("b", "m")];
        let table = BTreeMap::new();
        let none: Vec<(String, String)> = Vec::new();
        for _ in 0..16 {
            let picked = select(&targets, SelectorStrategy::Random, &ctx(&none, None, &table)).unwrap();
            assert!(picked.provider == "a" || picked.provider == "b");
        }
    }

    #[test]
    fn weighted_respects_zero_weight() {
        let mut heavy = target("heavy", "m");
        heavy.weight = Some(5.0);
        let mut never = target("never", "m");
        never.weight = Some(0.0);
        let targets = vec![never, heavy];
        let table = BTreeMap::new();
        let none: Vec<(String, String)> = Vec::new();
        for _ in 0..32 {
            let picked = select(&targets, SelectorStrategy::Weighted, &ctx(&none, None, &table)).unwrap();
            assert_eq!(picked.provider, "heavy");
        }
    }

    #[test]
    fn cost_picks_cheapest_with_alphabetical_tie_break() {
        let targets = vec![
            priced_target("zeta", 1.0, 2.0),
            priced_target("alpha", 5.0, 10.0),
        ];
        let table = BTreeMap::new();
        let none: Vec<(String, String)> = Vec::new();
        let picked = select(&targets, SelectorStrategy::Cost, &ctx(&none, None, &table)).unwrap();
        assert_eq!(picked.provider, "zeta");

        // Identical pricing: alphabetical provider wins, deterministically.
        let tied = vec![priced_target("zeta", 1.0, 2.0), priced_target("alpha", 1.0, 2.0)];
        for _ in 0..8 {
            let picked = select(&tied, SelectorStrategy::Cost, &ctx(&none, None, &table)).unwrap();
            assert_eq!(picked.provider, "alpha");
        }
    }

    #[test]
    fn latency_prefers_lower_p95() {
        let perf = PerformanceStore::new(false);
        for d in [100, 120, 110] {
            perf.record(PerformanceSample {
                provider: "fast".to_string(),
                model: "m".to_string(),
                canonical_model: None,
                request_id: "r".to_string(),
                ttft_ms: None,
                total_tokens: Some(10),
                duration_ms: d,
                tokens_per_sec: None,
                created_at: chrono::Utc::now().timestamp(),
            });
        }
        for d in [900, 1000, 950] {
            perf.record(PerformanceSample {
                provider: "slow".to_string(),
                model: "m".to_string(),
                canonical_model: None,
                request_id: "r".to_string(),
                ttft_ms: None,
                total_tokens: Some(10),
                duration_ms: d,
                tokens_per_sec: None,
                created_at: chrono::Utc::now().timestamp(),
            });
        }
        let targets = vec![target("slow", "m"), target("fast", "m")];
        let table = BTreeMap::new();
        let none: Vec<(String, String)> = Vec::new();
        let picked = select(&targets, SelectorStrategy::Latency, &ctx(&none, Some(&perf), &table)).unwrap();
        assert_eq!(picked.provider, "fast");
    }
}
