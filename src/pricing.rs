//! Pricing models and cost calculation.
//!
//! A pricing entry is one of four shapes: flat per-million rates, input-size
//! tiered rates, an OpenRouter per-token rate lookup, or a flat per-request
//! fee. All computed costs are rounded to 8 decimals.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Token counts accumulated for a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: i64,
    pub output: i64,
    pub reasoning: i64,
    pub cached: i64,
    pub cache_write: i64,
}

impl TokenCounts {
    pub fn total(&self) -> i64 {
        self.input + self.output + self.reasoning + self.cached
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub lower: i64,
    pub upper: i64,
    pub input_per_m: f64,
    pub output_per_m: f64,
}

/// Per-token rates for an OpenRouter slug. Rates are decimal strings in USD
/// per token, matching the upstream pricing feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenRouterRates {
    pub prompt: String,
    pub completion: String,
    pub input_cache_read: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Pricing {
    Simple {
        input: f64,
        output: f64,
        #[serde(default)]
        cached: f64,
    },
    Defined {
        range: Vec<PriceRange>,
    },
    Openrouter {
        slug: String,
        discount: Option<f64>,
    },
    PerRequest {
        amount: f64,
    },
}

impl Pricing {
    /// Validate a pricing entry at config-load time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Pricing::Simple { input, output, cached } => {
                if *input < 0.0 || *output < 0.0 || *cached < 0.0 {
                    return Err("simple pricing rates must be non-negative".to_string());
                }
                Ok(())
            }
            Pricing::Defined { range } => {
                if range.is_empty() {
                    return Err("defined pricing requires at least one range".to_string());
                }
                for r in range {
                    if r.lower > r.upper {
                        return Err(format!(
                            "defined pricing range [{}, {}] has lower > upper",
                            r.lower, r.upper
                        ));
                    }
                }
                for (i, a) in range.iter().enumerate() {
                    for b in range.iter().skip(i + 1) {
                        if a.lower <= b.upper && b.lower <= a.upper {
                            return Err(format!(
                                "defined pricing ranges [{}, {}] and [{}, {}] overlap",
                                a.lower, a.upper, b.lower, b.upper
                            ));
                        }
                    }
                }
                Ok(())
            }
            Pricing::Openrouter { slug, discount } => {
                if slug.trim().is_empty() {
                    return Err("openrouter pricing requires a slug".to_string());
                }
                if let Some(d) = discount {
                    if !(0.0..=1.0).contains(d) {
                        return Err("openrouter discount must be within [0, 1]".to_string());
                    }
                }
                Ok(())
            }
            Pricing::PerRequest { amount } => {
                if *amount < 0.0 {
                    return Err("per_request pricing amount must be non-negative".to_string());
                }
                Ok(())
            }
        }
    }

    pub fn source_name(&self) -> &'static str {
        match self {
            Pricing::Simple { .. } => "simple",
            Pricing::Defined { .. } => "defined",
            Pricing::Openrouter { .. } => "openrouter",
            Pricing::PerRequest { .. } => "per_request",
        }
    }

    /// Comparable USD-per-million-token figure used by the `cost` selector.
    /// Flat per-request fees rank by the fee alone.
    pub fn rank_per_million(&self, table: &BTreeMap<String, OpenRouterRates>) -> f64 {
        match self {
            Pricing::Simple { input, output, .. } => input + output,
            Pricing::Defined { range } => range
                .first()
                .map(|r| r.input_per_m + r.output_per_m)
                .unwrap_or(f64::INFINITY),
            Pricing::Openrouter { slug, .. } => table
                .get(slug)
                .map(|r| {
                    (parse_rate(&r.prompt) + parse_rate(&r.completion)) * 1_000_000.0
                })
                .unwrap_or(f64::INFINITY),
            Pricing::PerRequest { amount } => *amount,
        }
    }
}

/// Result of applying a pricing entry to token counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cached: f64,
    pub cache_write: f64,
    pub total: f64,
    pub source: String,
    pub metadata: Value,
}

fn round8(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}

fn parse_rate(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(0.0)
}

/// Apply a pricing entry to token counts, producing a cost breakdown.
///
/// `provider_discount` multiplies every sub-cost except `per_request` fees.
/// Unknown pricing yields an all-zero breakdown with source `"default"`.
pub fn calculate(
    tokens: &TokenCounts,
    pricing: Option<&Pricing>,
    provider_discount: Option<f64>,
    table: &BTreeMap<String, OpenRouterRates>,
) -> CostBreakdown {
    let Some(pricing) = pricing else {
        return CostBreakdown {
            source: "default".to_string(),
            metadata: Value::Null,
            ..Default::default()
        };
    };

    let mut cost = match pricing {
        Pricing::Simple { input, output, cached } => CostBreakdown {
            input: tokens.input as f64 / 1e6 * input,
            output: tokens.output as f64 / 1e6 * output,
            cached: tokens.cached as f64 / 1e6 * cached,
            cache_write: 0.0,
            total: 0.0,
            source: pricing.source_name().to_string(),
            metadata: json!({ "input_per_m": input, "output_per_m": output, "cached_per_m": cached }),
        },
        Pricing::Defined { range } => {
            let matched = range
                .iter()
                .find(|r| tokens.input >= r.lower && tokens.input <= r.upper);
            match matched {
                Some(r) => CostBreakdown {
                    input: tokens.input as f64 / 1e6 * r.input_per_m,
                    output: tokens.output as f64 / 1e6 * r.output_per_m,
                    cached: 0.0,
                    cache_write: 0.0,
                    total: 0.0,
                    source: pricing.source_name().to_string(),
                    metadata: json!({ "range": { "lower": r.lower, "upper": r.upper } }),
                },
                None => CostBreakdown {
                    source: "default".to_string(),
                    metadata: json!({ "reason": "no matching range", "input_tokens": tokens.input }),
                    ..Default::default()
                },
            }
        }
        Pricing::Openrouter { slug, discount } => {
            let Some(rates) = table.get(slug) else {
                return CostBreakdown {
                    source: "default".to_string(),
                    metadata: json!({ "reason": "unknown openrouter slug", "slug": slug }),
                    ..Default::default()
                };
            };
            let factor = 1.0 - discount.unwrap_or(0.0);
            let cache_rate = rates
                .input_cache_read
                .as_deref()
                .map(parse_rate)
                .unwrap_or(0.0);
            CostBreakdown {
                input: tokens.input as f64 * parse_rate(&rates.prompt) * factor,
                output: tokens.output as f64 * parse_rate(&rates.completion) * factor,
                cached: tokens.cached as f64 * cache_rate * factor,
                cache_write: 0.0,
                total: 0.0,
                source: pricing.source_name().to_string(),
                metadata: json!({ "slug": slug, "discount": discount }),
            }
        }
        Pricing::PerRequest { amount } => {
            // Flat fee on the input side; token counts and discounts are ignored.
            let amount = round8(*amount);
            return CostBreakdown {
                input: amount,
                output: 0.0,
                cached: 0.0,
                cache_write: 0.0,
                total: amount,
                source: pricing.source_name().to_string(),
                metadata: json!({ "amount": amount }),
            };
        }
    };

    if let Some(discount) = provider_discount {
        if discount > 0.0 {
            let factor = 1.0 - discount.clamp(0.0, 1.0);
            cost.input *= factor;
            cost.output *= factor;
            cost.cached *= factor;
            cost.cache_write *= factor;
            if let Some(obj) = cost.metadata.as_object_mut() {
                obj.insert("provider_discount".to_string(), json!(discount));
            }
        }
    }

    cost.input = round8(cost.input);
    cost.output = round8(cost.output);
    cost.cached = round8(cost.cached);
    cost.cache_write = round8(cost.cache_write);
    cost.total = round8(cost.input + cost.output + cost.cached + cost.cache_write);
    cost
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_table() -> BTreeMap<String, OpenRouterRates> {
        BTreeMap::new()
    }

    #[test]
    fn simple_pricing_breakdown() {
        let pricing = Pricing::Simple {
            input: 3.0,
            output: 15.0,
            cached: 0.3,
        };
        let tokens = TokenCounts {
            input: 2000,
            output: 500,
            cached: 200,
            ..Default::default()
        };
        let cost = calculate(&tokens, Some(&pricing), None, &no_table());
        assert!((cost.input - 0.006).abs() < 1e-9);
        assert!((cost.output - 0.0075).abs() < 1e-9);
        assert!((cost.cached - 0.00006).abs() < 1e-9);
        assert!((cost.total - 0.01356).abs() < 1e-8);
        assert_eq!(cost.source, "simple");
    }

    #[test]
    fn per_request_flat_fee() {
        let pricing = Pricing::PerRequest { amount: 0.25 };
        let tokens = TokenCounts {
            input: 999_999,
            output: 123_456,
            ..Default::default()
        };
        let cost = calculate(&tokens, Some(&pricing), Some(0.5), &no_table());
        assert_eq!(cost.input, 0.25);
        assert_eq!(cost.output, 0.0);
        assert_eq!(cost.cached, 0.0);
        assert_eq!(cost.total, 0.25);
    }

    #[test]
    fn defined_pricing_picks_first_matching_range() {
        let pricing = Pricing::Defined {
            range: vec![
                PriceRange { lower: 0, upper: 1000, input_per_m: 1.0, output_per_m: 2.0 },
                PriceRange { lower: 1001, upper: 100_000, input_per_m: 2.0, output_per_m: 4.0 },
            ],
        };
        let tokens = TokenCounts { input: 5000, output: 1000, ..Default::default() };
        let cost = calculate(&tokens, Some(&pricing), None, &no_table());
        assert!((cost.input - 0.01).abs() < 1e-9);
        assert!((cost.output - 0.004).abs() < 1e-9);
    }

    #[test]
    fn openrouter_rates_with_discount() {
        let mut table = BTreeMap::new();
        table.insert(
            "acme/model".to_string(),
            OpenRouterRates {
                prompt: "0.000001".to_string(),
                completion: "0.000002".to_string(),
                input_cache_read: Some("0.0000005".to_string()),
            },
        );
        let pricing = Pricing::Openrouter {
            slug: "acme/model".to_string(),
            discount: Some(0.5),
        };
        let tokens = TokenCounts { input: 1_000_000, output: 500_000, cached: 100_000, ..Default::default() };
        let cost = calculate(&tokens, Some(&pricing), None, &table);
        assert!((cost.input - 0.5).abs() < 1e-8);
        assert!((cost.output - 0.5).abs() < 1e-8);
        assert!((cost.cached - 0.025).abs() < 1e-8);
    }

    #[test]
    fn unknown_pricing_is_all_zero_default() {
        let tokens = TokenCounts { input: 100, output: 100, ..Default::default() };
        let cost = calculate(&tokens, None, None, &no_table());
        assert_eq!(cost.total, 0.0);
        assert_eq!(cost.source, "default");
    }

    #[test]
    fn total_is_sum_of_parts() {
        let pricing = Pricing::Simple { input: 1.37, output: 9.11, cached: 0.77 };
        let tokens = TokenCounts { input: 12345, output: 678, cached: 90, ..Default::default() };
        let cost = calculate(&tokens, Some(&pricing), Some(0.13), &no_table());
        assert!((cost.total - (cost.input + cost.output + cost.cached + cost.cache_write)).abs() < 1e-8);
    }

    #[test]
    fn overlapping_defined_ranges_rejected() {
        let pricing = Pricing::Defined {
            range: vec![
                PriceRange { lower: 0, upper: 1000, input_per_m: 1.0, output_per_m: 1.0 },
                PriceRange { lower: 500, upper: 2000, input_per_m: 2.0, output_per_m: 2.0 },
            ],
        };
        assert!(pricing.validate().is_err());
    }

    #[test]
    fn negative_per_request_rejected() {
        assert!(Pricing::PerRequest { amount: -0.01 }.validate().is_err());
    }
}
