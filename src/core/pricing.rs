// src/core/pricing.rs — Pure credit cost computation
//
// cost = max(0, round(credits)) for a (rule, quantities) pair. No clock,
// no I/O: the same inputs always price the same.

use serde::{Deserialize, Serialize};

use crate::core::types::GenerationParams;
use crate::rules::{BillingType, PriceDimension, PriceEntry, PricingRule, PricingUnit};

/// Credits per second when no rule is configured and a duration is given.
const DEFAULT_CREDITS_PER_SECOND: f64 = 10.0;
/// Credits per output when no rule is configured and a quantity is given.
const DEFAULT_CREDITS_PER_ITEM: f64 = 20.0;
/// Characters per billing unit when a per-character price omits `unit_size`.
const DEFAULT_CHARACTER_UNIT: u32 = 100;

const DEFAULT_OPERATION: &str = "Imagine";
const DEFAULT_OPERATION_MODE: &str = "Relax";

/// The quantity dimensions a pricing rule may consume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantityParams {
    pub duration_secs: Option<f64>,
    pub resolution: Option<String>,
    pub mode: Option<String>,
    pub operation_type: Option<String>,
    pub quantity: Option<u32>,
    pub character_count: Option<u64>,
}

impl QuantityParams {
    pub fn from_params(params: &GenerationParams, prompt: &str) -> Self {
        Self {
            duration_secs: params.duration_secs,
            resolution: params.resolution.clone(),
            mode: params.mode.clone(),
            operation_type: params.operation_type.clone(),
            quantity: params.quantity,
            character_count: Some(prompt.chars().count() as u64),
        }
    }

    fn duration(&self) -> f64 {
        self.duration_secs.filter(|d| *d > 0.0).unwrap_or(0.0)
    }
}

/// Price an operation. `None` means no rule is configured for the capability.
pub fn compute_cost(rule: Option<&PricingRule>, q: &QuantityParams) -> i64 {
    let credits = match rule {
        None => default_cost(q),
        Some(r) if !r.active => 0.0,
        Some(r) => match r.billing_type {
            BillingType::PerRequest => r.base_credits,
            BillingType::PerImage => per_image(r, q),
            BillingType::PerDuration => per_duration(r, q),
            BillingType::DurationResolution => duration_resolution(r, q),
            BillingType::PerCharacter => per_character(r, q),
            BillingType::DurationMode => duration_mode(r, q),
            BillingType::OperationMode => operation_mode(r, q),
        },
    };
    if credits.is_finite() {
        credits.round().max(0.0) as i64
    } else {
        0
    }
}

fn default_cost(q: &QuantityParams) -> f64 {
    let duration = q.duration();
    if duration > 0.0 {
        return duration * DEFAULT_CREDITS_PER_SECOND;
    }
    match q.quantity {
        Some(n) if n > 0 => n as f64 * DEFAULT_CREDITS_PER_ITEM,
        _ => 0.0,
    }
}

fn prices_for(rule: &PricingRule, dimension: PriceDimension) -> Vec<&PriceEntry> {
    rule.prices
        .iter()
        .filter(|p| p.dimension == dimension)
        .collect()
}

fn rounded_duration(q: &QuantityParams, round_up: bool) -> f64 {
    let d = q.duration();
    if round_up {
        d.ceil()
    } else {
        d
    }
}

fn per_image(rule: &PricingRule, q: &QuantityParams) -> f64 {
    let quantity = q.quantity.filter(|n| *n > 0).unwrap_or(1) as f64;

    if let Some(ref requested) = q.resolution {
        let res_prices = prices_for(rule, PriceDimension::Resolution);
        if !res_prices.is_empty() {
            if let Some(exact) = res_prices
                .iter()
                .find(|p| p.value.eq_ignore_ascii_case(requested))
            {
                return exact.credits_per_unit * quantity;
            }

            let target = pixel_count(requested);
            if target > 0 {
                if let Some(nearest) = res_prices
                    .iter()
                    .min_by_key(|p| pixel_count(&p.value).abs_diff(target))
                {
                    return nearest.credits_per_unit * quantity;
                }
            }
        }
    }

    rule.base_credits * quantity
}

/// Pixel count for "1024x1024", "1024*768", a bare "1024" (square) or a
/// named alias. Unparseable or overflowing values count as 0.
pub fn pixel_count(res: &str) -> u64 {
    let lower = res.trim().to_ascii_lowercase();
    let alias = match lower.as_str() {
        "hd" => Some(1280 * 720),
        "fhd" => Some(1920 * 1080),
        "2k" => Some(2048 * 2048),
        "4k" | "uhd" => Some(3840 * 2160),
        "8k" => Some(7680 * 4320),
        _ => None,
    };
    if let Some(px) = alias {
        return px;
    }

    if let Some((w, h)) = lower.split_once(['x', '*']) {
        let w = leading_number(w.trim());
        let h = leading_number(h.trim());
        if let (Some(w), Some(h)) = (w, h) {
            return w.checked_mul(h).unwrap_or(0);
        }
    }

    leading_number(&lower)
        .and_then(|n| n.checked_mul(n))
        .unwrap_or(0)
}

/// First run of ASCII digits in `s`, e.g. "720p_5" -> 720.
fn first_number(s: &str) -> Option<u64> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let digits: String = s[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Digits at the very start of `s`, e.g. "1024px" -> 1024.
fn leading_number(s: &str) -> Option<u64> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn per_duration(rule: &PricingRule, q: &QuantityParams) -> f64 {
    rule.base_credits * rounded_duration(q, rule.round_up.unwrap_or(false))
}

fn duration_resolution(rule: &PricingRule, q: &QuantityParams) -> f64 {
    let duration = q.duration();
    let Some(ref requested) = q.resolution else {
        return 0.0;
    };
    if duration <= 0.0 {
        return 0.0;
    }

    let all = prices_for(rule, PriceDimension::Resolution);
    if all.is_empty() {
        return 0.0;
    }
    let target = first_number(requested).unwrap_or(0);

    // Entries are either "720p" (per second) or "720p_5" (flat price for a 5s tier).
    let mut bases: Vec<&str> = Vec::new();
    for p in &all {
        let base = p.value.split('_').next().unwrap_or(p.value.as_str());
        if !bases.contains(&base) {
            bases.push(base);
        }
    }
    let Some(matched) = bases
        .iter()
        .min_by_key(|b| first_number(b).unwrap_or(0).abs_diff(target))
        .copied()
    else {
        return 0.0;
    };

    let tier_prefix = format!("{matched}_");
    let mut tiers: Vec<(f64, &PriceEntry)> = all
        .iter()
        .filter_map(|p| {
            let secs = p.value.strip_prefix(&tier_prefix)?;
            Some((secs.parse::<f64>().unwrap_or(0.0), *p))
        })
        .collect();

    if !tiers.is_empty() {
        tiers.sort_by(|a, b| a.0.total_cmp(&b.0));
        let chosen = tiers
            .iter()
            .find(|(secs, _)| *secs >= duration)
            .or_else(|| tiers.last());
        return chosen.map(|(_, p)| p.credits_per_unit).unwrap_or(0.0);
    }

    match all.iter().find(|p| p.value == matched) {
        Some(linear) => {
            rounded_duration(q, rule.round_up.unwrap_or(true)) * linear.credits_per_unit
        }
        None => 0.0,
    }
}

fn per_character(rule: &PricingRule, q: &QuantityParams) -> f64 {
    let chars = match q.character_count {
        Some(c) if c > 0 => c,
        _ => return 0.0,
    };
    let Some(price) = rule.prices.first() else {
        return 0.0;
    };
    let unit = price
        .unit_size
        .filter(|u| *u > 0)
        .unwrap_or(DEFAULT_CHARACTER_UNIT) as u64;
    chars.div_ceil(unit) as f64 * price.credits_per_unit
}

fn duration_mode(rule: &PricingRule, q: &QuantityParams) -> f64 {
    let Some(ref mode) = q.mode else {
        return 0.0;
    };
    let modes = prices_for(rule, PriceDimension::Mode);
    let price = modes
        .iter()
        .find(|p| &p.value == mode)
        .or_else(|| {
            modes
                .iter()
                .find(|p| p.value == "std" || p.value == "standard")
        })
        .or_else(|| modes.first());
    let Some(price) = price else {
        return 0.0;
    };

    match rule.pricing_unit {
        PricingUnit::PerRequest => {
            q.quantity.filter(|n| *n > 0).unwrap_or(1) as f64 * price.credits_per_unit
        }
        PricingUnit::PerSecond => {
            rounded_duration(q, rule.round_up.unwrap_or(true)) * price.credits_per_unit
        }
    }
}

fn operation_mode(rule: &PricingRule, q: &QuantityParams) -> f64 {
    let operation = q.operation_type.as_deref().unwrap_or(DEFAULT_OPERATION);
    let mode = q.mode.as_deref().unwrap_or(DEFAULT_OPERATION_MODE);

    let operations = prices_for(rule, PriceDimension::OperationType);
    let Some(op_price) = operations.iter().find(|p| p.value == operation) else {
        return operations
            .first()
            .map(|p| p.credits_per_unit)
            .unwrap_or(rule.base_credits);
    };

    let multiplier = rule
        .prices
        .iter()
        .find(|p| p.dimension == PriceDimension::Mode && p.value == mode);
    match multiplier {
        Some(m) => op_price.credits_per_unit * m.credits_per_unit,
        None => op_price.credits_per_unit,
    }
}
