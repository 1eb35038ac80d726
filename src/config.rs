//! Engine tunables
//!
//! Every detection threshold lives here with its production default so the
//! same pipeline can be re-parameterized for backtests without code changes.

use serde::{Deserialize, Serialize};

/// Tunable thresholds for the signal pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum price increment of the instrument (NQ/ES = 0.25)
    pub tick_size: f64,

    /// |delta| / total ratio above which a bubble is a significant imbalance
    pub significant_imbalance_ratio: f64,

    /// Per-level one-sidedness ratio for stacked imbalance detection
    pub stacked_imbalance_ratio: f64,

    /// Minimum run length for a stacked imbalance
    pub stacked_min_levels: usize,

    /// |CVD| the previous value must have reached before a sign change
    /// counts as a delta flip (hysteresis against chop around zero)
    pub delta_flip_threshold: i64,

    /// Minimum single-trade size for absorption classification
    pub absorption_min_size: u32,

    /// Idle time after which an absorption accumulator is pruned
    pub absorption_idle_ms: u64,

    /// Sliding window for confluence correlation
    pub confluence_window_ms: u64,

    /// Fraction of total volume covered by the value area
    pub value_area_fraction: f64,

    /// A level is an LVN when its total volume is below this fraction of the
    /// mean level volume
    pub lvn_ratio: f64,

    /// LVN levels within this many ticks of each other merge into one zone
    pub lvn_group_ticks: i64,

    /// Outcome window in ticks: |move| >= win_ticks * tick_size decides
    /// win/loss, anything inside is breakeven
    pub outcome_win_ticks: f64,

    /// Live-mode bucket close on wall-clock inactivity
    pub bucket_inactivity_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_size: 0.25,
            significant_imbalance_ratio: 0.15,
            stacked_imbalance_ratio: 0.67,
            stacked_min_levels: 3,
            delta_flip_threshold: 300,
            absorption_min_size: 20,
            absorption_idle_ms: 5 * 60 * 1000,
            confluence_window_ms: 30_000,
            value_area_fraction: 0.70,
            lvn_ratio: 0.3,
            lvn_group_ticks: 3,
            outcome_win_ticks: 4.0,
            bucket_inactivity_ms: 1100,
        }
    }
}

impl EngineConfig {
    /// Quantize a price down to its tick level
    pub fn quantize(&self, price: f64) -> f64 {
        (price / self.tick_size).floor() * self.tick_size
    }

    /// Integer key for a quantized price level
    pub fn price_key(&self, price: f64) -> i64 {
        (price / self.tick_size).floor() as i64
    }

    /// Price for an integer level key
    pub fn key_price(&self, key: i64) -> f64 {
        key as f64 * self.tick_size
    }

    /// Outcome window in price points
    pub fn outcome_window(&self) -> f64 {
        self.outcome_win_ticks * self.tick_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_floor() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.quantize(21500.30), 21500.25);
        assert_eq!(cfg.quantize(21500.25), 21500.25);
        assert_eq!(cfg.quantize(21500.0), 21500.0);
    }

    #[test]
    fn test_key_roundtrip() {
        let cfg = EngineConfig::default();
        let key = cfg.price_key(18250.75);
        assert_eq!(cfg.key_price(key), 18250.75);
    }

    #[test]
    fn test_outcome_window() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.outcome_window(), 1.0); // 4 ticks of 0.25
    }
}
