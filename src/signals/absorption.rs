//! Absorption detection
//!
//! Large aggressive volume that fails to move price implies passive resting
//! liquidity defending the level. Qualifying trades accumulate into
//! per-level accumulators whose strength climbs a fixed ladder; every climb
//! to medium or beyond emits an event. Idle accumulators are pruned.

use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::signals::profile::KeyLevels;
use crate::types::{
    AbsorptionEvent, AbsorptionKind, AbsorptionZone, Side, Strength, Trade, FRESH_X,
};

/// Strength ladder: (event_count, total_absorbed), both required
const LADDER: [(u32, i64, Strength); 4] = [
    (8, 600, Strength::Defended),
    (5, 300, Strength::Strong),
    (3, 100, Strength::Medium),
    (1, 20, Strength::Weak),
];

fn strength_for(event_count: u32, total_absorbed: i64) -> Option<Strength> {
    LADDER
        .iter()
        .find(|(count, total, _)| event_count >= *count && total_absorbed >= *total)
        .map(|(_, _, s)| *s)
}

/// Per-level accumulator
#[derive(Debug, Clone)]
struct Accumulator {
    price: f64,
    kind: AbsorptionKind,
    total_absorbed: i64,
    event_count: u32,
    first_seen: u64,
    last_seen: u64,
    strength: Option<Strength>,
}

pub struct AbsorptionDetector {
    accumulators: HashMap<i64, Accumulator>,
    tick: f64,
    min_size: u32,
    idle_ms: u64,
}

impl AbsorptionDetector {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            accumulators: HashMap::new(),
            tick: cfg.tick_size,
            min_size: cfg.absorption_min_size,
            idle_ms: cfg.absorption_idle_ms,
        }
    }

    fn key(&self, price: f64) -> i64 {
        (price / self.tick).floor() as i64
    }

    /// Classify a trade against the price change of its bucket so far.
    /// Buying absorption: large buy that failed to lift price. Selling
    /// absorption is symmetric.
    fn classify(&self, trade: &Trade, price_change: f64) -> Option<AbsorptionKind> {
        if trade.size < self.min_size {
            return None;
        }
        match trade.side {
            Side::Buy if price_change <= 0.0 => Some(AbsorptionKind::Buying),
            Side::Sell if price_change >= 0.0 => Some(AbsorptionKind::Selling),
            _ => None,
        }
    }

    /// Feed one trade. `price_change` is the bucket-local move at the time
    /// of the trade, `key_levels`/`cvd_sign` give the context tags. Returns
    /// an event on every strength transition to medium or higher.
    pub fn on_trade(
        &mut self,
        trade: &Trade,
        price_change: f64,
        key_levels: &KeyLevels,
        cvd_sign: i8,
    ) -> Option<AbsorptionEvent> {
        let kind = self.classify(trade, price_change)?;

        let key = self.key(trade.price);
        let acc = self.accumulators.entry(key).or_insert(Accumulator {
            price: (trade.price / self.tick).floor() * self.tick,
            kind,
            total_absorbed: 0,
            event_count: 0,
            first_seen: trade.timestamp,
            last_seen: trade.timestamp,
            strength: None,
        });

        // The side doing the absorbing can rotate; the accumulator follows
        // the most recent flow at the level
        acc.kind = kind;
        acc.total_absorbed += trade.size as i64;
        acc.event_count += 1;
        acc.last_seen = trade.timestamp;

        let previous = acc.strength;
        let current = strength_for(acc.event_count, acc.total_absorbed);
        acc.strength = current;

        let climbed = match (previous, current) {
            (None, Some(s)) => Some(s),
            (Some(p), Some(s)) if s > p => Some(s),
            _ => None,
        };
        let strength = climbed.filter(|s| *s >= Strength::Medium)?;

        let against_trend = match kind {
            AbsorptionKind::Buying => cvd_sign > 0,
            AbsorptionKind::Selling => cvd_sign < 0,
        };

        Some(AbsorptionEvent {
            timestamp: trade.timestamp,
            price: acc.price,
            absorption_type: kind,
            delta: trade.signed_size(),
            price_change,
            strength,
            event_count: acc.event_count,
            total_absorbed: acc.total_absorbed,
            at_key_level: key_levels.contains(acc.price, self.tick),
            against_trend,
            x: FRESH_X,
        })
    }

    /// Drop accumulators idle for longer than the configured timeout
    pub fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.idle_ms);
        self.accumulators.retain(|_, acc| acc.last_seen >= cutoff);
    }

    /// Currently active zones, for the once-per-second snapshot
    pub fn zones(&self, key_levels: &KeyLevels, cvd_sign: i8) -> Vec<AbsorptionZone> {
        let mut zones: Vec<AbsorptionZone> = self
            .accumulators
            .values()
            .filter_map(|acc| {
                let strength = acc.strength?;
                let against_trend = match acc.kind {
                    AbsorptionKind::Buying => cvd_sign > 0,
                    AbsorptionKind::Selling => cvd_sign < 0,
                };
                Some(AbsorptionZone {
                    price: acc.price,
                    absorption_type: acc.kind,
                    total_absorbed: acc.total_absorbed,
                    event_count: acc.event_count,
                    first_seen: acc.first_seen,
                    last_seen: acc.last_seen,
                    strength,
                    at_key_level: key_levels.contains(acc.price, self.tick),
                    against_trend,
                })
            })
            .collect();
        zones.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        zones
    }

    pub fn active_count(&self) -> usize {
        self.accumulators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AbsorptionDetector {
        AbsorptionDetector::new(&EngineConfig::default())
    }

    fn buy(price: f64, size: u32, ts: u64) -> Trade {
        Trade {
            symbol: "NQ.c.0".to_string(),
            price,
            size,
            side: Side::Buy,
            timestamp: ts,
        }
    }

    fn sell(price: f64, size: u32, ts: u64) -> Trade {
        Trade {
            symbol: "NQ.c.0".to_string(),
            price,
            size,
            side: Side::Sell,
            timestamp: ts,
        }
    }

    #[test]
    fn test_ladder_requires_both_thresholds() {
        assert_eq!(strength_for(1, 20), Some(Strength::Weak));
        assert_eq!(strength_for(3, 100), Some(Strength::Medium));
        // Five events but only 299 contracts: still medium
        assert_eq!(strength_for(5, 299), Some(Strength::Medium));
        assert_eq!(strength_for(5, 300), Some(Strength::Strong));
        assert_eq!(strength_for(8, 600), Some(Strength::Defended));
        assert_eq!(strength_for(2, 599), Some(Strength::Weak));
        assert_eq!(strength_for(1, 19), None);
    }

    #[test]
    fn test_small_trades_ignored() {
        let mut d = detector();
        let none = d.on_trade(&buy(100.0, 19, 0), 0.0, &KeyLevels::default(), 0);
        assert!(none.is_none());
        assert_eq!(d.active_count(), 0);
    }

    #[test]
    fn test_buy_that_lifts_price_is_not_absorption() {
        let mut d = detector();
        let none = d.on_trade(&buy(100.0, 50, 0), 0.25, &KeyLevels::default(), 0);
        assert!(none.is_none());
    }

    #[test]
    fn test_sell_into_rising_bucket_is_absorbed() {
        let mut d = detector();
        // Sell pressure that failed to push price down
        assert!(d
            .on_trade(&sell(100.0, 50, 0), 0.25, &KeyLevels::default(), 0)
            .is_none()); // weak, silent
        assert_eq!(d.active_count(), 1);
    }

    /// Eight size-100 buys with no lift: weak -> medium@3 -> strong@5 ->
    /// defended@8, with exactly three emissions.
    #[test]
    fn test_progression_emits_medium_strong_defended() {
        let mut d = detector();
        let mut emitted = Vec::new();
        for i in 0..8u64 {
            if let Some(ev) = d.on_trade(
                &buy(100.0, 100, i * 1000),
                0.0,
                &KeyLevels::default(),
                0,
            ) {
                emitted.push((ev.event_count, ev.strength));
            }
        }
        assert_eq!(
            emitted,
            vec![
                (3, Strength::Medium),
                (5, Strength::Strong),
                (8, Strength::Defended)
            ]
        );
    }

    #[test]
    fn test_context_tags() {
        let mut d = detector();
        let key_levels = KeyLevels {
            poc: Some(100.0),
            vah: None,
            val: None,
        };
        // Build up to medium with CVD positive: buying absorbed against trend
        d.on_trade(&buy(100.0, 60, 0), 0.0, &key_levels, 1);
        d.on_trade(&buy(100.0, 60, 1), 0.0, &key_levels, 1);
        let ev = d
            .on_trade(&buy(100.0, 60, 2), 0.0, &key_levels, 1)
            .expect("medium transition");
        assert!(ev.at_key_level);
        assert!(ev.against_trend);
        assert_eq!(ev.absorption_type, AbsorptionKind::Buying);
    }

    #[test]
    fn test_prune_after_idle() {
        let mut d = detector();
        d.on_trade(&buy(100.0, 50, 0), 0.0, &KeyLevels::default(), 0);
        d.prune(5 * 60 * 1000); // exactly at the cutoff: retained
        assert_eq!(d.active_count(), 1);
        d.prune(5 * 60 * 1000 + 1);
        assert_eq!(d.active_count(), 0);
    }

    #[test]
    fn test_zone_snapshot() {
        let mut d = detector();
        d.on_trade(&buy(100.0, 50, 10), 0.0, &KeyLevels::default(), 0);
        d.on_trade(&sell(101.0, 30, 20), 0.0, &KeyLevels::default(), -1);
        let zones = d.zones(&KeyLevels::default(), -1);
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].price, 100.0);
        assert_eq!(zones[0].strength, Strength::Weak);
        assert_eq!(zones[1].absorption_type, AbsorptionKind::Selling);
        assert!(zones[1].against_trend);
    }
}
