//! Volume profile
//!
//! Price -> (buy, sell, total) histogram at tick granularity, with the
//! derived structure the detectors need: POC, value area, and low-volume
//! nodes grouped into zones.

use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::types::{LvnZone, Side, VolumeProfileLevel};

/// Derived key levels of the current profile
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeyLevels {
    pub poc: Option<f64>,
    pub vah: Option<f64>,
    pub val: Option<f64>,
}

impl KeyLevels {
    /// Whether a price sits on POC, VAH or VAL within the given tolerance
    pub fn contains(&self, price: f64, tolerance: f64) -> bool {
        [self.poc, self.vah, self.val]
            .iter()
            .flatten()
            .any(|level| (price - level).abs() <= tolerance + 1e-9)
    }
}

pub struct VolumeProfile {
    levels: HashMap<i64, VolumeProfileLevel>,
    tick: f64,
    value_area_fraction: f64,
    lvn_ratio: f64,
    lvn_group_ticks: i64,
    last_price: f64,
}

impl VolumeProfile {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            levels: HashMap::new(),
            tick: cfg.tick_size,
            value_area_fraction: cfg.value_area_fraction,
            lvn_ratio: cfg.lvn_ratio,
            lvn_group_ticks: cfg.lvn_group_ticks,
            last_price: 0.0,
        }
    }

    fn key(&self, price: f64) -> i64 {
        (price / self.tick).floor() as i64
    }

    fn price(&self, key: i64) -> f64 {
        key as f64 * self.tick
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, price: f64) -> Option<&VolumeProfileLevel> {
        self.levels.get(&self.key(price))
    }

    /// Record one trade into its quantized level
    pub fn record(&mut self, price: f64, size: u32, side: Side) {
        self.last_price = price;
        let key = self.key(price);
        let quantized = self.price(key);
        let level = self.levels.entry(key).or_insert(VolumeProfileLevel {
            price: quantized,
            buy_volume: 0,
            sell_volume: 0,
            total_volume: 0,
        });
        match side {
            Side::Buy => level.buy_volume += size,
            Side::Sell => level.sell_volume += size,
        }
        level.total_volume += size;
    }

    /// Level keys ascending by price
    fn sorted_keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.levels.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Levels ascending by price (the ladder the imbalance scan walks)
    pub fn ladder(&self) -> Vec<VolumeProfileLevel> {
        self.sorted_keys()
            .into_iter()
            .map(|k| self.levels[&k].clone())
            .collect()
    }

    /// Point of control: highest total volume, ties broken by proximity to
    /// the most recent traded price, then by price so the choice never
    /// depends on map iteration order.
    pub fn poc(&self) -> Option<f64> {
        self.levels
            .values()
            .max_by(|a, b| {
                a.total_volume
                    .cmp(&b.total_volume)
                    .then_with(|| {
                        let da = (a.price - self.last_price).abs();
                        let db = (b.price - self.last_price).abs();
                        db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| {
                        a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
            .map(|l| l.price)
    }

    /// Value area: expand greedily from POC, taking whichever existing
    /// neighbor level carries more volume, until coverage reaches the
    /// configured fraction of total volume.
    pub fn value_area(&self) -> Option<(f64, f64)> {
        if self.levels.is_empty() {
            return None;
        }

        let keys = self.sorted_keys();
        let poc = self.poc()?;
        let poc_idx = keys.iter().position(|&k| self.price(k) == poc)?;

        let total: u64 = self.levels.values().map(|l| l.total_volume as u64).sum();
        let target = (total as f64 * self.value_area_fraction).ceil() as u64;

        let mut lo = poc_idx;
        let mut hi = poc_idx;
        let mut covered = self.levels[&keys[poc_idx]].total_volume as u64;

        while covered < target {
            let above = (hi + 1 < keys.len()).then(|| self.levels[&keys[hi + 1]].total_volume);
            let below = (lo > 0).then(|| self.levels[&keys[lo - 1]].total_volume);

            match (above, below) {
                (None, None) => break,
                (Some(a), Some(b)) if b > a => {
                    lo -= 1;
                    covered += b as u64;
                }
                (Some(a), _) => {
                    hi += 1;
                    covered += a as u64;
                }
                (None, Some(b)) => {
                    lo -= 1;
                    covered += b as u64;
                }
            }
        }

        Some((self.price(keys[hi]), self.price(keys[lo])))
    }

    pub fn key_levels(&self) -> KeyLevels {
        let va = self.value_area();
        KeyLevels {
            poc: self.poc(),
            vah: va.map(|(h, _)| h),
            val: va.map(|(_, l)| l),
        }
    }

    /// Low-volume nodes: levels with 0 < total < lvn_ratio * mean, grouped
    /// into zones when within `lvn_group_ticks` ticks of each other. Each
    /// zone is reported at the mean price of its members.
    pub fn lvn_zones(&self) -> Vec<LvnZone> {
        if self.levels.is_empty() {
            return Vec::new();
        }

        let mean = self.levels.values().map(|l| l.total_volume as f64).sum::<f64>()
            / self.levels.len() as f64;
        let cutoff = self.lvn_ratio * mean;

        let mut lvn_keys: Vec<i64> = self
            .levels
            .iter()
            .filter(|(_, l)| l.total_volume > 0 && (l.total_volume as f64) < cutoff)
            .map(|(k, _)| *k)
            .collect();
        lvn_keys.sort_unstable();

        let mut zones = Vec::new();
        let mut group: Vec<i64> = Vec::new();

        for key in lvn_keys {
            if let Some(&last) = group.last() {
                if key - last > self.lvn_group_ticks {
                    zones.push(self.zone_from(&group));
                    group.clear();
                }
            }
            group.push(key);
        }
        if !group.is_empty() {
            zones.push(self.zone_from(&group));
        }

        zones
    }

    fn zone_from(&self, keys: &[i64]) -> LvnZone {
        let mean_price =
            keys.iter().map(|&k| self.price(k)).sum::<f64>() / keys.len() as f64;
        let total: u32 = keys.iter().map(|&k| self.levels[&k].total_volume).sum();
        LvnZone {
            price: mean_price,
            level_count: keys.len() as u32,
            total_volume: total,
        }
    }

    /// Full snapshot for broadcast: ladder plus derived levels
    pub fn snapshot(&self) -> (Vec<VolumeProfileLevel>, KeyLevels, Vec<LvnZone>) {
        (self.ladder(), self.key_levels(), self.lvn_zones())
    }
}
