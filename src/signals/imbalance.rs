//! Stacked imbalance detection
//!
//! Scans the profile ladder for maximal runs of tick-adjacent levels that
//! are one-sided beyond the configured ratio. A run emits when it reaches
//! the minimum length and again each time it grows; it re-arms once broken.

use crate::config::EngineConfig;
use crate::signals::profile::VolumeProfile;
use crate::types::{Direction, Side, StackedImbalanceEvent, FRESH_X};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Run {
    side: Side,
    low_key: i64,
    high_key: i64,
    total_imbalance: i64,
}

impl Run {
    fn len(&self) -> usize {
        (self.high_key - self.low_key) as usize + 1
    }

    fn overlaps(&self, other: &Run) -> bool {
        self.side == other.side
            && self.low_key <= other.high_key
            && other.low_key <= self.high_key
    }
}

pub struct StackedImbalanceDetector {
    ratio: f64,
    min_levels: usize,
    tick: f64,
    /// Runs already reported, with the length they were last reported at
    reported: Vec<(Run, usize)>,
}

impl StackedImbalanceDetector {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            ratio: cfg.stacked_imbalance_ratio,
            min_levels: cfg.stacked_min_levels,
            tick: cfg.tick_size,
            reported: Vec::new(),
        }
    }

    /// One-sidedness of a level, if it clears the ratio
    fn level_side(&self, buy: u32, sell: u32) -> Option<(Side, i64)> {
        let imbalance = (buy as i64 - sell as i64).abs();
        let total = (buy + sell).max(1) as f64;
        if imbalance as f64 / total >= self.ratio {
            let side = if buy >= sell { Side::Buy } else { Side::Sell };
            Some((side, imbalance))
        } else {
            None
        }
    }

    /// Collect maximal runs of same-side imbalanced levels on adjacent ticks
    fn scan_runs(&self, profile: &VolumeProfile) -> Vec<Run> {
        let ladder = profile.ladder();
        let mut runs = Vec::new();
        let mut current: Option<Run> = None;

        for level in &ladder {
            let key = (level.price / self.tick).floor() as i64;
            let hit = self.level_side(level.buy_volume, level.sell_volume);

            current = match (current.take(), hit) {
                (Some(run), Some((side, imbalance)))
                    if side == run.side && key == run.high_key + 1 =>
                {
                    Some(Run {
                        high_key: key,
                        total_imbalance: run.total_imbalance + imbalance,
                        ..run
                    })
                }
                (prev, hit) => {
                    if let Some(run) = prev {
                        if run.len() >= self.min_levels {
                            runs.push(run);
                        }
                    }
                    hit.map(|(side, imbalance)| Run {
                        side,
                        low_key: key,
                        high_key: key,
                        total_imbalance: imbalance,
                    })
                }
            };
        }
        if let Some(run) = current {
            if run.len() >= self.min_levels {
                runs.push(run);
            }
        }
        runs
    }

    /// Scan after a closed bucket. Emits events for runs newly reaching the
    /// minimum length and for reported runs that grew.
    pub fn scan(&mut self, profile: &VolumeProfile, timestamp: u64) -> Vec<StackedImbalanceEvent> {
        let runs = self.scan_runs(profile);
        let mut events = Vec::new();
        let mut next_reported = Vec::new();

        for run in &runs {
            let prior_len = self
                .reported
                .iter()
                .find(|(r, _)| r.overlaps(run))
                .map(|(_, len)| *len);

            let report_len = match prior_len {
                None => Some(run.len()),
                Some(prev) if run.len() > prev => Some(run.len()),
                Some(prev) => {
                    next_reported.push((*run, prev));
                    None
                }
            };

            if let Some(len) = report_len {
                events.push(StackedImbalanceEvent {
                    timestamp,
                    side: run.side,
                    direction: match run.side {
                        Side::Buy => Direction::Bullish,
                        Side::Sell => Direction::Bearish,
                    },
                    level_count: len as u32,
                    price_high: run.high_key as f64 * self.tick,
                    price_low: run.low_key as f64 * self.tick,
                    total_imbalance: run.total_imbalance,
                    x: FRESH_X,
                });
                next_reported.push((*run, len));
            }
        }

        // Runs that vanished from the ladder re-arm by falling out of the list
        self.reported = next_reported;
        events
    }
}
