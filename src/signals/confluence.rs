//! Confluence correlation
//!
//! Keeps a sliding window of recently emitted detector signals. When two or
//! more distinct signal types agree in direction inside the window, a
//! higher-order confluence signal fires. Every tag is spent by the first
//! confluence it joins, so another emission needs fresh evidence.

use std::collections::VecDeque;

use crate::config::EngineConfig;
use crate::types::{ConfluenceEvent, Direction, SignalType, FRESH_X};

#[derive(Debug, Clone)]
struct Tag {
    signal_type: SignalType,
    direction: Direction,
    timestamp: u64,
    price: f64,
    spent: bool,
}

pub struct ConfluenceEngine {
    window_ms: u64,
    tags: VecDeque<Tag>,
}

impl ConfluenceEngine {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            window_ms: cfg.confluence_window_ms,
            tags: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.window_ms);
        while matches!(self.tags.front(), Some(tag) if tag.timestamp < cutoff) {
            self.tags.pop_front();
        }
    }

    /// Distinct unspent types agreeing with `direction`, most recent tag per
    /// type. Returns indices into `self.tags`.
    fn agreeing(&self, direction: Direction) -> Vec<usize> {
        let mut picked: Vec<usize> = Vec::new();
        for (idx, tag) in self.tags.iter().enumerate() {
            if tag.spent || tag.direction != direction {
                continue;
            }
            match picked
                .iter()
                .position(|&p| self.tags[p].signal_type == tag.signal_type)
            {
                Some(slot) => picked[slot] = idx, // keep the most recent
                None => picked.push(idx),
            }
        }
        picked
    }

    /// Observe a freshly emitted detector signal. Confluence signals
    /// themselves never feed back in.
    pub fn observe(
        &mut self,
        signal_type: SignalType,
        direction: Direction,
        price: f64,
        timestamp: u64,
    ) -> Option<ConfluenceEvent> {
        self.evict(timestamp);
        self.tags.push_back(Tag {
            signal_type,
            direction,
            timestamp,
            price,
            spent: false,
        });

        let bullish = self.agreeing(Direction::Bullish);
        let bearish = self.agreeing(Direction::Bearish);

        // Majority by distinct-type count, then by most recent tag
        let winner = match (bullish.len() >= 2, bearish.len() >= 2) {
            (false, false) => return None,
            (true, false) => (Direction::Bullish, bullish),
            (false, true) => (Direction::Bearish, bearish),
            (true, true) => {
                if bullish.len() != bearish.len() {
                    if bullish.len() > bearish.len() {
                        (Direction::Bullish, bullish)
                    } else {
                        (Direction::Bearish, bearish)
                    }
                } else {
                    let latest = |idxs: &[usize]| {
                        idxs.iter().map(|&i| self.tags[i].timestamp).max().unwrap_or(0)
                    };
                    if latest(&bullish) >= latest(&bearish) {
                        (Direction::Bullish, bullish)
                    } else {
                        (Direction::Bearish, bearish)
                    }
                }
            }
        };
        let (direction, members) = winner;

        let mut signals: Vec<String> = members
            .iter()
            .map(|&i| self.tags[i].signal_type.as_str().to_string())
            .collect();
        signals.sort();
        let score = members.len() as u32;
        let price = members
            .iter()
            .max_by_key(|&&i| self.tags[i].timestamp)
            .map(|&i| self.tags[i].price)
            .unwrap_or(price);

        for idx in members {
            self.tags[idx].spent = true;
        }

        Some(ConfluenceEvent {
            timestamp,
            price,
            direction,
            score,
            signals,
            x: FRESH_X,
        })
    }
}
