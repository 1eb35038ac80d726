//! Session lifecycle and running statistics
//!
//! One session wraps each pipeline run. The manager owns the running
//! aggregates (high, low, volume, per-type signal counters) and broadcasts
//! a SessionStats snapshot every second. On shutdown it writes the closing
//! session row through the store.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::hub::Hub;
use crate::store::{SessionRow, Store, StoreJob};
use crate::types::{
    Direction, Mode, Outcome, SessionStatsEvent, SignalType, SignalTypeStats, WsMessage,
};

/// Facts the rest of the pipeline reports into the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Aggregate {
        high: f64,
        low: f64,
        volume: u32,
    },
    SignalEmitted {
        signal_type: SignalType,
        direction: Direction,
    },
    OutcomeResolved {
        signal_type: SignalType,
        outcome: Outcome,
        move_1m: f64,
        move_5m: f64,
    },
}

#[derive(Debug, Default, Clone)]
struct TypeCounters {
    count: u32,
    bullish: u32,
    bearish: u32,
    wins: u32,
    losses: u32,
    resolved: u32,
    sum_move_1m: f64,
    sum_move_5m: f64,
}

impl TypeCounters {
    fn stats(&self) -> SignalTypeStats {
        let graded = self.wins + self.losses;
        SignalTypeStats {
            count: self.count,
            bullish: self.bullish,
            bearish: self.bearish,
            wins: self.wins,
            losses: self.losses,
            avg_move_1m: if self.resolved > 0 {
                self.sum_move_1m / self.resolved as f64
            } else {
                0.0
            },
            avg_move_5m: if self.resolved > 0 {
                self.sum_move_5m / self.resolved as f64
            } else {
                0.0
            },
            win_rate: if graded > 0 {
                self.wins as f64 / graded as f64
            } else {
                0.0
            },
        }
    }
}

pub struct SessionManager {
    id: Uuid,
    started_at: String,
    mode: Mode,
    symbols: Vec<String>,
    session_high: f64,
    session_low: f64,
    total_volume: u64,
    counters: HashMap<SignalType, TypeCounters>,
}

impl SessionManager {
    pub fn new(mode: Mode, symbols: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: chrono::Utc::now().to_rfc3339(),
            mode,
            symbols,
            session_high: f64::MIN,
            session_low: f64::MAX,
            total_volume: 0,
            counters: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Opening row for the store
    pub fn open_row(&self) -> SessionRow {
        SessionRow {
            id: self.id,
            started_at: self.started_at.clone(),
            ended_at: None,
            mode: self.mode,
            symbols: self.symbols.join(","),
            session_high: None,
            session_low: None,
            total_volume: 0,
        }
    }

    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Aggregate { high, low, volume } => {
                self.session_high = self.session_high.max(high);
                self.session_low = self.session_low.min(low);
                self.total_volume += volume as u64;
            }
            SessionEvent::SignalEmitted {
                signal_type,
                direction,
            } => {
                let c = self.counters.entry(signal_type).or_default();
                c.count += 1;
                match direction {
                    Direction::Bullish => c.bullish += 1,
                    Direction::Bearish => c.bearish += 1,
                }
            }
            SessionEvent::OutcomeResolved {
                signal_type,
                outcome,
                move_1m,
                move_5m,
            } => {
                let c = self.counters.entry(signal_type).or_default();
                c.resolved += 1;
                c.sum_move_1m += move_1m;
                c.sum_move_5m += move_5m;
                match outcome {
                    Outcome::Win => c.wins += 1,
                    Outcome::Loss => c.losses += 1,
                    Outcome::Breakeven | Outcome::Pending => {}
                }
            }
        }
    }

    fn type_stats(&self, signal_type: SignalType) -> SignalTypeStats {
        self.counters
            .get(&signal_type)
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    pub fn stats_event(&self, now_ms: u64) -> SessionStatsEvent {
        SessionStatsEvent {
            session_id: self.id,
            timestamp: now_ms,
            session_high: if self.total_volume > 0 {
                self.session_high
            } else {
                0.0
            },
            session_low: if self.total_volume > 0 {
                self.session_low
            } else {
                0.0
            },
            total_volume: self.total_volume,
            delta_flip: self.type_stats(SignalType::DeltaFlip),
            absorption: self.type_stats(SignalType::Absorption),
            stacked_imbalance: self.type_stats(SignalType::StackedImbalance),
            confluence: self.type_stats(SignalType::Confluence),
        }
    }

    /// Closing update for the store
    pub fn close_job(&self) -> StoreJob {
        StoreJob::CloseSession {
            id: self.id,
            ended_at: chrono::Utc::now().to_rfc3339(),
            session_high: if self.total_volume > 0 {
                self.session_high
            } else {
                0.0
            },
            session_low: if self.total_volume > 0 {
                self.session_low
            } else {
                0.0
            },
            total_volume: self.total_volume,
        }
    }
}

/// Session task: applies reported events, broadcasts stats every second,
/// and closes the session row when every reporter is gone.
pub async fn run_session_manager(
    mut manager: SessionManager,
    mut rx: mpsc::Receiver<SessionEvent>,
    hub: Hub,
    store: Store,
    clock: Clock,
) {
    info!(
        "Session {} opened ({}, symbols: {})",
        manager.id(),
        manager.mode.as_str(),
        manager.symbols.join(",")
    );
    store.enqueue(StoreJob::OpenSession(manager.open_row()));

    let mut next_tick = clock.now_ms() + 1000;
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => manager.apply(event),
                    None => break,
                }
            }
            _ = clock.sleep_until(next_tick) => {
                hub.send(WsMessage::SessionStats(manager.stats_event(clock.now_ms())));
                next_tick = clock.now_ms() + 1000;
            }
        }
    }

    store.enqueue(manager.close_job());
    info!(
        "Session {} closed (volume {}, high {:.2}, low {:.2})",
        manager.id(),
        manager.total_volume,
        manager.session_high,
        manager.session_low
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_aggregates() {
        let mut m = SessionManager::new(Mode::Demo, vec!["NQ.c.0".to_string()]);
        m.apply(SessionEvent::Aggregate {
            high: 101.0,
            low: 100.0,
            volume: 30,
        });
        m.apply(SessionEvent::Aggregate {
            high: 103.0,
            low: 99.5,
            volume: 20,
        });
        let stats = m.stats_event(0);
        assert_eq!(stats.session_high, 103.0);
        assert_eq!(stats.session_low, 99.5);
        assert_eq!(stats.total_volume, 50);
    }

    #[test]
    fn test_empty_session_reports_zeroes() {
        let m = SessionManager::new(Mode::Demo, vec![]);
        let stats = m.stats_event(0);
        assert_eq!(stats.session_high, 0.0);
        assert_eq!(stats.session_low, 0.0);
        assert_eq!(stats.total_volume, 0);
    }

    #[test]
    fn test_signal_counters() {
        let mut m = SessionManager::new(Mode::Live, vec!["NQ.c.0".to_string()]);
        m.apply(SessionEvent::SignalEmitted {
            signal_type: SignalType::DeltaFlip,
            direction: Direction::Bullish,
        });
        m.apply(SessionEvent::SignalEmitted {
            signal_type: SignalType::DeltaFlip,
            direction: Direction::Bearish,
        });
        m.apply(SessionEvent::OutcomeResolved {
            signal_type: SignalType::DeltaFlip,
            outcome: Outcome::Win,
            move_1m: 0.5,
            move_5m: 1.5,
        });
        m.apply(SessionEvent::OutcomeResolved {
            signal_type: SignalType::DeltaFlip,
            outcome: Outcome::Breakeven,
            move_1m: 0.25,
            move_5m: -0.25,
        });

        let stats = m.stats_event(0).delta_flip;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.bullish, 1);
        assert_eq!(stats.bearish, 1);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 0);
        assert_eq!(stats.win_rate, 1.0);
        assert_eq!(stats.avg_move_1m, 0.375);
        assert_eq!(stats.avg_move_5m, 0.625);
    }

    #[test]
    fn test_untouched_types_default() {
        let m = SessionManager::new(Mode::Replay, vec![]);
        let stats = m.stats_event(0);
        assert_eq!(stats.confluence.count, 0);
        assert_eq!(stats.absorption.win_rate, 0.0);
    }
}
