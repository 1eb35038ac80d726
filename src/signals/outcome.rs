//! Outcome tracking
//!
//! Every emitted signal gets two deferred price marks, one and five minutes
//! out, read through the clock indirection so replay grades identically to
//! live. Once both marks fill, the move against the emit price decides
//! win/loss/breakeven. Signals still pending at shutdown stay pending, and
//! that is terminal.

use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::session::SessionEvent;
use crate::store::{Store, StoreJob};
use crate::types::{Direction, Outcome, SignalType};

const MARK_1M_MS: u64 = 60_000;
const MARK_5M_MS: u64 = 300_000;

/// A signal the pipeline wants graded
#[derive(Debug, Clone)]
pub struct OutcomeRequest {
    pub signal_id: Uuid,
    pub symbol: String,
    pub signal_type: SignalType,
    pub direction: Direction,
    pub price_at_emit: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
struct PendingOutcome {
    req: OutcomeRequest,
    price_1m: Option<f64>,
}

impl PendingOutcome {
    fn due_1m(&self) -> u64 {
        self.req.timestamp + MARK_1M_MS
    }

    fn due_5m(&self) -> u64 {
        self.req.timestamp + MARK_5M_MS
    }

    fn next_due(&self) -> u64 {
        if self.price_1m.is_none() {
            self.due_1m()
        } else {
            self.due_5m()
        }
    }
}

/// What `poll` decided for a signal
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeUpdate {
    Mark1m {
        signal_id: Uuid,
        price: f64,
    },
    Resolved {
        signal_id: Uuid,
        signal_type: SignalType,
        direction: Direction,
        price_1m: f64,
        price_5m: f64,
        outcome: Outcome,
        move_1m: f64,
        move_5m: f64,
    },
}

pub struct OutcomeTracker {
    pending: Vec<PendingOutcome>,
    /// Win/loss band in price points (outcome_win_ticks * tick_size)
    window: f64,
}

impl OutcomeTracker {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            pending: Vec::new(),
            window: cfg.outcome_window(),
        }
    }

    pub fn schedule(&mut self, req: OutcomeRequest) {
        self.pending.push(PendingOutcome { req, price_1m: None });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Earliest unfilled mark across all pending signals
    pub fn next_due(&self) -> Option<u64> {
        self.pending.iter().map(|p| p.next_due()).min()
    }

    /// Directional move of `price` against the emit price
    fn directional_move(direction: Direction, at_emit: f64, price: f64) -> f64 {
        match direction {
            Direction::Bullish => price - at_emit,
            Direction::Bearish => at_emit - price,
        }
    }

    /// Fill every mark whose time has come, using the last observed trade
    /// price per symbol. Signals whose symbol has no observed price yet stay
    /// queued for the next poll.
    pub fn poll(&mut self, now_ms: u64, last_prices: &HashMap<String, f64>) -> Vec<OutcomeUpdate> {
        let mut updates = Vec::new();
        let window = self.window;
        let mut kept = Vec::with_capacity(self.pending.len());

        for mut p in self.pending.drain(..) {
            let Some(&price) = last_prices.get(&p.req.symbol) else {
                kept.push(p);
                continue;
            };

            if p.price_1m.is_none() && now_ms >= p.due_1m() {
                p.price_1m = Some(price);
                updates.push(OutcomeUpdate::Mark1m {
                    signal_id: p.req.signal_id,
                    price,
                });
            }

            if p.price_1m.is_some() && now_ms >= p.due_5m() {
                let price_1m = p.price_1m.unwrap();
                let move_1m =
                    Self::directional_move(p.req.direction, p.req.price_at_emit, price_1m);
                let move_5m = Self::directional_move(p.req.direction, p.req.price_at_emit, price);
                let outcome = if move_5m >= window {
                    Outcome::Win
                } else if move_5m <= -window {
                    Outcome::Loss
                } else {
                    Outcome::Breakeven
                };
                updates.push(OutcomeUpdate::Resolved {
                    signal_id: p.req.signal_id,
                    signal_type: p.req.signal_type,
                    direction: p.req.direction,
                    price_1m,
                    price_5m: price,
                    outcome,
                    move_1m,
                    move_5m,
                });
            } else {
                kept.push(p);
            }
        }

        self.pending = kept;
        updates
    }
}

/// Scheduler task: wakes at the next due mark, fills prices from the
/// per-symbol snapshots, and forwards results to the store and the session
/// manager. Dropping the request channel ends the task; anything still
/// pending remains pending in the store.
pub async fn run_outcome_tracker(
    clock: Clock,
    cfg: EngineConfig,
    mut rx: mpsc::Receiver<OutcomeRequest>,
    price_rx: HashMap<String, watch::Receiver<f64>>,
    store: Store,
    session_tx: mpsc::Sender<SessionEvent>,
) {
    let mut tracker = OutcomeTracker::new(&cfg);
    info!("Outcome tracker started ({} symbols)", price_rx.len());

    let snapshot_prices = |price_rx: &HashMap<String, watch::Receiver<f64>>| {
        price_rx
            .iter()
            .map(|(sym, rx)| (sym.clone(), *rx.borrow()))
            .filter(|(_, p)| *p > 0.0)
            .collect::<HashMap<String, f64>>()
    };

    loop {
        let due = tracker.next_due();
        tokio::select! {
            req = rx.recv() => {
                match req {
                    Some(req) => {
                        debug!(
                            "Scheduling outcome marks for {} signal {}",
                            req.signal_type, req.signal_id
                        );
                        tracker.schedule(req);
                    }
                    None => break,
                }
            }
            _ = clock.sleep_until(due.unwrap_or(u64::MAX)), if due.is_some() => {
                let prices = snapshot_prices(&price_rx);
                for update in tracker.poll(clock.now_ms(), &prices) {
                    apply_update(update, &store, &session_tx).await;
                }
            }
        }
    }

    // Session is ending: grade everything already due, then cancel the
    // rest; their signals stay pending in the store and that is terminal
    let prices = snapshot_prices(&price_rx);
    for update in tracker.poll(clock.now_ms(), &prices) {
        apply_update(update, &store, &session_tx).await;
    }

    info!(
        "Outcome tracker stopped, {} signals remain pending",
        tracker.pending_count()
    );
}

async fn apply_update(update: OutcomeUpdate, store: &Store, session_tx: &mpsc::Sender<SessionEvent>) {
    match update {
        OutcomeUpdate::Mark1m { signal_id, price } => {
            store.enqueue(StoreJob::MarkSignal1m {
                id: signal_id,
                price_after_1m: price,
            });
        }
        OutcomeUpdate::Resolved {
            signal_id,
            signal_type,
            direction,
            price_1m,
            price_5m,
            outcome,
            move_1m,
            move_5m,
        } => {
            info!(
                "Signal {} resolved: {} {} -> {:?} (1m {:+.2}, 5m {:+.2})",
                signal_id, signal_type, direction, outcome, move_1m, move_5m
            );
            store.enqueue(StoreJob::ResolveSignal {
                id: signal_id,
                price_after_1m: price_1m,
                price_after_5m: price_5m,
                outcome,
            });
            let _ = session_tx
                .send(SessionEvent::OutcomeResolved {
                    signal_type,
                    outcome,
                    move_1m,
                    move_5m,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: u128, direction: Direction, price: f64, ts: u64) -> OutcomeRequest {
        OutcomeRequest {
            signal_id: Uuid::from_u128(id),
            symbol: "NQ.c.0".to_string(),
            signal_type: SignalType::DeltaFlip,
            direction,
            price_at_emit: price,
            timestamp: ts,
        }
    }

    fn prices(p: f64) -> HashMap<String, f64> {
        HashMap::from([("NQ.c.0".to_string(), p)])
    }

    #[test]
    fn test_marks_fill_in_order() {
        let mut t = OutcomeTracker::new(&EngineConfig::default());
        t.schedule(req(1, Direction::Bullish, 100.0, 0));
        assert_eq!(t.next_due(), Some(60_000));

        assert!(t.poll(59_999, &prices(101.0)).is_empty());

        let updates = t.poll(60_000, &prices(101.0));
        assert_eq!(
            updates,
            vec![OutcomeUpdate::Mark1m {
                signal_id: Uuid::from_u128(1),
                price: 101.0
            }]
        );
        assert_eq!(t.next_due(), Some(300_000));
    }

    /// Flip at price 100, 101 after 1m, 102 after 5m, W = 4 ticks of 0.25:
    /// move = +2 >= 1.0, outcome = win.
    #[test]
    fn test_bullish_win() {
        let mut t = OutcomeTracker::new(&EngineConfig::default());
        t.schedule(req(1, Direction::Bullish, 100.0, 0));
        t.poll(60_000, &prices(101.0));
        let updates = t.poll(300_000, &prices(102.0));
        match &updates[0] {
            OutcomeUpdate::Resolved {
                outcome,
                move_1m,
                move_5m,
                price_1m,
                price_5m,
                ..
            } => {
                assert_eq!(*outcome, Outcome::Win);
                assert_eq!(*price_1m, 101.0);
                assert_eq!(*price_5m, 102.0);
                assert_eq!(*move_1m, 1.0);
                assert_eq!(*move_5m, 2.0);
            }
            other => panic!("unexpected update: {:?}", other),
        }
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_bearish_rally_is_a_loss() {
        let mut t = OutcomeTracker::new(&EngineConfig::default());
        t.schedule(req(1, Direction::Bearish, 100.0, 0));
        t.schedule(req(2, Direction::Bearish, 100.0, 0));
        t.poll(60_000, &prices(100.0));

        // Price rallies 2 points against a bearish signal: loss
        let updates = t.poll(300_000, &prices(102.0));
        let outcomes: Vec<Outcome> = updates
            .iter()
            .filter_map(|u| match u {
                OutcomeUpdate::Resolved { outcome, .. } => Some(*outcome),
                _ => None,
            })
            .collect();
        assert_eq!(outcomes, vec![Outcome::Loss, Outcome::Loss]);
    }

    #[test]
    fn test_breakeven_inside_window() {
        let mut t = OutcomeTracker::new(&EngineConfig::default());
        t.schedule(req(1, Direction::Bullish, 100.0, 0));
        t.poll(60_000, &prices(100.25));
        let updates = t.poll(300_000, &prices(100.75)); // +0.75 < 1.0
        match &updates[0] {
            OutcomeUpdate::Resolved { outcome, .. } => assert_eq!(*outcome, Outcome::Breakeven),
            other => panic!("unexpected update: {:?}", other),
        }
    }

    /// A late poll fills both marks at once with the same observed price
    #[test]
    fn test_both_marks_in_one_poll() {
        let mut t = OutcomeTracker::new(&EngineConfig::default());
        t.schedule(req(1, Direction::Bullish, 100.0, 0));
        let updates = t.poll(400_000, &prices(103.0));
        assert_eq!(updates.len(), 2);
        assert!(matches!(updates[0], OutcomeUpdate::Mark1m { .. }));
        assert!(matches!(
            updates[1],
            OutcomeUpdate::Resolved {
                outcome: Outcome::Win,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_symbol_stays_pending() {
        let mut t = OutcomeTracker::new(&EngineConfig::default());
        t.schedule(req(1, Direction::Bullish, 100.0, 0));
        let updates = t.poll(400_000, &HashMap::new());
        assert!(updates.is_empty());
        assert_eq!(t.pending_count(), 1);
    }
}
