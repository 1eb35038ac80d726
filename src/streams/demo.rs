//! Demo mode: pseudo-random walk trade generator
//!
//! Produces an NQ-like tape without a market data subscription: price walks
//! inside [20000, 20300], trades arrive every 10-50 ms, sizes follow the
//! small/medium/block mix seen on the real tape, buys are slightly favored.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::info;

use crate::types::{Side, Trade};

const PRICE_FLOOR: f64 = 20000.0;
const PRICE_CEIL: f64 = 20300.0;
const TICK: f64 = 0.25;
const BUY_PROBABILITY: f64 = 0.52;

fn roll_size(rng: &mut StdRng) -> u32 {
    let roll: f64 = rng.gen();
    if roll < 0.85 {
        rng.gen_range(1..=5)
    } else if roll < 0.98 {
        rng.gen_range(5..=50)
    } else {
        rng.gen_range(50..=150)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate trades until the pipeline side hangs up
pub async fn run(symbol: String, tx: mpsc::Sender<Trade>) {
    let mut rng = StdRng::from_entropy();
    let mut price = (PRICE_FLOOR + PRICE_CEIL) / 2.0;

    info!("Demo generator started for {}", symbol);

    loop {
        tokio::time::sleep(Duration::from_millis(rng.gen_range(10..=50))).await;

        let side = if rng.gen_bool(BUY_PROBABILITY) {
            Side::Buy
        } else {
            Side::Sell
        };

        // Aggression nudges price in its own direction more often than not
        let drift = match side {
            Side::Buy => rng.gen_range(-1i32..=2),
            Side::Sell => rng.gen_range(-2i32..=1),
        };
        price = (price + drift as f64 * TICK).clamp(PRICE_FLOOR, PRICE_CEIL);

        let trade = Trade {
            symbol: symbol.clone(),
            price,
            size: roll_size(&mut rng),
            side,
            timestamp: now_ms(),
        };

        if tx.send(trade).await.is_err() {
            info!("Demo generator stopped");
            return;
        }
    }
}
