//! Live mode: stream real-time trades from Databento
//!
//! Wraps the vendor client behind the normalized trade contract. Transient
//! failures reconnect with capped exponential backoff and jitter; only
//! authentication errors are fatal and tear the pipeline down (exit code 2).

use anyhow::{Context, Result};
use databento::{
    dbn::{Record, SType, Schema, TradeMsg},
    live::Subscription,
    LiveClient,
};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::hub::Hub;
use crate::types::{Mode, Side, Trade, WsMessage};

/// Trades dropped because the vendor record could not be normalized
pub static MALFORMED_TRADES: AtomicU64 = AtomicU64::new(0);

const BACKOFF_BASE_S: u64 = 1;
const BACKOFF_CAP_S: u64 = 30;
const JITTER_MS: i64 = 1000;

/// Reconnect loop. Returns Ok(()) when the pipeline side hangs up, Err only
/// on an unrecoverable auth error.
pub async fn run(
    api_key: String,
    symbols: Vec<String>,
    tx: mpsc::Sender<Trade>,
    hub: Hub,
) -> Result<()> {
    let mut backoff_s = BACKOFF_BASE_S;

    loop {
        match stream_once(&api_key, &symbols, &tx, &hub).await {
            Ok(()) => {
                if tx.is_closed() {
                    return Ok(());
                }
                warn!("Databento stream ended, reconnecting");
                backoff_s = BACKOFF_BASE_S;
            }
            Err(e) if is_auth_error(&e) => {
                hub.send(WsMessage::Error {
                    message: "Market data authentication failed".to_string(),
                });
                return Err(e.context("Fatal Databento auth error"));
            }
            Err(e) => {
                warn!("Databento stream error: {:?}", e);
                hub.send(WsMessage::Error {
                    message: format!("Market data stream error: {}", e),
                });
            }
        }

        let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
        let wait_ms = (backoff_s as i64 * 1000 + jitter).max(0) as u64;
        info!("Reconnecting to Databento in {} ms", wait_ms);
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        backoff_s = (backoff_s * 2).min(BACKOFF_CAP_S);
    }
}

async fn stream_once(
    api_key: &str,
    symbols: &[String],
    tx: &mpsc::Sender<Trade>,
    hub: &Hub,
) -> Result<()> {
    info!("Connecting to Databento...");

    let mut client = LiveClient::builder()
        .key(api_key)?
        .dataset("GLBX.MDP3")
        .build()
        .await
        .context("Failed to connect to Databento")?;

    info!("Connected to Databento");

    let subscription = Subscription::builder()
        .symbols(symbols.to_vec())
        .schema(Schema::Trades)
        .stype_in(SType::RawSymbol)
        .build();

    client
        .subscribe(subscription)
        .await
        .context("Failed to subscribe")?;

    info!("Subscribed to: {:?}", symbols);

    hub.send(WsMessage::Connected {
        symbols: symbols.to_vec(),
        mode: Mode::Live,
    });

    client.start().await.context("Failed to start stream")?;

    while let Some(record) = client.next_record().await? {
        if let Some(msg) = record.get::<TradeMsg>() {
            let Some(trade) = normalize(msg, &record, symbols) else {
                MALFORMED_TRADES.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if tx.send(trade).await.is_err() {
                // Pipeline is shutting down
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Convert a vendor trade record to the normalized form.
/// 'A' = ask side hit (buyer aggressor), 'B' = bid side hit (seller
/// aggressor); anything else is malformed and dropped.
fn normalize(msg: &TradeMsg, record: &dyn Record, symbols: &[String]) -> Option<Trade> {
    let side = match msg.side as u8 {
        b'A' | b'a' => Side::Buy,
        b'B' | b'b' => Side::Sell,
        _ => return None,
    };

    let price = msg.price as f64 / 1_000_000_000.0; // fixed-point conversion
    if !price.is_finite() || price <= 0.0 || msg.size == 0 {
        return None;
    }

    Some(Trade {
        symbol: symbol_for_record(record, symbols),
        price,
        size: msg.size,
        side,
        timestamp: msg.hd.ts_event / 1_000_000, // nanos to millis
    })
}

fn symbol_for_record(_record: &dyn Record, symbols: &[String]) -> String {
    // With a single subscription the mapping is trivial; multi-symbol runs
    // would use the instrument-id symbol map from the metadata stream
    symbols
        .first()
        .cloned()
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn is_auth_error(e: &anyhow::Error) -> bool {
    let text = format!("{:#}", e).to_lowercase();
    text.contains("auth")
        || text.contains("api key")
        || text.contains("unauthorized")
        || text.contains("forbidden")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_classification() {
        assert!(is_auth_error(&anyhow::anyhow!("401 Unauthorized")));
        assert!(is_auth_error(&anyhow::anyhow!("invalid API key")));
        assert!(is_auth_error(&anyhow::anyhow!(
            "authentication handshake rejected"
        )));
        assert!(!is_auth_error(&anyhow::anyhow!("connection reset by peer")));
        assert!(!is_auth_error(&anyhow::anyhow!("timed out")));
    }
}
