//! Replay mode: historical trades through the live code path
//!
//! Loads a Databento-style trades CSV (plain or zstd-compressed), sorts it
//! by event time, and releases each trade once the virtual clock reaches
//! its timestamp. Everything downstream of the source behaves exactly as
//! it does live, which is what makes replay a faithful regression harness.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::VirtualClock;
use crate::types::{Side, Trade};

/// CSV row matching the Databento trades schema
#[derive(Debug, Deserialize)]
struct CsvRow {
    ts_event: String,
    action: String,
    side: String,
    price: f64,
    size: u32,
    symbol: String,
}

/// Load and normalize trades, keeping only the requested symbols when a
/// filter is given. Rows that are not trades, or that cannot be
/// normalized, are skipped with a counter.
pub fn load_trades(path: &Path, symbols: Option<&[String]>) -> Result<Vec<Trade>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open replay file: {:?}", path))?;

    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "zst") {
        Box::new(
            zstd::stream::Decoder::new(file)
                .with_context(|| format!("Failed to create zstd decoder for: {:?}", path))?,
        )
    } else {
        Box::new(file)
    };

    let mut csv_reader = csv::Reader::from_reader(BufReader::new(reader));
    let mut trades = Vec::new();
    let mut skipped = 0u64;

    for result in csv_reader.deserialize() {
        let row: CsvRow = match result {
            Ok(row) => row,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        if row.action != "T" {
            continue;
        }
        if let Some(filter) = symbols {
            if !filter.iter().any(|s| *s == row.symbol) {
                continue;
            }
        }

        // 'A' = buyer aggressor, 'B' = seller aggressor
        let side = match row.side.as_str() {
            "A" => Side::Buy,
            "B" => Side::Sell,
            _ => {
                skipped += 1;
                continue;
            }
        };

        let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&row.ts_event) else {
            skipped += 1;
            continue;
        };

        if !row.price.is_finite() || row.price <= 0.0 || row.size == 0 {
            skipped += 1;
            continue;
        }

        trades.push(Trade {
            symbol: row.symbol,
            price: row.price,
            size: row.size,
            side,
            timestamp: ts.timestamp_millis() as u64,
        });
    }

    trades.sort_by_key(|t| t.timestamp);

    if skipped > 0 {
        debug!("Skipped {} malformed replay rows", skipped);
    }
    info!("Loaded {} trades from {:?}", trades.len(), path);

    Ok(trades)
}

/// Feed loaded trades into the pipeline as the virtual clock passes them
pub async fn run(trades: Vec<Trade>, clock: VirtualClock, tx: mpsc::Sender<Trade>) {
    let total = trades.len();
    info!("Replay started: {} trades", total);

    for trade in trades {
        clock.wait_until(trade.timestamp).await;
        if tx.send(trade).await.is_err() {
            info!("Replay aborted: pipeline closed");
            return;
        }
    }

    info!("Replay complete: {} trades delivered", total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "ts_event,action,side,price,size,symbol\n";

    fn write_csv(name: &str, content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("replay-{}-{}.csv", name, std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_filters_and_sorts() {
        let csv = format!(
            "{}{}{}{}{}",
            HEADER,
            "2025-01-03T14:30:01+00:00,T,A,21500.25,3,NQH5\n",
            "2025-01-03T14:30:00+00:00,T,B,21500.00,2,NQH5\n",
            "2025-01-03T14:30:00.500+00:00,C,A,21500.00,1,NQH5\n", // not a trade
            "2025-01-03T14:30:02+00:00,T,A,5000.00,1,ESH5\n",      // filtered out
        );
        let path = write_csv("sorts", &csv);
        let trades =
            load_trades(&path, Some(&["NQH5".to_string()])).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(trades.len(), 2);
        // Sorted by time: the sell first
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[1].side, Side::Buy);
        assert!(trades[0].timestamp < trades[1].timestamp);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let csv = format!(
            "{}{}{}",
            HEADER,
            "2025-01-03T14:30:00+00:00,T,X,21500.00,2,NQH5\n", // bad side
            "not-a-date,T,A,21500.00,2,NQH5\n",
        );
        let path = write_csv("malformed", &csv);
        let trades = load_trades(&path, None).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn test_release_follows_virtual_clock() {
        let clock = VirtualClock::new(0);
        let (tx, mut rx) = mpsc::channel(4);
        let trades = vec![
            Trade {
                symbol: "NQH5".to_string(),
                price: 100.0,
                size: 1,
                side: Side::Buy,
                timestamp: 1000,
            },
            Trade {
                symbol: "NQH5".to_string(),
                price: 101.0,
                size: 1,
                side: Side::Sell,
                timestamp: 2000,
            },
        ];
        let handle = tokio::spawn(run(trades, clock.clone(), tx));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err()); // clock at 0: nothing released

        clock.set(1000);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.timestamp, 1000);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err()); // second still gated

        clock.set(5000);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.timestamp, 2000);
        handle.await.unwrap();
    }
}
