//! Trade sources
//!
//! Three interchangeable producers feed the same pipeline: the Databento
//! live adapter, the demo random-walk generator, and the historical replay
//! reader. Each pushes normalized trades into an mpsc channel; the router
//! applies the min-size filter and fans trades out to per-symbol pipelines.

pub mod demo;
pub mod live;
pub mod replay;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::types::Trade;

/// Dispatch trades from one source to per-symbol pipeline channels,
/// dropping anything below the live-adjustable minimum size. Ends when the
/// source channel closes, which in turn closes every pipeline.
pub async fn route_trades(
    mut rx: mpsc::Receiver<Trade>,
    routes: HashMap<String, mpsc::Sender<Trade>>,
    min_size: Arc<RwLock<u32>>,
) {
    let mut routed = 0u64;
    let mut unroutable = 0u64;

    while let Some(trade) = rx.recv().await {
        let min = *min_size.read().await;
        if trade.size < min {
            continue;
        }
        match routes.get(&trade.symbol) {
            Some(tx) => {
                if tx.send(trade).await.is_err() {
                    break;
                }
                routed += 1;
            }
            None => {
                unroutable += 1;
                if unroutable == 1 {
                    debug!("Dropping trade for unsubscribed symbol {}", trade.symbol);
                }
            }
        }
    }

    info!(
        "Trade router stopped ({} routed, {} unroutable)",
        routed, unroutable
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn trade(symbol: &str, size: u32) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price: 100.0,
            size,
            side: Side::Buy,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_routing_and_min_size() {
        let (src_tx, src_rx) = mpsc::channel(16);
        let (nq_tx, mut nq_rx) = mpsc::channel(16);
        let routes = HashMap::from([("NQ.c.0".to_string(), nq_tx)]);
        let min_size = Arc::new(RwLock::new(5u32));

        let handle = tokio::spawn(route_trades(src_rx, routes, min_size));

        src_tx.send(trade("NQ.c.0", 4)).await.unwrap(); // below min
        src_tx.send(trade("NQ.c.0", 5)).await.unwrap();
        src_tx.send(trade("ES.c.0", 50)).await.unwrap(); // unroutable
        drop(src_tx);
        handle.await.unwrap();

        let got = nq_rx.recv().await.unwrap();
        assert_eq!(got.size, 5);
        assert!(nq_rx.recv().await.is_none());
    }
}
