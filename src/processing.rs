//! Per-symbol processing pipeline
//!
//! Owns all mutable orderflow state for one symbol: the open 1-second
//! bucket, CVD, volume profile, absorption accumulators, the stacked
//! imbalance scanner and the confluence window. Trades come in, typed
//! messages and signals come out; nothing in here touches a socket or the
//! database directly, which keeps the whole pipeline deterministic under
//! replay.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::hub::Hub;
use crate::session::SessionEvent;
use crate::signals::outcome::OutcomeRequest;
use crate::signals::profile::KeyLevels;
use crate::signals::{
    AbsorptionDetector, ConfluenceEngine, CvdTracker, StackedImbalanceDetector, VolumeProfile,
};
use crate::store::{SignalRow, Store, StoreJob};
use crate::types::{
    Aggregate, Bubble, CVDPoint, ConfluenceEvent, DeltaFlipEvent, Direction, Outcome, Side,
    SignalType, Trade, WsMessage, FRESH_X,
};

/// A signal leaving the pipeline: broadcast, persisted, and outcome-tracked
#[derive(Debug, Clone)]
pub struct SignalEmit {
    pub signal_id: Uuid,
    pub signal_type: SignalType,
    pub direction: Direction,
    pub price: f64,
    pub timestamp: u64,
    pub message: WsMessage,
}

/// Everything the pipeline produces, in emission order
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Message(WsMessage),
    Signal(SignalEmit),
    SessionUpdate { high: f64, low: f64, volume: u32 },
}

#[derive(Debug, Clone)]
struct OpenBucket {
    start_s: u64,
    buy_volume: u32,
    sell_volume: u32,
    weighted_sum: f64,
    first_price: f64,
    last_price: f64,
    high: f64,
    low: f64,
}

impl OpenBucket {
    fn new(start_s: u64, trade: &Trade) -> Self {
        let (buy, sell) = match trade.side {
            Side::Buy => (trade.size, 0),
            Side::Sell => (0, trade.size),
        };
        Self {
            start_s,
            buy_volume: buy,
            sell_volume: sell,
            weighted_sum: trade.price * trade.size as f64,
            first_price: trade.price,
            last_price: trade.price,
            high: trade.price,
            low: trade.price,
        }
    }

    fn add(&mut self, trade: &Trade) {
        match trade.side {
            Side::Buy => self.buy_volume += trade.size,
            Side::Sell => self.sell_volume += trade.size,
        }
        self.weighted_sum += trade.price * trade.size as f64;
        self.last_price = trade.price;
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
    }

    fn end_ms(&self) -> u64 {
        (self.start_s + 1) * 1000
    }

    fn finalize(self, symbol: &str, significant_ratio: f64) -> Aggregate {
        let total = self.buy_volume + self.sell_volume;
        let delta = self.buy_volume as i64 - self.sell_volume as i64;
        Aggregate {
            symbol: symbol.to_string(),
            bucket_start: self.start_s,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            delta,
            vwap: self.weighted_sum / total.max(1) as f64,
            dominant_side: if self.buy_volume >= self.sell_volume {
                Side::Buy
            } else {
                Side::Sell
            },
            significant_imbalance: delta.unsigned_abs() as f64 / total.max(1) as f64
                >= significant_ratio,
            open: self.first_price,
            close: self.last_price,
            high: self.high,
            low: self.low,
        }
    }
}

pub struct SymbolPipeline {
    symbol: String,
    cfg: EngineConfig,
    bucket: Option<OpenBucket>,
    bubble_counter: u64,
    signal_counter: u64,
    cvd: CvdTracker,
    profile: VolumeProfile,
    absorption: AbsorptionDetector,
    imbalance: StackedImbalanceDetector,
    confluence: ConfluenceEngine,
    /// Key levels as of the last closed bucket, for absorption context tags
    key_levels: KeyLevels,
    /// Highest bucket second already closed; aggregates are strictly
    /// increasing, so a straggler for a closed second folds forward
    last_closed_s: Option<u64>,
}

impl SymbolPipeline {
    pub fn new(symbol: String, cfg: EngineConfig) -> Self {
        Self {
            cvd: CvdTracker::new(cfg.delta_flip_threshold),
            profile: VolumeProfile::new(&cfg),
            absorption: AbsorptionDetector::new(&cfg),
            imbalance: StackedImbalanceDetector::new(&cfg),
            confluence: ConfluenceEngine::new(&cfg),
            key_levels: KeyLevels::default(),
            last_closed_s: None,
            bucket: None,
            bubble_counter: 0,
            signal_counter: 0,
            symbol,
            cfg,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn cvd(&self) -> i64 {
        self.cvd.value()
    }

    /// End of the currently open bucket, if any
    pub fn open_bucket_end_ms(&self) -> Option<u64> {
        self.bucket.as_ref().map(OpenBucket::end_ms)
    }

    /// Stable id for a signal: same input stream, same ids, so replay runs
    /// are comparable record-for-record
    fn next_signal_id(&mut self, signal_type: SignalType, timestamp: u64) -> Uuid {
        self.signal_counter += 1;
        let name = format!(
            "{}:{}:{}:{}",
            self.symbol, signal_type, timestamp, self.signal_counter
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    fn emit_signal(
        &mut self,
        events: &mut Vec<PipelineEvent>,
        signal_type: SignalType,
        direction: Direction,
        price: f64,
        timestamp: u64,
        message: WsMessage,
    ) {
        let signal_id = self.next_signal_id(signal_type, timestamp);
        events.push(PipelineEvent::Signal(SignalEmit {
            signal_id,
            signal_type,
            direction,
            price,
            timestamp,
            message,
        }));

        // Confluence watches the base detectors; its own output stays out of
        // the window
        if signal_type != SignalType::Confluence {
            if let Some(conf) = self
                .confluence
                .observe(signal_type, direction, price, timestamp)
            {
                self.emit_confluence(events, conf);
            }
        }
    }

    fn emit_confluence(&mut self, events: &mut Vec<PipelineEvent>, conf: ConfluenceEvent) {
        info!(
            "CONFLUENCE [{}] score={} at {:.2}: {}",
            conf.direction,
            conf.score,
            conf.price,
            conf.signals.join("+")
        );
        let (direction, price, timestamp) = (conf.direction, conf.price, conf.timestamp);
        let message = WsMessage::Confluence(conf);
        self.emit_signal(
            events,
            SignalType::Confluence,
            direction,
            price,
            timestamp,
            message,
        );
    }

    /// Feed one trade. Closes the open bucket first when the trade belongs
    /// to a later second (boundary trades open the later bucket).
    pub fn on_trade(&mut self, trade: &Trade) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        let mut bucket_s = trade.timestamp / 1000;
        if let Some(closed) = self.last_closed_s {
            bucket_s = bucket_s.max(closed + 1);
        }

        if matches!(&self.bucket, Some(b) if bucket_s > b.start_s) {
            self.close_bucket(&mut events);
        }

        let price_change = match &mut self.bucket {
            Some(bucket) => {
                bucket.add(trade);
                trade.price - bucket.first_price
            }
            None => {
                self.bucket = Some(OpenBucket::new(bucket_s, trade));
                0.0
            }
        };

        // Volume profile accumulates per trade; snapshots go out per second
        self.profile.record(trade.price, trade.size, trade.side);

        // Absorption classifies each trade against its bucket-local move
        if let Some(absorption) = self.absorption.on_trade(
            trade,
            price_change,
            &self.key_levels,
            self.cvd.sign(),
        ) {
            info!(
                "ABSORPTION [{}] {:?} absorbed at {:.2} | events={} total={}{}{}",
                absorption.strength.as_str().to_uppercase(),
                absorption.absorption_type,
                absorption.price,
                absorption.event_count,
                absorption.total_absorbed,
                if absorption.at_key_level { " @ KEY LEVEL" } else { "" },
                if absorption.against_trend { " AGAINST TREND" } else { "" },
            );
            let direction = absorption.absorption_type.direction();
            let (price, timestamp) = (absorption.price, absorption.timestamp);
            let message = WsMessage::Absorption(absorption);
            self.emit_signal(
                &mut events,
                SignalType::Absorption,
                direction,
                price,
                timestamp,
                message,
            );
        }

        events
    }

    /// Close the open bucket regardless of why (next trade arrived, idle
    /// timeout, virtual clock passed the boundary, shutdown flush).
    pub fn force_flush(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        self.close_bucket(&mut events);
        events
    }

    fn close_bucket(&mut self, events: &mut Vec<PipelineEvent>) {
        let Some(bucket) = self.bucket.take() else {
            return;
        };
        let agg = bucket.finalize(&self.symbol, self.cfg.significant_imbalance_ratio);
        let ts = agg.timestamp_ms();
        self.last_closed_s = Some(agg.bucket_start);

        debug!(
            "Aggregate {}@{}: buy={} sell={} delta={} vwap={:.2}",
            agg.symbol, agg.bucket_start, agg.buy_volume, agg.sell_volume, agg.delta, agg.vwap
        );

        events.push(PipelineEvent::SessionUpdate {
            high: agg.high,
            low: agg.low,
            volume: agg.total_volume(),
        });

        // Bubble
        let dominant_volume = match agg.dominant_side {
            Side::Buy => agg.buy_volume,
            Side::Sell => agg.sell_volume,
        };
        events.push(PipelineEvent::Message(WsMessage::Bubble(Bubble {
            id: format!("{}-bubble-{}", self.symbol, self.bubble_counter),
            price: agg.vwap,
            size: dominant_volume,
            side: agg.dominant_side,
            delta: agg.delta,
            timestamp: ts,
            x: FRESH_X,
            opacity: 1.0,
            is_significant_imbalance: agg.significant_imbalance,
        })));
        self.bubble_counter += 1;

        // CVD point and possible delta flip
        let cross = self.cvd.apply(agg.delta);
        events.push(PipelineEvent::Message(WsMessage::CVDPoint(CVDPoint {
            timestamp: ts,
            value: self.cvd.value(),
            x: FRESH_X,
        })));
        if let Some(cross) = cross {
            info!(
                "DELTA FLIP [{}] cvd={} at {:.2}",
                cross.direction, cross.cvd, agg.close
            );
            let message = WsMessage::DeltaFlip(DeltaFlipEvent {
                timestamp: ts,
                direction: cross.direction,
                cvd: cross.cvd,
                price: agg.close,
                x: FRESH_X,
            });
            self.emit_signal(
                events,
                SignalType::DeltaFlip,
                cross.direction,
                agg.close,
                ts,
                message,
            );
        }

        // Stacked imbalances over the updated ladder
        for stacked in self.imbalance.scan(&self.profile, ts) {
            info!(
                "STACKED IMBALANCE [{}] {} levels {:.2}-{:.2}",
                stacked.direction, stacked.level_count, stacked.price_low, stacked.price_high
            );
            let direction = stacked.direction;
            let price = match stacked.side {
                Side::Buy => stacked.price_low,
                Side::Sell => stacked.price_high,
            };
            let message = WsMessage::StackedImbalance(stacked);
            self.emit_signal(
                events,
                SignalType::StackedImbalance,
                direction,
                price,
                ts,
                message,
            );
        }

        // Per-second snapshots: profile with derived levels, then live zones
        let (levels, key_levels, lvns) = self.profile.snapshot();
        self.key_levels = key_levels;
        events.push(PipelineEvent::Message(WsMessage::VolumeProfile {
            levels,
            poc: key_levels.poc,
            vah: key_levels.vah,
            val: key_levels.val,
            lvns,
        }));

        self.absorption.prune(ts);
        let zones = self.absorption.zones(&self.key_levels, self.cvd.sign());
        if !zones.is_empty() {
            events.push(PipelineEvent::Message(WsMessage::AbsorptionZones { zones }));
        }
    }
}

/// Forward pipeline output to the hub, store, outcome tracker and session
/// manager.
pub async fn dispatch_events(
    events: Vec<PipelineEvent>,
    session_id: Uuid,
    hub: &Hub,
    store: &Store,
    outcome_tx: &mpsc::Sender<OutcomeRequest>,
    session_tx: &mpsc::Sender<SessionEvent>,
    symbol: &str,
) {
    for event in events {
        match event {
            PipelineEvent::Message(msg) => hub.send(msg),
            PipelineEvent::SessionUpdate { high, low, volume } => {
                let _ = session_tx
                    .send(SessionEvent::Aggregate { high, low, volume })
                    .await;
            }
            PipelineEvent::Signal(signal) => {
                hub.send(signal.message.clone());
                store.enqueue(StoreJob::InsertSignal(SignalRow {
                    id: signal.signal_id,
                    session_id,
                    created_at: chrono::Utc::now().to_rfc3339(),
                    timestamp: signal.timestamp,
                    signal_type: signal.signal_type,
                    direction: signal.direction,
                    price_at_emit: signal.price,
                    price_after_1m: None,
                    price_after_5m: None,
                    outcome: Outcome::Pending,
                }));
                let _ = outcome_tx
                    .send(OutcomeRequest {
                        signal_id: signal.signal_id,
                        symbol: symbol.to_string(),
                        signal_type: signal.signal_type,
                        direction: signal.direction,
                        price_at_emit: signal.price,
                        timestamp: signal.timestamp,
                    })
                    .await;
                let _ = session_tx
                    .send(SessionEvent::SignalEmitted {
                        signal_type: signal.signal_type,
                        direction: signal.direction,
                    })
                    .await;
            }
        }
    }
}

/// Pipeline task for one symbol. Bucket closure is trade-driven, with an
/// inactivity flush on the wall clock in live/demo mode and a pure
/// virtual-clock flush in replay.
#[allow(clippy::too_many_arguments)]
pub async fn run_symbol_pipeline(
    mut pipeline: SymbolPipeline,
    mut rx: mpsc::Receiver<Trade>,
    clock: Clock,
    inactivity_ms: u64,
    session_id: Uuid,
    hub: Hub,
    store: Store,
    outcome_tx: mpsc::Sender<OutcomeRequest>,
    session_tx: mpsc::Sender<SessionEvent>,
    price_tx: watch::Sender<f64>,
) {
    info!("Pipeline started for {}", pipeline.symbol());

    loop {
        let deadline = pipeline.open_bucket_end_ms().map(|end_ms| match &clock {
            // Replay: the bucket closes exactly when the virtual clock
            // passes its end
            Clock::Virtual(_) => end_ms,
            // Live/demo: close after a gap with no trades
            Clock::Wall => clock.now_ms() + inactivity_ms,
        });

        let events = tokio::select! {
            // Queued trades drain before the flush deadline is considered,
            // so a fast virtual clock cannot split a bucket in transit
            biased;
            trade = rx.recv() => {
                match trade {
                    Some(trade) => {
                        let _ = price_tx.send(trade.price);
                        pipeline.on_trade(&trade)
                    }
                    None => break,
                }
            }
            _ = clock.sleep_until(deadline.unwrap_or(u64::MAX)), if deadline.is_some() => {
                pipeline.force_flush()
            }
        };

        dispatch_events(
            events,
            session_id,
            &hub,
            &store,
            &outcome_tx,
            &session_tx,
            pipeline.symbol(),
        )
        .await;
    }

    // Source ended: flush the open bucket once
    let events = pipeline.force_flush();
    dispatch_events(
        events,
        session_id,
        &hub,
        &store,
        &outcome_tx,
        &session_tx,
        pipeline.symbol(),
    )
    .await;
    info!("Pipeline stopped for {}", pipeline.symbol());
}
