//! Shared wire and domain types
//!
//! The WebSocket JSON format is the ground truth: a tagged `type`
//! discriminant and lowerCamelCase field names. Fresh events carry
//! `x = 0.92`, their initial placement on the client's time axis.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::clock::ReplayCommand;
use crate::hub::Hub;
use crate::store::Store;

/// Initial horizontal placement for freshly emitted events
pub const FRESH_X: f64 = 0.92;

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Direction a signal argues for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of detected signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    DeltaFlip,
    Absorption,
    StackedImbalance,
    Confluence,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeltaFlip => "delta_flip",
            Self::Absorption => "absorption",
            Self::StackedImbalance => "stacked_imbalance",
            Self::Confluence => "confluence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delta_flip" => Some(Self::DeltaFlip),
            "absorption" => Some(Self::Absorption),
            "stacked_imbalance" => Some(Self::StackedImbalance),
            "confluence" => Some(Self::Confluence),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Realized outcome of a signal after its 5-minute mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Win,
    Loss,
    Breakeven,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Win => "win",
            Self::Loss => "loss",
            Self::Breakeven => "breakeven",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "win" => Some(Self::Win),
            "loss" => Some(Self::Loss),
            "breakeven" => Some(Self::Breakeven),
            _ => None,
        }
    }
}

/// Pipeline run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Demo,
    Replay,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Demo => "demo",
            Self::Replay => "replay",
        }
    }
}

/// Normalized trade execution from any source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub size: u32,
    pub side: Side,
    pub timestamp: u64,
}

impl Trade {
    /// Signed contract count (buy positive, sell negative)
    pub fn signed_size(&self) -> i64 {
        match self.side {
            Side::Buy => self.size as i64,
            Side::Sell => -(self.size as i64),
        }
    }
}

/// One closed 1-second bucket for a symbol
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub symbol: String,
    /// Bucket start in whole seconds since epoch
    pub bucket_start: u64,
    pub buy_volume: u32,
    pub sell_volume: u32,
    pub delta: i64,
    pub vwap: f64,
    pub dominant_side: Side,
    pub significant_imbalance: bool,
    /// First and last traded price inside the bucket
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

impl Aggregate {
    pub fn total_volume(&self) -> u32 {
        self.buy_volume + self.sell_volume
    }

    /// Bucket start in epoch milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        self.bucket_start * 1000
    }
}

/// Aggression bubble: the wire form of an Aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bubble {
    pub id: String,
    pub price: f64,
    pub size: u32, // dominant side volume (aggression)
    pub side: Side,
    pub delta: i64,
    pub timestamp: u64,
    pub x: f64,
    pub opacity: f64,
    #[serde(rename = "isSignificantImbalance")]
    pub is_significant_imbalance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CVDPoint {
    pub timestamp: u64,
    pub value: i64,
    pub x: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeProfileLevel {
    pub price: f64,
    #[serde(rename = "buyVolume")]
    pub buy_volume: u32,
    #[serde(rename = "sellVolume")]
    pub sell_volume: u32,
    #[serde(rename = "totalVolume")]
    pub total_volume: u32,
}

/// Group of adjacent low-volume levels, reported at their mean price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvnZone {
    pub price: f64,
    #[serde(rename = "levelCount")]
    pub level_count: u32,
    #[serde(rename = "totalVolume")]
    pub total_volume: u32,
}

/// Absorption strength ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
    Defended,
}

impl Strength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weak => "weak",
            Self::Medium => "medium",
            Self::Strong => "strong",
            Self::Defended => "defended",
        }
    }
}

/// Which aggressive flow is being absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsorptionKind {
    Buying,
    Selling,
}

impl AbsorptionKind {
    /// Absorbed buying implies passive sellers defending (bearish) and
    /// absorbed selling implies passive buyers defending (bullish).
    pub fn direction(&self) -> Direction {
        match self {
            Self::Buying => Direction::Bearish,
            Self::Selling => Direction::Bullish,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorptionEvent {
    pub timestamp: u64,
    pub price: f64,
    #[serde(rename = "absorptionType")]
    pub absorption_type: AbsorptionKind,
    pub delta: i64,
    #[serde(rename = "priceChange")]
    pub price_change: f64,
    pub strength: Strength,
    #[serde(rename = "eventCount")]
    pub event_count: u32,
    #[serde(rename = "totalAbsorbed")]
    pub total_absorbed: i64,
    #[serde(rename = "atKeyLevel")]
    pub at_key_level: bool,
    #[serde(rename = "againstTrend")]
    pub against_trend: bool,
    pub x: f64,
}

/// Live absorption zone snapshot sent once per second
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorptionZone {
    pub price: f64,
    #[serde(rename = "absorptionType")]
    pub absorption_type: AbsorptionKind,
    #[serde(rename = "totalAbsorbed")]
    pub total_absorbed: i64,
    #[serde(rename = "eventCount")]
    pub event_count: u32,
    #[serde(rename = "firstSeen")]
    pub first_seen: u64,
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
    pub strength: Strength,
    #[serde(rename = "atKeyLevel")]
    pub at_key_level: bool,
    #[serde(rename = "againstTrend")]
    pub against_trend: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaFlipEvent {
    pub timestamp: u64,
    pub direction: Direction,
    pub cvd: i64,
    pub price: f64,
    pub x: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackedImbalanceEvent {
    pub timestamp: u64,
    pub side: Side,
    pub direction: Direction,
    #[serde(rename = "levelCount")]
    pub level_count: u32,
    #[serde(rename = "priceHigh")]
    pub price_high: f64,
    #[serde(rename = "priceLow")]
    pub price_low: f64,
    #[serde(rename = "totalImbalance")]
    pub total_imbalance: i64,
    pub x: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceEvent {
    pub timestamp: u64,
    pub price: f64,
    pub direction: Direction,
    pub score: u32,
    pub signals: Vec<String>,
    pub x: f64,
}

/// Per-signal-type running statistics inside a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalTypeStats {
    pub count: u32,
    pub bullish: u32,
    pub bearish: u32,
    pub wins: u32,
    pub losses: u32,
    #[serde(rename = "avgMove1m")]
    pub avg_move_1m: f64,
    #[serde(rename = "avgMove5m")]
    pub avg_move_5m: f64,
    #[serde(rename = "winRate")]
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatsEvent {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    pub timestamp: u64,
    #[serde(rename = "sessionHigh")]
    pub session_high: f64,
    #[serde(rename = "sessionLow")]
    pub session_low: f64,
    #[serde(rename = "totalVolume")]
    pub total_volume: u64,
    #[serde(rename = "deltaFlip")]
    pub delta_flip: SignalTypeStats,
    pub absorption: SignalTypeStats,
    #[serde(rename = "stackedImbalance")]
    pub stacked_imbalance: SignalTypeStats,
    pub confluence: SignalTypeStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayStatusEvent {
    pub running: bool,
    pub speed: f64,
    #[serde(rename = "virtualTime")]
    pub virtual_time: u64,
}

/// Everything that goes out over the WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    Bubble(Bubble),
    CVDPoint(CVDPoint),
    VolumeProfile {
        levels: Vec<VolumeProfileLevel>,
        poc: Option<f64>,
        vah: Option<f64>,
        val: Option<f64>,
        lvns: Vec<LvnZone>,
    },
    Absorption(AbsorptionEvent),
    AbsorptionZones { zones: Vec<AbsorptionZone> },
    DeltaFlip(DeltaFlipEvent),
    StackedImbalance(StackedImbalanceEvent),
    Confluence(ConfluenceEvent),
    SessionStats(SessionStatsEvent),
    ReplayStatus(ReplayStatusEvent),
    Connected { symbols: Vec<String>, mode: Mode },
    Error { message: String },
}

/// Inbound control message from a WebSocket client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub speed: Option<f64>,
    pub min_size: Option<u32>,
}

/// Shared application state
pub struct AppState {
    pub hub: Hub,
    pub store: Store,
    pub active_symbols: RwLock<HashSet<String>>,
    /// Shared with the trade router so set_min_size takes effect upstream
    pub min_size: std::sync::Arc<RwLock<u32>>,
    pub mode: Mode,
    pub session_id: Uuid,
    /// Present only in replay mode
    pub replay_cmd: Option<mpsc::Sender<ReplayCommand>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_message_tags_and_casing() {
        let msg = WsMessage::Bubble(Bubble {
            id: "bubble-0".to_string(),
            price: 21500.25,
            size: 42,
            side: Side::Buy,
            delta: 17,
            timestamp: 1_700_000_000_000,
            x: FRESH_X,
            opacity: 1.0,
            is_significant_imbalance: true,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Bubble\""));
        assert!(json.contains("\"isSignificantImbalance\":true"));
        assert!(json.contains("\"side\":\"buy\""));
    }

    #[test]
    fn test_every_message_round_trips() {
        let messages = vec![
            WsMessage::CVDPoint(CVDPoint { timestamp: 1, value: -5, x: FRESH_X }),
            WsMessage::VolumeProfile {
                levels: vec![VolumeProfileLevel {
                    price: 100.0,
                    buy_volume: 3,
                    sell_volume: 4,
                    total_volume: 7,
                }],
                poc: Some(100.0),
                vah: Some(100.0),
                val: Some(100.0),
                lvns: vec![LvnZone { price: 101.0, level_count: 2, total_volume: 1 }],
            },
            WsMessage::Absorption(AbsorptionEvent {
                timestamp: 5,
                price: 100.0,
                absorption_type: AbsorptionKind::Buying,
                delta: 40,
                price_change: -0.25,
                strength: Strength::Medium,
                event_count: 3,
                total_absorbed: 120,
                at_key_level: true,
                against_trend: false,
                x: FRESH_X,
            }),
            WsMessage::DeltaFlip(DeltaFlipEvent {
                timestamp: 2,
                direction: Direction::Bearish,
                cvd: -12,
                price: 100.25,
                x: FRESH_X,
            }),
            WsMessage::StackedImbalance(StackedImbalanceEvent {
                timestamp: 3,
                side: Side::Buy,
                direction: Direction::Bullish,
                level_count: 3,
                price_high: 102.0,
                price_low: 100.0,
                total_imbalance: 26,
                x: FRESH_X,
            }),
            WsMessage::Confluence(ConfluenceEvent {
                timestamp: 4,
                price: 100.0,
                direction: Direction::Bullish,
                score: 2,
                signals: vec!["delta_flip".to_string(), "absorption".to_string()],
                x: FRESH_X,
            }),
            WsMessage::ReplayStatus(ReplayStatusEvent {
                running: true,
                speed: 2.0,
                virtual_time: 1_700_000_000_000,
            }),
            WsMessage::Connected {
                symbols: vec!["NQ.c.0".to_string()],
                mode: Mode::Demo,
            },
            WsMessage::Error { message: "bad json".to_string() },
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let back: WsMessage = serde_json::from_str(&json).unwrap();
            let rejson = serde_json::to_string(&back).unwrap();
            assert_eq!(json, rejson);
        }
    }

    #[test]
    fn test_signal_type_tags() {
        assert_eq!(SignalType::DeltaFlip.as_str(), "delta_flip");
        assert_eq!(
            serde_json::to_string(&SignalType::StackedImbalance).unwrap(),
            "\"stacked_imbalance\""
        );
        assert_eq!(SignalType::parse("confluence"), Some(SignalType::Confluence));
        assert_eq!(SignalType::parse("nope"), None);
    }

    #[test]
    fn test_signed_size() {
        let t = Trade {
            symbol: "NQ.c.0".to_string(),
            price: 100.0,
            size: 7,
            side: Side::Sell,
            timestamp: 0,
        };
        assert_eq!(t.signed_size(), -7);
    }

    #[test]
    fn test_strength_ordering() {
        assert!(Strength::Defended > Strength::Strong);
        assert!(Strength::Medium > Strength::Weak);
    }
}
