//! Clock indirection and the replay controller
//!
//! Every timer in the pipeline (bucket inactivity, outcome marks, status
//! ticks) reads time through [`Clock`] so that replay mode is deterministic:
//! the virtual clock is the only time source when mode=replay.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::hub::Hub;
use crate::types::{ReplayStatusEvent, WsMessage};

/// Virtual clock backed by a watch channel so waiters wake on every advance
#[derive(Debug, Clone)]
pub struct VirtualClock {
    tx: Arc<watch::Sender<u64>>,
}

impl VirtualClock {
    pub fn new(start_ms: u64) -> Self {
        let (tx, _rx) = watch::channel(start_ms);
        Self { tx: Arc::new(tx) }
    }

    pub fn now_ms(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn advance(&self, delta_ms: u64) {
        if delta_ms == 0 {
            return;
        }
        self.tx.send_modify(|t| *t += delta_ms);
    }

    pub fn set(&self, now_ms: u64) {
        self.tx.send_modify(|t| {
            if now_ms > *t {
                *t = now_ms;
            }
        });
    }

    /// Wait until the virtual clock reaches `deadline_ms`
    pub async fn wait_until(&self, deadline_ms: u64) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline_ms {
                return;
            }
            if rx.changed().await.is_err() {
                // Clock owner gone, nothing will ever advance again
                return;
            }
        }
    }
}

/// Wall clock or virtual clock, behind one interface
#[derive(Debug, Clone)]
pub enum Clock {
    Wall,
    Virtual(VirtualClock),
}

impl Clock {
    pub fn now_ms(&self) -> u64 {
        match self {
            Self::Wall => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            Self::Virtual(v) => v.now_ms(),
        }
    }

    pub async fn sleep_until(&self, deadline_ms: u64) {
        match self {
            Self::Wall => {
                let now = self.now_ms();
                if deadline_ms > now {
                    tokio::time::sleep(Duration::from_millis(deadline_ms - now)).await;
                }
            }
            Self::Virtual(v) => v.wait_until(deadline_ms).await,
        }
    }

    pub async fn sleep_ms(&self, dur_ms: u64) {
        let deadline = self.now_ms() + dur_ms;
        self.sleep_until(deadline).await;
    }
}

/// Commands a WebSocket client can send to the replay controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayCommand {
    Pause,
    Resume,
    SetSpeed(f64),
}

/// Drives the virtual clock: advances by real_delta * speed while running
pub struct ReplayController {
    clock: VirtualClock,
    cmd_rx: mpsc::Receiver<ReplayCommand>,
    hub: Hub,
    running: bool,
    speed: f64,
}

/// How often the controller folds real time into the virtual clock
const TICK_MS: u64 = 50;

impl ReplayController {
    /// Returns the controller plus the command sender handed to ws clients
    pub fn new(clock: VirtualClock, hub: Hub) -> (Self, mpsc::Sender<ReplayCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        (
            Self {
                clock,
                cmd_rx,
                hub,
                running: true,
                speed: 1.0,
            },
            cmd_tx,
        )
    }

    fn status(&self) -> ReplayStatusEvent {
        ReplayStatusEvent {
            running: self.running,
            speed: self.speed,
            virtual_time: self.clock.now_ms(),
        }
    }

    fn broadcast_status(&self) {
        self.hub.send(WsMessage::ReplayStatus(self.status()));
    }

    fn apply(&mut self, cmd: ReplayCommand) {
        match cmd {
            ReplayCommand::Pause => {
                if self.running {
                    self.running = false;
                    info!("Replay paused at {}", self.clock.now_ms());
                }
            }
            ReplayCommand::Resume => {
                if !self.running {
                    self.running = true;
                    info!("Replay resumed at {}", self.clock.now_ms());
                }
            }
            ReplayCommand::SetSpeed(speed) => {
                if speed.is_finite() && speed > 0.0 {
                    self.speed = speed;
                    info!("Replay speed set to {:.2}x", speed);
                } else {
                    warn!("Ignoring invalid replay speed: {}", speed);
                }
            }
        }
        self.broadcast_status();
    }

    /// Run until every command sender is dropped
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut since_status = 0u64;

        self.broadcast_status();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.apply(cmd),
                        None => {
                            info!("Replay controller shutting down");
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    if self.running {
                        self.clock.advance((TICK_MS as f64 * self.speed) as u64);
                    }
                    since_status += TICK_MS;
                    if since_status >= 1000 {
                        since_status = 0;
                        self.broadcast_status();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_advances() {
        let clock = VirtualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1250);
        clock.set(1100); // set never moves backwards
        assert_eq!(clock.now_ms(), 1250);
        clock.set(2000);
        assert_eq!(clock.now_ms(), 2000);
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_advance() {
        let clock = VirtualClock::new(0);
        let waiter = clock.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until(500).await;
            waiter.now_ms()
        });
        tokio::task::yield_now().await;
        clock.advance(499);
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        clock.advance(1);
        let woke_at = handle.await.unwrap();
        assert!(woke_at >= 500);
    }

    #[tokio::test]
    async fn test_wait_until_past_deadline_returns_immediately() {
        let clock = VirtualClock::new(10_000);
        clock.wait_until(500).await;
    }

    #[tokio::test]
    async fn test_controller_pause_stops_advancing() {
        let hub = Hub::new(16);
        let clock = VirtualClock::new(0);
        let (ctl, cmd_tx) = ReplayController::new(clock.clone(), hub);
        let handle = tokio::spawn(ctl.run());

        cmd_tx.send(ReplayCommand::Pause).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let frozen = clock.now_ms();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(clock.now_ms(), frozen);

        cmd_tx.send(ReplayCommand::Resume).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(clock.now_ms() > frozen);

        drop(cmd_tx);
        handle.await.unwrap();
    }
}
