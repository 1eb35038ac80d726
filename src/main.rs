use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{error, info};

use orderflow_bubbles::clock::{Clock, ReplayController, VirtualClock};
use orderflow_bubbles::config::EngineConfig;
use orderflow_bubbles::hub::{Hub, DEFAULT_CAPACITY};
use orderflow_bubbles::processing::{run_symbol_pipeline, SymbolPipeline};
use orderflow_bubbles::session::{run_session_manager, SessionManager};
use orderflow_bubbles::signals::outcome::run_outcome_tracker;
use orderflow_bubbles::store::Store;
use orderflow_bubbles::streams::{demo, live, replay, route_trades};
use orderflow_bubbles::types::{AppState, Mode, Trade};
use orderflow_bubbles::{api, ws};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Databento API key (required for live mode)
    #[arg(short, long, env = "DATABENTO_API_KEY")]
    api_key: Option<String>,

    /// Symbols to subscribe to (comma-separated)
    #[arg(short, long, default_value = "NQ.c.0,ES.c.0")]
    symbols: String,

    /// Port to run the web server on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Minimum trade size to process
    #[arg(short, long, default_value = "1")]
    min_size: u32,

    /// Run the built-in demo generator instead of the live feed
    #[arg(long)]
    demo: bool,

    /// Replay a historical trades CSV (plain or .zst) against a virtual clock
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Signal database path
    #[arg(long, default_value = "orderflow.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orderflow_bubbles=info".parse().unwrap())
                .add_directive("databento=info".parse().unwrap()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Startup failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let cfg = EngineConfig::default();

    let mode = if args.replay.is_some() {
        Mode::Replay
    } else if args.demo {
        Mode::Demo
    } else {
        Mode::Live
    };

    info!("Starting Orderflow Bubbles server ({})", mode.as_str());
    info!("Port: {}", args.port);
    info!("Min size filter: {}", args.min_size);

    // Replay input is loaded up front; its symbols define the session
    let replay_trades: Option<Vec<Trade>> = match &args.replay {
        Some(path) => Some(replay::load_trades(path, None)?),
        None => None,
    };

    let symbols: Vec<String> = match (&mode, &replay_trades) {
        (Mode::Replay, Some(trades)) => {
            let mut seen = Vec::new();
            for t in trades {
                if !seen.contains(&t.symbol) {
                    seen.push(t.symbol.clone());
                }
            }
            anyhow::ensure!(!seen.is_empty(), "Replay file contains no trades");
            seen
        }
        (Mode::Demo, _) => vec![args
            .symbols
            .split(',')
            .next()
            .unwrap_or("NQ.c.0")
            .trim()
            .to_string()],
        _ => args
            .symbols
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };
    anyhow::ensure!(!symbols.is_empty(), "No symbols configured");
    info!("Symbols: {}", symbols.join(","));

    let store = Store::open(&args.db)?;
    let hub = Hub::new(DEFAULT_CAPACITY);

    // Clock: virtual in replay, wall otherwise
    let (clock, replay_cmd, vclock) = match (&mode, &replay_trades) {
        (Mode::Replay, Some(trades)) => {
            let start_ms = trades.first().map(|t| t.timestamp).unwrap_or(0);
            let vclock = VirtualClock::new(start_ms);
            let (controller, cmd_tx) = ReplayController::new(vclock.clone(), hub.clone());
            tokio::spawn(controller.run());
            (Clock::Virtual(vclock.clone()), Some(cmd_tx), Some(vclock))
        }
        _ => (Clock::Wall, None, None),
    };

    // Session manager
    let manager = SessionManager::new(mode, symbols.clone());
    let session_id = manager.id();
    let (session_tx, session_rx) = mpsc::channel(256);
    tokio::spawn(run_session_manager(
        manager,
        session_rx,
        hub.clone(),
        store.clone(),
        clock.clone(),
    ));

    // Store writer
    tokio::spawn(store.clone().run_writer());

    // Outcome tracker, fed by per-symbol last-price snapshots
    let (outcome_tx, outcome_rx) = mpsc::channel(256);
    let mut price_rx = HashMap::new();
    let mut price_tx = HashMap::new();
    for symbol in &symbols {
        let (tx, rx) = watch::channel(0.0f64);
        price_tx.insert(symbol.clone(), tx);
        price_rx.insert(symbol.clone(), rx);
    }
    tokio::spawn(run_outcome_tracker(
        clock.clone(),
        cfg.clone(),
        outcome_rx,
        price_rx,
        store.clone(),
        session_tx.clone(),
    ));

    // Per-symbol pipelines behind the trade router
    let min_size = Arc::new(RwLock::new(args.min_size));
    let mut routes = HashMap::new();
    for symbol in &symbols {
        let (tx, rx) = mpsc::channel::<Trade>(1024);
        routes.insert(symbol.clone(), tx);
        let pipeline = SymbolPipeline::new(symbol.clone(), cfg.clone());
        tokio::spawn(run_symbol_pipeline(
            pipeline,
            rx,
            clock.clone(),
            cfg.bucket_inactivity_ms,
            session_id,
            hub.clone(),
            store.clone(),
            outcome_tx.clone(),
            session_tx.clone(),
            price_tx.remove(symbol).expect("watch sender per symbol"),
        ));
    }
    drop(outcome_tx);
    drop(session_tx);

    let (source_tx, source_rx) = mpsc::channel::<Trade>(4096);
    tokio::spawn(route_trades(source_rx, routes, min_size.clone()));

    // Trade source; only live can fail fatally
    let (fatal_tx, fatal_rx) = oneshot::channel::<anyhow::Error>();
    match mode {
        Mode::Live => {
            let api_key = args
                .api_key
                .clone()
                .context("Live mode requires --api-key or DATABENTO_API_KEY")?;
            let hub_clone = hub.clone();
            let symbols_clone = symbols.clone();
            tokio::spawn(async move {
                if let Err(e) = live::run(api_key, symbols_clone, source_tx, hub_clone).await {
                    let _ = fatal_tx.send(e);
                }
            });
        }
        Mode::Demo => {
            tokio::spawn(demo::run(symbols[0].clone(), source_tx));
        }
        Mode::Replay => {
            let trades = replay_trades.expect("replay trades loaded above");
            let vclock = vclock.expect("virtual clock in replay mode");
            tokio::spawn(replay::run(trades, vclock, source_tx));
        }
    }

    // HTTP + WebSocket server
    let state = Arc::new(AppState {
        hub: hub.clone(),
        store: store.clone(),
        active_symbols: RwLock::new(symbols.iter().cloned().collect::<HashSet<_>>()),
        min_size: min_size.clone(),
        mode,
        session_id,
        replay_cmd,
    });

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/signals", get(api::get_signals))
        .route("/api/signals/export", get(api::export_signals))
        .route("/api/stats", get(api::get_stats))
        .route("/api/sessions", get(api::get_sessions))
        .fallback_service(ServeDir::new("frontend"))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server running at http://{}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    let code = tokio::select! {
        res = serve => {
            res.context("Server error")?;
            0
        }
        Ok(e) = fatal_rx => {
            error!("Fatal source error: {:#}", e);
            2
        }
    };

    // Flush whatever the writer has not gotten to yet
    store.close();
    store.flush_blocking();
    info!("Shutdown complete");

    Ok(code)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
