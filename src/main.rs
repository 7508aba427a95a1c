// =============================================================================
// Titan Core — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. An operator must
// explicitly switch to Live mode via the admin API. Every background loop
// below reconnects on error rather than exiting the process — a broker
// hiccup or a dropped websocket should degrade a single subsystem, not
// bring the whole engine down.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use titan_core::app_state::AppState;
use titan_core::broker::binance::BinanceAdapter;
use titan_core::broker::{self, BrokerGateway, RetryConfig};
use titan_core::config_manager::ConfigManager;
use titan_core::drift::DriftGuard;
use titan_core::event_bus::EventBus;
use titan_core::heartbeat::Heartbeat;
use titan_core::l2_validator;
use titan_core::market_data::{self, orderbook::OrderBookManager};
use titan_core::panic_controls::PanicControls;
use titan_core::phase_manager::PhaseManager;
use titan_core::pipeline::IntentPipeline;
use titan_core::reconcile::ReconciliationEngine;
use titan_core::safety::SafetyGates;
use titan_core::shadow_state::ShadowState;
use titan_core::store::DurableStore;
use titan_core::types::{self, AccountMode};
use titan_core::api;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const REGIME_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const RETRY_DRAIN_INTERVAL: Duration = Duration::from_secs(5);
const INTENT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const BACKUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Validated startup environment. Every field here has already passed its
/// range/presence check — `load_startup_env` exits the process rather than
/// handing back something out of bounds.
struct StartupEnv {
    broker_api_key: String,
    broker_api_secret: String,
    hmac_secret: String,
    max_risk_pct: f64,
    phase1_risk_pct: f64,
    phase2_risk_pct: f64,
    maker_fee_pct: f64,
    taker_fee_pct: f64,
    rate_limit_per_sec: u32,
    database_type: String,
    database_url: String,
}

/// Reads and validates the core environment variables, exiting with code 1
/// on the first invalid or missing required value rather than starting the
/// engine on guessed defaults.
fn load_startup_env() -> StartupEnv {
    fn require_nonempty(name: &str) -> String {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            _ => {
                error!(var = name, "required environment variable is missing or empty");
                std::process::exit(1);
            }
        }
    }

    fn bounded_f64(name: &str, default: f64, min: f64, max: f64) -> f64 {
        match std::env::var(name) {
            Ok(v) => match v.parse::<f64>() {
                Ok(n) if n >= min && n <= max => n,
                Ok(n) => {
                    error!(var = name, value = n, min, max, "environment variable out of range");
                    std::process::exit(1);
                }
                Err(_) => {
                    error!(var = name, value = %v, "environment variable is not a valid number");
                    std::process::exit(1);
                }
            },
            Err(_) => default,
        }
    }

    let broker_api_key = require_nonempty("BROKER_API_KEY");
    let broker_api_secret = require_nonempty("BROKER_API_SECRET");

    let hmac_secret = require_nonempty("HMAC_SECRET");
    if hmac_secret.len() < 32 {
        error!(len = hmac_secret.len(), "HMAC_SECRET must be at least 32 characters");
        std::process::exit(1);
    }

    let max_risk_pct = bounded_f64("MAX_RISK_PCT", 0.10, 0.01, 0.20);
    let phase1_risk_pct = bounded_f64("PHASE_1_RISK_PCT", 0.10, 0.01, 0.50);
    let phase2_risk_pct = bounded_f64("PHASE_2_RISK_PCT", 0.05, 0.01, 0.50);
    let maker_fee_pct = bounded_f64("MAKER_FEE_PCT", 0.0002, 0.0, 1.0);
    let taker_fee_pct = bounded_f64("TAKER_FEE_PCT", 0.0006, 0.0, 1.0);

    let rate_limit_per_sec = match std::env::var("RATE_LIMIT_PER_SEC") {
        Ok(v) => match v.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                error!(var = "RATE_LIMIT_PER_SEC", value = %v, "must be a positive integer");
                std::process::exit(1);
            }
        },
        Err(_) => 12,
    };

    let database_type = std::env::var("DATABASE_TYPE").unwrap_or_else(|_| "sqlite".into());
    if database_type != "sqlite" {
        error!(database_type, "unsupported DATABASE_TYPE — only 'sqlite' is implemented");
        std::process::exit(1);
    }
    let database_url = std::env::var("DATABASE_URL").unwrap_or_default();

    StartupEnv {
        broker_api_key,
        broker_api_secret,
        hmac_secret,
        max_risk_pct,
        phase1_risk_pct,
        phase2_risk_pct,
        maker_fee_pct,
        taker_fee_pct,
        rate_limit_per_sec,
        database_type,
        database_url,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                Titan Core — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let startup_env = load_startup_env();

    // ── 1. Event bus, config, durable store ──────────────────────────────
    let events = Arc::new(EventBus::new());
    let config = Arc::new(ConfigManager::load("titan_config.json", events.clone()));

    // SAFETY: force Demo + Paused on every startup regardless of the
    // persisted config; Live mode is always an explicit operator action.
    config.set_trading_mode(types::TradingMode::Paused);

    config.seed_startup_params(
        startup_env.max_risk_pct,
        startup_env.phase1_risk_pct,
        startup_env.phase2_risk_pct,
        startup_env.maker_fee_pct,
        startup_env.taker_fee_pct,
        startup_env.rate_limit_per_sec,
        startup_env.database_type.clone(),
        startup_env.database_url.clone(),
    );
    config.set_hmac_secret(startup_env.hmac_secret.clone());

    let db_path = if !startup_env.database_url.is_empty() {
        startup_env.database_url.clone()
    } else {
        std::env::var("TITAN_DB_PATH").unwrap_or_else(|_| "titan_core.db".into())
    };
    let store = Arc::new(DurableStore::open(&db_path, events.clone())?);

    let symbols = config.public_config().symbols;
    info!(?symbols, "configured trading pairs");
    info!(
        trading_mode = %config.trading_mode(),
        "engine starting in SAFE mode (paused)"
    );

    // ── 2. Core subsystems ────────────────────────────────────────────────
    let shadow = Arc::new(ShadowState::new(events.clone()));

    match store.recover_open_positions() {
        Ok(recovered) => {
            for position in recovered {
                info!(symbol = %position.symbol, "restoring open position from durable store");
                shadow.restore_position(position);
            }
        }
        Err(e) => error!(error = %e, "failed to recover open positions from durable store"),
    }

    let api_key = startup_env.broker_api_key.clone();
    let api_secret = startup_env.broker_api_secret.clone();
    config.set_credentials(api_key.clone(), api_secret.clone());

    let adapter = Arc::new(BinanceAdapter::new(api_key, api_secret));
    let broker = Arc::new(BrokerGateway::new(adapter.clone(), RetryConfig::default()));

    let safety = Arc::new(SafetyGates::new(
        1000.0,
        config.public_config().max_risk_pct,
        6,
        0.05,
        50,
        config.public_config().rate_limit_per_sec,
    ));
    let phase_manager = Arc::new(PhaseManager::new(events.clone()));
    let orderbook = Arc::new(OrderBookManager::new());

    let drift = Arc::new(DriftGuard::new(
        shadow.clone(),
        broker.clone(),
        config.clone(),
        events.clone(),
    ));

    let pipeline = Arc::new(IntentPipeline::new(
        shadow.clone(),
        safety.clone(),
        config.clone(),
        phase_manager.clone(),
        broker.clone(),
        orderbook.clone(),
        events.clone(),
        drift.clone(),
        l2_validator::CRYPTO_PRESET.clone(),
    ));

    let reconcile = Arc::new(ReconciliationEngine::new(
        shadow.clone(),
        broker.clone(),
        config.clone(),
        events.clone(),
        config.public_config().max_consecutive_mismatches,
    ));

    let heartbeat = Arc::new(Heartbeat::new(
        config.public_config().heartbeat_max_misses,
        shadow.clone(),
        broker.clone(),
        config.clone(),
        events.clone(),
    ));

    let panic_controls = Arc::new(PanicControls::new(
        shadow.clone(),
        broker.clone(),
        config.clone(),
        pipeline.clone(),
        events.clone(),
    ));

    let state = Arc::new(AppState::new(
        config.clone(),
        shadow.clone(),
        broker.clone(),
        safety.clone(),
        phase_manager.clone(),
        orderbook.clone(),
        events.clone(),
        pipeline.clone(),
        reconcile.clone(),
        heartbeat.clone(),
        drift.clone(),
        store.clone(),
        panic_controls.clone(),
    ));

    // ── 3. Market data streams (orderbook feed per symbol) ───────────────
    for symbol in &symbols {
        let ob = orderbook.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_depth_stream(&sym, &ob).await {
                    error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // ── 3b. Mid-price poll — feeds the liquidation detector and drift
    // guard's flash-crash monitor from the orderbook cache already
    // maintained by the depth streams above, without opening a second
    // network connection per symbol.
    {
        let ob = orderbook.clone();
        let safety = safety.clone();
        let drift = drift.clone();
        let syms = symbols.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                for symbol in &syms {
                    if let Some(book) = ob.get(symbol) {
                        let mid = (book.best_bid + book.best_ask) / 2.0;
                        if mid > 0.0 {
                            safety.liquidation_detector.record_trade(symbol, mid);
                            drift.on_price_tick(symbol, mid).await;
                        }
                    }
                }
            }
        });
    }

    // ── 3c. Broker user-data stream — feeds the heartbeat dead-man's switch
    // from real connectivity instead of leaving `record_beat` test-only.
    {
        let adapter = adapter.clone();
        let heartbeat = heartbeat.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = broker::binance::run_user_stream(adapter.clone(), heartbeat.clone()).await {
                    error!(error = %e, "user-data stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // ── 4. Event-bus durable writer ───────────────────────────────────────
    {
        let store = store.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => store.insert_event(&envelope),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "durable event writer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── 5. Retry queue drain loop ──────────────────────────────────────────
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETRY_DRAIN_INTERVAL);
            loop {
                interval.tick().await;
                store.drain_retry_queue();
            }
        });
    }

    // ── 6. Reconciliation loop ─────────────────────────────────────────────
    {
        let reconcile = reconcile.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                interval.tick().await;
                match reconcile.run_once().await {
                    Ok(Some(report)) if !report.mismatches.is_empty() => {
                        warn!(mismatches = report.mismatches.len(), "reconciliation found mismatches");
                        state.increment_version();
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "reconciliation pass failed"),
                }
            }
        });
    }

    // ── 7. Heartbeat dead-man's-switch loop ───────────────────────────────
    {
        let heartbeat = heartbeat.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Heartbeat::interval());
            loop {
                interval.tick().await;
                heartbeat.check().await;
                state.increment_version();
            }
        });
    }

    // ── 8. Derivatives-regime periodic refresh ────────────────────────────
    {
        let safety = safety.clone();
        let syms = symbols.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REGIME_REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                for symbol in &syms {
                    if let Err(e) = safety.derivatives_regime.refresh(symbol).await {
                        warn!(symbol = %symbol, error = %e, "derivatives regime refresh failed");
                    }
                }
            }
        });
    }

    // ── 9. Intent / trigger expiry sweep ───────────────────────────────────
    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(INTENT_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                pipeline.sweep_stale_triggers();
                pipeline.expire_stale_intents();
            }
        });
    }

    // ── 10. Durable backup loop ─────────────────────────────────────────────
    {
        let store = store.clone();
        let backup_dir = std::env::var("TITAN_BACKUP_DIR").unwrap_or_else(|_| ".".into());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BACKUP_INTERVAL);
            loop {
                interval.tick().await;
                let dest = format!(
                    "{backup_dir}/titan_core_{}.db.gz",
                    chrono::Utc::now().format("%Y%m%dT%H%M%S")
                );
                if let Err(e) = store.backup_gz(&dest) {
                    error!(error = %e, "durable store backup failed");
                } else {
                    info!(path = %dest, "durable store backup complete");
                }
            }
        });
    }

    // ── 11. Admin API server ────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("TITAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind admin api server");
        info!(addr = %bind_addr_clone, "admin api server listening");
        axum::serve(listener, app).await.expect("admin api server failed");
    });

    info!(
        account_mode = %config.public_config().account_mode,
        "all subsystems running. Press Ctrl+C to stop"
    );

    if matches!(config.public_config().account_mode, AccountMode::Live) {
        warn!("starting with account_mode=Live and trading_mode forced to Paused — resume is an explicit operator action");
    }

    // ── 12. Graceful shutdown ───────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = config.save() {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("titan core shut down complete.");
    Ok(())
}
