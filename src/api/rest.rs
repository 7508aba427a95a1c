// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints require a valid Bearer token via the `AuthBearer`
// extractor, except `/healthz` (liveness probe, no auth) and `/webhook`
// (signature-authenticated, mounted separately). CORS is configured
// permissively; tighten `allowed_origins` for a production deployment.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::api::webhook::webhook_handler;
use crate::app_state::AppState;
use crate::types::TradingMode;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook_handler))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/status", get(status))
        .route("/api/config", get(get_config))
        .route("/api/config", post(set_config))
        .route("/api/positions/active", get(active_positions))
        .route("/api/trades", get(trade_history))
        .route("/api/performance/summary", get(performance_summary))
        .route("/api/auto-exec/enable", post(auto_exec_enable))
        .route("/api/auto-exec/disable", post(auto_exec_disable))
        .route("/api/emergency-flatten", post(emergency_flatten))
        .route("/api/emergency-cancel", post(emergency_cancel))
        .route("/api/test-connection", post(test_connection))
        .route("/api/status/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn get_config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.public_config())
}

#[derive(Deserialize)]
struct ConfigUpdateRequest {
    #[serde(default)]
    symbol_enabled: Option<SymbolEnabledUpdate>,
    #[serde(default)]
    trading_mode: Option<String>,
}

#[derive(Deserialize)]
struct SymbolEnabledUpdate {
    symbol: String,
    enabled: bool,
}

async fn set_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfigUpdateRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if let Some(update) = req.symbol_enabled {
        state
            .config
            .set_symbol_enabled(&update.symbol, update.enabled);
    }
    if let Some(mode) = req.trading_mode {
        let parsed = match mode.to_lowercase().as_str() {
            "live" => TradingMode::Live,
            "paused" => TradingMode::Paused,
            "killed" => TradingMode::Killed,
            other => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("invalid trading_mode: '{other}'") })),
                ))
            }
        };
        state.config.set_trading_mode(parsed);
        info!(trading_mode = %mode, "trading mode changed via api");
    }
    state.increment_version();
    Ok(Json(state.config.public_config()))
}

async fn active_positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.shadow.get_all_positions())
}

#[derive(Deserialize)]
struct TradeHistoryQuery {
    #[serde(default = "default_trade_limit")]
    limit: usize,
}

fn default_trade_limit() -> usize {
    100
}

async fn trade_history(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<TradeHistoryQuery>,
) -> impl IntoResponse {
    Json(state.shadow.recent_trades(query.limit))
}

#[derive(Serialize)]
struct PerformanceSummary {
    total_trades: usize,
    win_rate: f64,
    total_net_pnl: f64,
    profit_factor: f64,
}

async fn performance_summary(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let trades = state.shadow.recent_trades(usize::MAX);
    let total_trades = trades.len();
    if total_trades == 0 {
        return Json(PerformanceSummary {
            total_trades: 0,
            win_rate: 0.0,
            total_net_pnl: 0.0,
            profit_factor: 0.0,
        });
    }
    let wins = trades.iter().filter(|t| t.realized_pnl > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let total_net_pnl: f64 = trades.iter().map(|t| t.realized_pnl).sum();
    let gross_profit: f64 = trades
        .iter()
        .map(|t| t.realized_pnl)
        .filter(|&p| p > 0.0)
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .map(|t| t.realized_pnl)
        .filter(|&p| p < 0.0)
        .map(f64::abs)
        .sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    Json(PerformanceSummary {
        total_trades,
        win_rate,
        total_net_pnl,
        profit_factor,
    })
}

async fn auto_exec_enable(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.config.set_auto_exec(true);
    state.increment_version();
    info!("auto-execution enabled via api");
    Json(serde_json::json!({ "auto_exec_enabled": true }))
}

async fn auto_exec_disable(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.config.set_auto_exec(false);
    state.increment_version();
    warn!("auto-execution disabled via api");
    Json(serde_json::json!({ "auto_exec_enabled": false }))
}

#[derive(Deserialize)]
struct OperatorRequest {
    operator_id: String,
}

async fn emergency_flatten(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<OperatorRequest>,
) -> impl IntoResponse {
    let log = state.panic_controls.flatten_all(&req.operator_id).await;
    state.increment_version();
    Json(log)
}

async fn emergency_cancel(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<OperatorRequest>,
) -> impl IntoResponse {
    let log = state.panic_controls.cancel_all(&req.operator_id).await;
    state.increment_version();
    Json(log)
}

async fn test_connection(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.broker.get_open_positions().await {
        Ok(_) => Json(serde_json::json!({
            "connected": true,
            "adapter": state.broker.adapter_name(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "connected": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}
