// End-to-end scenario coverage driving the pipeline the way a webhook
// signal would, without going over HTTP. Each test builds its own set of
// subsystems so scenarios never share mutable state.

use std::sync::Arc;
use std::time::Duration;

use titan_core::broker::paper::PaperAdapter;
use titan_core::broker::{BrokerGateway, RetryConfig};
use titan_core::config_manager::ConfigManager;
use titan_core::drift::DriftGuard;
use titan_core::event_bus::{EventBus, SystemEvent};
use titan_core::l2_validator::CRYPTO_PRESET;
use titan_core::market_data::orderbook::OrderBookManager;
use titan_core::phase_manager::PhaseManager;
use titan_core::pipeline::{IncomingSignal, IntentPipeline};
use titan_core::reconcile::ReconciliationEngine;
use titan_core::safety::derivatives_regime::DerivativesRegimeGate;
use titan_core::safety::SafetyGates;
use titan_core::shadow_state::ShadowState;
use titan_core::store::DurableStore;
use titan_core::types::{IntentStatus, IntentType, Side};

struct Harness {
    pipeline: IntentPipeline,
    shadow: Arc<ShadowState>,
    config: Arc<ConfigManager>,
    safety: Arc<SafetyGates>,
    orderbook: Arc<OrderBookManager>,
    broker: Arc<BrokerGateway>,
    events: Arc<EventBus>,
}

fn harness() -> Harness {
    let events = Arc::new(EventBus::new());
    let shadow = Arc::new(ShadowState::new(events.clone()));
    let safety = Arc::new(SafetyGates::new(1000.0, 0.5, 10, 0.5, 100, 12));
    let config = Arc::new(ConfigManager::new(
        "/tmp/titan-core-scenarios-test.json",
        events.clone(),
    ));
    let phase_manager = Arc::new(PhaseManager::new(events.clone()));
    let broker = Arc::new(BrokerGateway::new(
        Arc::new(PaperAdapter::new()),
        RetryConfig::default(),
    ));
    let orderbook = Arc::new(OrderBookManager::new());
    orderbook.update_levels(
        "BTCUSDT",
        vec![(50000.0, 10.0), (49990.0, 10.0)],
        vec![(50010.0, 10.0), (50020.0, 10.0)],
        1,
    );
    let drift = Arc::new(DriftGuard::new(
        shadow.clone(),
        broker.clone(),
        config.clone(),
        events.clone(),
    ));
    // Phase 2 (TREND RIDER) for every scenario that needs pyramiding headroom.
    phase_manager.update_equity(Some(1500.0));
    let pipeline = IntentPipeline::new(
        shadow.clone(),
        safety.clone(),
        config.clone(),
        phase_manager,
        broker.clone(),
        orderbook.clone(),
        events.clone(),
        drift,
        CRYPTO_PRESET.clone(),
    );
    Harness {
        pipeline,
        shadow,
        config,
        safety,
        orderbook,
        broker,
        events,
    }
}

fn buy_setup_signal() -> IncomingSignal {
    IncomingSignal {
        signal_id: "S1".into(),
        symbol: "BTCUSDT".into(),
        intent_type: IntentType::BuySetup,
        direction: 1,
        reference_price: 50000.0,
        quantity: Some(0.5),
        stop_loss: 49000.0,
        take_profits: vec![51000.0],
        structure_score: 75.0,
        momentum_score: 10.0,
    }
}

/// Scenario 1 — Happy open: a whitelisted symbol in phase 2 with every
/// safety gate green and a fresh, healthy L2 book opens exactly one
/// position at the signal's reference price.
#[tokio::test]
async fn happy_open() {
    let h = harness();
    let outcome = h.pipeline.process(buy_setup_signal()).await;

    assert_eq!(outcome.status, IntentStatus::Executed);

    let positions = h.shadow.get_all_positions();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, "BTCUSDT");
    assert_eq!(positions[0].side, Side::Long);
    assert_eq!(positions[0].quantity, 0.5);
    assert_eq!(positions[0].entry_price, 50000.0);
    assert_eq!(positions[0].signal_id, "S1");
}

/// Scenario 2 — Idempotent duplicate: the same signal_id submitted twice
/// reaches the broker adapter exactly once; the second call replays the
/// cached fill (same order id) rather than placing a new order.
#[tokio::test]
async fn idempotent_duplicate() {
    let h = harness();
    let order = titan_core::broker::OrderParams {
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        order_type: titan_core::broker::OrderType::Limit,
        quantity: 0.5,
        price: Some(50000.0),
        client_order_id: "titan_BTCUSDT_LONG_test".into(),
        reduce_only: false,
    };

    let first = h.broker.execute("S1", order.clone()).await.unwrap();
    let second = h.broker.execute("S1", order).await.unwrap();
    assert_eq!(first.exchange_order_id, second.exchange_order_id);
    assert_eq!(first.client_order_id, second.client_order_id);

    // Driving the full pipeline twice with the same signal_id must not
    // error or place a second real order either — the second pass resolves
    // through the same idempotency cache inside the gateway.
    let h2 = harness();
    let first_outcome = h2.pipeline.process(buy_setup_signal()).await;
    let second_outcome = h2.pipeline.process(buy_setup_signal()).await;
    assert_eq!(first_outcome.status, IntentStatus::Executed);
    assert_eq!(second_outcome.status, IntentStatus::Executed);
    assert!(h2.broker.check_idempotent("S1").is_some());
}

/// Scenario 3 — L2 veto on stale cache: once the cached order book is
/// older than the crypto preset's max_cache_age_ms (100 ms), the L2
/// validator rejects before any broker call and no position is opened.
#[tokio::test]
async fn l2_veto_on_stale_cache() {
    let h = harness();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = h.pipeline.process(buy_setup_signal()).await;

    assert_eq!(outcome.status, IntentStatus::Rejected);
    assert_eq!(outcome.reason.as_deref(), Some("l2_stale_cache"));
    assert!(h.shadow.get_all_positions().is_empty());
    assert!(h.broker.check_idempotent("S1").is_none());
}

/// Scenario 4 — Reconciliation flatten: a shadow position with no broker
/// counterpart for three consecutive reconciliation passes trips the
/// emergency flatten, disables auto-execution, and empties shadow state.
/// The fired event's severity is CRITICAL, matching the `system_events`
/// row the durable writer persists from it.
#[tokio::test]
async fn reconciliation_flatten() {
    let h = harness();
    h.shadow
        .confirm_execution(
            "BTCUSDT",
            Side::Long,
            50000.0,
            0.5,
            49000.0,
            vec![51000.0],
            4,
            "S-seed",
            "NEUTRAL",
            2,
        )
        .unwrap();

    let reconcile = ReconciliationEngine::new(
        h.shadow.clone(),
        h.broker.clone(),
        h.config.clone(),
        h.events.clone(),
        3,
    );
    let mut events_rx = h.events.subscribe();

    let first = reconcile.run_once().await.unwrap().unwrap();
    assert!(!first.emergency_flatten_triggered);
    let second = reconcile.run_once().await.unwrap().unwrap();
    assert!(!second.emergency_flatten_triggered);
    let third = reconcile.run_once().await.unwrap().unwrap();
    assert!(third.emergency_flatten_triggered);

    assert!(!h.config.public_config().auto_exec_enabled);
    assert!(h.shadow.get_all_positions().is_empty());

    let mut saw_critical_flatten = false;
    while let Ok(envelope) = events_rx.try_recv() {
        if let SystemEvent::ReconciliationFlatten { .. } = envelope.event {
            assert_eq!(envelope.event.severity(), titan_core::types::Severity::Critical);
            saw_critical_flatten = true;
        }
    }
    assert!(saw_critical_flatten, "expected a ReconciliationFlatten event on the bus");
}

/// Scenario 5 — Client-side trigger: a PREPARE arms the trigger for its
/// symbol and side; the matching CONFIRM fires it and executes. A second
/// CONFIRM with nothing armed is rejected rather than silently re-firing.
#[tokio::test]
async fn client_side_trigger_prepare_then_confirm() {
    let h = harness();

    let mut prepare = buy_setup_signal();
    prepare.signal_id = "S2".into();
    prepare.intent_type = IntentType::Prepare;
    let prepare_outcome = h.pipeline.process(prepare).await;
    // PREPARE only arms the trigger; nothing executes yet.
    assert_eq!(prepare_outcome.status, IntentStatus::Executed);
    assert!(h.shadow.get_all_positions().is_empty());

    let mut confirm = buy_setup_signal();
    confirm.signal_id = "S2-confirm".into();
    confirm.intent_type = IntentType::Confirm;
    let confirm_outcome = h.pipeline.process(confirm).await;
    assert_eq!(confirm_outcome.status, IntentStatus::Executed);
    assert_eq!(h.shadow.get_all_positions().len(), 1);

    // A second CONFIRM with no trigger re-armed is rejected outright — the
    // pipeline's equivalent of flagging an already-fired trigger.
    let mut stray_confirm = buy_setup_signal();
    stray_confirm.signal_id = "S2-confirm-2".into();
    stray_confirm.intent_type = IntentType::Confirm;
    let stray_outcome = h.pipeline.process(stray_confirm).await;
    assert_eq!(stray_outcome.status, IntentStatus::Rejected);
    assert_eq!(
        stray_outcome.reason.as_deref(),
        Some("client_side_trigger_no_armed_prepare")
    );
}

/// Scenario 6 — Risk-off veto: an extreme-greed funding regime blocks a
/// BUY_SETUP long and reduces size for the opposite side rather than
/// blocking it outright.
#[tokio::test]
async fn risk_off_veto_blocks_long_and_shrinks_short() {
    let h = harness();
    h.safety
        .derivatives_regime
        .seed_cache(DerivativesRegimeGate::classify_rate("BTCUSDT", 0.0011));

    let long_outcome = h.pipeline.process(buy_setup_signal()).await;
    assert_eq!(long_outcome.status, IntentStatus::Rejected);
    let reason = long_outcome.reason.unwrap();
    assert!(
        reason.contains("derivatives_regime_EXTREME_GREED"),
        "expected regime veto reason, got {reason}"
    );
    assert!(h.shadow.get_all_positions().is_empty());

    let mut sell = buy_setup_signal();
    sell.signal_id = "S1-sell".into();
    sell.intent_type = IntentType::SellSetup;
    sell.direction = -1;
    sell.stop_loss = 51000.0;
    sell.take_profits = vec![49000.0];
    let sell_outcome = h.pipeline.process(sell).await;
    assert_eq!(sell_outcome.status, IntentStatus::Executed);

    let positions = h.shadow.get_all_positions();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, Side::Short);
    // size_multiplier of 0.25 applied against the requested 0.5 quantity.
    assert_eq!(positions[0].quantity, 0.125);
}

/// Cross-cutting: a backup/restore round trip of the durable store
/// preserves row counts and passes schema verification, independent of
/// any particular scenario above.
#[tokio::test]
async fn store_backup_restore_round_trip() {
    let events = Arc::new(EventBus::new());
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("scenario_store.db");
    let store = DurableStore::open(&db_path, events.clone()).unwrap();

    store.upsert_position(&titan_core::shadow_state::Position {
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        entry_price: 50000.0,
        quantity: 0.5,
        current_price: 50000.0,
        unrealized_pnl: 0.0,
        unrealized_pnl_pct: 0.0,
        stop_loss: 49000.0,
        take_profits: vec![51000.0],
        trailing_stop: None,
        extreme_price: 50000.0,
        pyramid_layers: 1,
        opened_at: chrono::Utc::now(),
        realized_pnl: 0.0,
        signal_id: "S1".into(),
        regime_state: "NEUTRAL".into(),
        phase: 2,
    });

    let backup_path = dir.path().join("scenario_store_backup.db.gz");
    store.backup_gz(&backup_path).unwrap();

    let restored_path = dir.path().join("scenario_store_restored.db");
    let restored = DurableStore::restore_gz(&restored_path, &backup_path, events).unwrap();
    let recovered = restored.recover_open_positions().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].symbol, "BTCUSDT");
}
