// =============================================================================
// Config Manager — hot-reloadable engine settings with atomic save
//
// Generalizes the runtime config hub: same atomic tmp+rename persistence
// and `#[serde(default)]`-everywhere forward-compatibility, now carrying
// the per-phase risk tuner, the asset whitelist, and the broker
// credentials. Credentials are `#[serde(skip_serializing)]` so a
// `get_public_config()` snapshot can never leak them, the same way the
// broker adapters redact their `Debug` impls.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::event_bus::{EventBus, SystemEvent};
use crate::types::{AccountMode, TradingMode};

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_max_risk_pct() -> f64 {
    0.10
}

fn default_phase1_risk_pct() -> f64 {
    0.10
}

fn default_phase2_risk_pct() -> f64 {
    0.05
}

fn default_maker_fee_pct() -> f64 {
    0.0002
}

fn default_taker_fee_pct() -> f64 {
    0.0006
}

fn default_rate_limit_per_sec() -> u32 {
    12
}

fn default_database_type() -> String {
    "sqlite".to_string()
}

fn default_max_consecutive_mismatches() -> u32 {
    3
}

fn default_heartbeat_max_misses() -> u32 {
    3
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub broker_api_key: String,
    #[serde(default, skip_serializing)]
    pub broker_api_secret: String,
    #[serde(default, skip_serializing)]
    pub hmac_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("broker_api_key", &"<redacted>")
            .field("broker_api_secret", &"<redacted>")
            .field("hmac_secret", &"<redacted>")
            .finish()
    }
}

/// Public, serializable configuration. `credentials` is never included in
/// a `getConfig`-style response — callers reach it only through
/// `EngineConfig::credentials()`, never through serialization.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,
    #[serde(default = "default_true")]
    pub auto_exec_enabled: bool,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub symbol_whitelist: HashMap<String, bool>,
    #[serde(default = "default_max_risk_pct")]
    pub max_risk_pct: f64,
    #[serde(default = "default_phase1_risk_pct")]
    pub phase1_risk_pct: f64,
    #[serde(default = "default_phase2_risk_pct")]
    pub phase2_risk_pct: f64,
    #[serde(default = "default_maker_fee_pct")]
    pub maker_fee_pct: f64,
    #[serde(default = "default_taker_fee_pct")]
    pub taker_fee_pct: f64,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "default_database_type")]
    pub database_type: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_max_consecutive_mismatches")]
    pub max_consecutive_mismatches: u32,
    #[serde(default = "default_heartbeat_max_misses")]
    pub heartbeat_max_misses: u32,
    #[serde(default, skip_serializing)]
    pub credentials: Credentials,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            auto_exec_enabled: true,
            symbols: default_symbols(),
            symbol_whitelist: HashMap::new(),
            max_risk_pct: default_max_risk_pct(),
            phase1_risk_pct: default_phase1_risk_pct(),
            phase2_risk_pct: default_phase2_risk_pct(),
            maker_fee_pct: default_maker_fee_pct(),
            taker_fee_pct: default_taker_fee_pct(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            database_type: default_database_type(),
            database_url: String::new(),
            max_consecutive_mismatches: default_max_consecutive_mismatches(),
            heartbeat_max_misses: default_heartbeat_max_misses(),
            credentials: Credentials::default(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            broker_api_key: String::new(),
            broker_api_secret: String::new(),
            hmac_secret: String::new(),
        }
    }
}

impl EngineConfig {
    /// Whether `symbol` is enabled, requiring both the master flag and the
    /// per-symbol whitelist entry (defaulting to enabled when the symbol
    /// has no explicit entry).
    pub fn symbol_enabled(&self, symbol: &str) -> bool {
        self.auto_exec_enabled && *self.symbol_whitelist.get(symbol).unwrap_or(&true)
    }

    /// Check the master kill-switch and the per-symbol whitelist as two
    /// distinct gates, each with its own rejection reason, rather than
    /// collapsing both into one boolean.
    pub fn check_symbol_gate(&self, symbol: &str) -> Result<(), &'static str> {
        if !self.auto_exec_enabled {
            return Err("auto_exec_disabled");
        }
        if !*self.symbol_whitelist.get(symbol).unwrap_or(&true) {
            return Err("asset_disabled");
        }
        Ok(())
    }

    pub fn risk_pct_for_phase(&self, phase: crate::types::Phase) -> f64 {
        match phase {
            crate::types::Phase::One => self.phase1_risk_pct,
            crate::types::Phase::Two => self.phase2_risk_pct,
        }
        .min(self.max_risk_pct)
    }
}

pub struct ConfigManager {
    state: RwLock<EngineConfig>,
    path: PathBuf,
    events: std::sync::Arc<EventBus>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>, events: std::sync::Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(EngineConfig::default()),
            path: path.into(),
            events,
        }
    }

    pub fn load(path: impl Into<PathBuf>, events: std::sync::Arc<EventBus>) -> Self {
        let path = path.into();
        let state = match Self::load_from_disk(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                info!(error = %err, "no existing config found, starting from defaults");
                EngineConfig::default()
            }
        };
        Self {
            state: RwLock::new(state),
            path,
            events,
        }
    }

    fn load_from_disk(path: &Path) -> Result<EngineConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = {
            let state = self.state.read();
            serde_json::to_string_pretty(&*state).context("failed to serialise config")?
        };
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp config to {}", self.path.display()))?;
        info!(path = %self.path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Snapshot safe to expose through the admin API — credentials are
    /// never serialized onto this struct regardless of caller intent.
    pub fn public_config(&self) -> EngineConfig {
        self.state.read().clone()
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        self.state.write().trading_mode = mode;
        self.events.publish(SystemEvent::ConfigUpdated {
            field: "trading_mode".into(),
        });
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.state.read().trading_mode
    }

    pub fn set_auto_exec(&self, enabled: bool) {
        self.state.write().auto_exec_enabled = enabled;
        self.events.publish(SystemEvent::ConfigUpdated {
            field: "auto_exec_enabled".into(),
        });
    }

    pub fn set_symbol_enabled(&self, symbol: &str, enabled: bool) {
        self.state
            .write()
            .symbol_whitelist
            .insert(symbol.to_string(), enabled);
        self.events.publish(SystemEvent::ConfigUpdated {
            field: format!("symbol_whitelist.{symbol}"),
        });
    }

    /// The caller is expected to have already confirmed the credentials
    /// authenticate (e.g. via `BinanceAdapter::test_connection`) before
    /// calling this — the config manager itself does not reach out over
    /// the network.
    pub fn set_credentials(&self, api_key: String, api_secret: String) {
        let mut state = self.state.write();
        state.credentials.broker_api_key = api_key;
        state.credentials.broker_api_secret = api_secret;
        drop(state);
        self.events.publish(SystemEvent::ConfigUpdated {
            field: "credentials".into(),
        });
    }

    pub fn credentials(&self) -> Credentials {
        self.state.read().credentials.clone()
    }

    pub fn set_hmac_secret(&self, secret: String) {
        self.state.write().credentials.hmac_secret = secret;
        self.events.publish(SystemEvent::ConfigUpdated {
            field: "credentials.hmac_secret".into(),
        });
    }

    /// Seeds the env-validated startup parameters onto the loaded config.
    /// These are authoritative per deployment (validated at process start,
    /// per §6's environment variable table) and override whatever a stale
    /// on-disk config carries.
    #[allow(clippy::too_many_arguments)]
    pub fn seed_startup_params(
        &self,
        max_risk_pct: f64,
        phase1_risk_pct: f64,
        phase2_risk_pct: f64,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
        rate_limit_per_sec: u32,
        database_type: String,
        database_url: String,
    ) {
        let mut state = self.state.write();
        state.max_risk_pct = max_risk_pct;
        state.phase1_risk_pct = phase1_risk_pct;
        state.phase2_risk_pct = phase2_risk_pct;
        state.maker_fee_pct = maker_fee_pct;
        state.taker_fee_pct = taker_fee_pct;
        state.rate_limit_per_sec = rate_limit_per_sec;
        state.database_type = database_type;
        state.database_url = database_url;
    }

    pub fn symbol_enabled(&self, symbol: &str) -> bool {
        self.state.read().symbol_enabled(symbol)
    }

    pub fn check_symbol_gate(&self, symbol: &str) -> Result<(), &'static str> {
        self.state.read().check_symbol_gate(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager() -> ConfigManager {
        ConfigManager::new("/tmp/titan-core-test-config.json", Arc::new(EventBus::new()))
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert!(cfg.auto_exec_enabled);
        assert!((cfg.phase1_risk_pct - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn credentials_never_serialize() {
        let mut cfg = EngineConfig::default();
        cfg.credentials.broker_api_key = "key123".into();
        cfg.credentials.broker_api_secret = "secret456".into();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret456"));
        assert!(!json.contains("credentials"));
    }

    #[test]
    fn symbol_whitelist_requires_both_master_and_entry() {
        let manager = manager();
        manager.set_auto_exec(true);
        manager.set_symbol_enabled("BTCUSDT", false);
        assert!(!manager.symbol_enabled("BTCUSDT"));
        assert!(manager.symbol_enabled("ETHUSDT"));

        manager.set_auto_exec(false);
        manager.set_symbol_enabled("ETHUSDT", true);
        assert!(!manager.symbol_enabled("ETHUSDT"));
    }

    #[test]
    fn symbol_gate_distinguishes_kill_switch_from_whitelist() {
        let manager = manager();
        manager.set_auto_exec(false);
        assert_eq!(
            manager.check_symbol_gate("BTCUSDT").unwrap_err(),
            "auto_exec_disabled"
        );

        manager.set_auto_exec(true);
        manager.set_symbol_enabled("BTCUSDT", false);
        assert_eq!(
            manager.check_symbol_gate("BTCUSDT").unwrap_err(),
            "asset_disabled"
        );

        assert!(manager.check_symbol_gate("ETHUSDT").is_ok());
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.rate_limit_per_sec, 12);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = std::env::temp_dir().join(format!("titan-core-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let manager = ConfigManager::new(&path, Arc::new(EventBus::new()));
        manager.set_auto_exec(false);
        manager.save().unwrap();

        let reloaded = ConfigManager::load(&path, Arc::new(EventBus::new()));
        assert!(!reloaded.public_config().auto_exec_enabled);
        std::fs::remove_dir_all(&dir).ok();
    }
}
