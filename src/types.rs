// =============================================================================
// Shared types used across the execution core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_direction(direction: i32) -> Option<Self> {
        match direction {
            1 => Some(Self::Long),
            -1 => Some(Self::Short),
            _ => None,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Wire-level intent type, matching the webhook vocabulary exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentType {
    #[serde(rename = "PREPARE")]
    Prepare,
    #[serde(rename = "CONFIRM")]
    Confirm,
    #[serde(rename = "ABORT")]
    Abort,
    #[serde(rename = "BUY_SETUP")]
    BuySetup,
    #[serde(rename = "SELL_SETUP")]
    SellSetup,
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "CLOSE_LONG")]
    CloseLong,
    #[serde(rename = "CLOSE_SHORT")]
    CloseShort,
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "EXIT")]
    Exit,
}

impl IntentType {
    /// Whether this type represents a closing / exit signal (forces
    /// `reduce_only=true` in the order manager).
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            Self::Close
                | Self::CloseLong
                | Self::CloseShort
                | Self::StopLoss
                | Self::TakeProfit
                | Self::Exit
        )
    }

    /// Infer the order side from the intent type, the signal's direction,
    /// and (for exits whose direction isn't fixed by the name) the side of
    /// the position actually open for the symbol. `StopLoss`/`TakeProfit`/
    /// `Close`/`Exit` close whichever side is open, so they resolve to the
    /// opposite of `open_side` when a position exists; direction is only a
    /// fallback for the no-position case.
    pub fn infer_side(self, direction: i32, open_side: Option<Side>) -> Option<Side> {
        match self {
            Self::BuySetup => Some(Side::Long),
            Self::SellSetup => Some(Side::Short),
            Self::CloseLong => Some(Side::Short),
            Self::CloseShort => Some(Side::Long),
            Self::StopLoss | Self::TakeProfit | Self::Close | Self::Exit => open_side
                .map(Side::opposite)
                .or_else(|| Side::from_direction(direction.signum())),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prepare => "PREPARE",
            Self::Confirm => "CONFIRM",
            Self::Abort => "ABORT",
            Self::BuySetup => "BUY_SETUP",
            Self::SellSetup => "SELL_SETUP",
            Self::Close => "CLOSE",
            Self::CloseLong => "CLOSE_LONG",
            Self::CloseShort => "CLOSE_SHORT",
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::Exit => "EXIT",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of an `Intent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Pending,
    Validated,
    Rejected,
    Executed,
    Expired,
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Validated => "VALIDATED",
            Self::Rejected => "REJECTED",
            Self::Executed => "EXECUTED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// Reason a closed position's `TradeRecord` was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Tp(u32),
    Sl,
    RegimeKill,
    Manual,
    ReconciliationFlatten,
    PanicFlattenAll,
    DeadMansSwitch,
    SafetyStop,
    HardKill,
    ApiClose,
    EmergencyFlatten,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tp(n) => write!(f, "TP{n}"),
            Self::Sl => write!(f, "SL"),
            Self::RegimeKill => write!(f, "REGIME_KILL"),
            Self::Manual => write!(f, "MANUAL"),
            Self::ReconciliationFlatten => write!(f, "RECONCILIATION_FLATTEN"),
            Self::PanicFlattenAll => write!(f, "PANIC_FLATTEN_ALL"),
            Self::DeadMansSwitch => write!(f, "DEAD_MANS_SWITCH"),
            Self::SafetyStop => write!(f, "SAFETY_STOP"),
            Self::HardKill => write!(f, "HARD_KILL"),
            Self::ApiClose => write!(f, "API_CLOSE"),
            Self::EmergencyFlatten => write!(f, "EMERGENCY_FLATTEN"),
        }
    }
}

/// Severity of a `SystemEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// A regime vector consumed from the (out-of-scope) regime-engine math
/// library. Treated as an opaque input; the core never computes these
/// fields itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeVector {
    pub regime_state: i32,
    pub market_structure_score: f64,
    pub momentum_score: f64,
    pub hurst: f64,
    pub entropy: f64,
    pub vpin: f64,
    pub model_recommendation: ModelRecommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRecommendation {
    TrendFollow,
    MeanRevert,
    NoTrade,
}

impl Default for ModelRecommendation {
    fn default() -> Self {
        Self::NoTrade
    }
}

/// Equity-tier-driven operating phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// KICKSTARTER — equity < $1000, scalp-only, risk 10%, no pyramiding, maker-only.
    One,
    /// TREND RIDER — equity >= $1000, day/swing, risk 5%, up to 4 pyramid layers, taker.
    Two,
}

impl Phase {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn max_pyramid_layers(self) -> u32 {
        match self {
            Self::One => 1,
            Self::Two => 4,
        }
    }

    pub fn risk_pct(self) -> f64 {
        match self {
            Self::One => 0.10,
            Self::Two => 0.05,
        }
    }

    pub fn allowed_signals(self) -> &'static [IntentType] {
        match self {
            Self::One => &[
                IntentType::BuySetup,
                IntentType::SellSetup,
                IntentType::Close,
                IntentType::CloseLong,
                IntentType::CloseShort,
                IntentType::StopLoss,
                IntentType::TakeProfit,
                IntentType::Exit,
            ],
            Self::Two => &[
                IntentType::BuySetup,
                IntentType::SellSetup,
                IntentType::Close,
                IntentType::CloseLong,
                IntentType::CloseShort,
                IntentType::StopLoss,
                IntentType::TakeProfit,
                IntentType::Exit,
                IntentType::Prepare,
                IntentType::Confirm,
                IntentType::Abort,
            ],
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}
