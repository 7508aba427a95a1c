// =============================================================================
// Circuit Breaker — four limits protecting capital
//
// Same four breakers as the risk engine this generalizes (daily loss,
// consecutive losses, max drawdown, trade limit), but trip reasons are now
// the machine-readable `circuit_breaker_<cause>` strings the pipeline's
// safety-gate stage matches on, rather than free-form human sentences.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub daily_trades_count: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub max_drawdown_today: f64,
    pub peak_equity_today: f64,
    pub breakers: Vec<BreakerInfo>,
    pub current_date: String,
}

struct Inner {
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
    max_drawdown_today: f64,
    peak_equity_today: f64,
    current_date: String,
    killed: bool,
}

pub struct CircuitBreaker {
    state: RwLock<Inner>,
    capital: f64,
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
    max_drawdown_pct: f64,
    max_daily_trades: u32,
}

impl CircuitBreaker {
    pub fn new(
        capital: f64,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        max_drawdown_pct: f64,
        max_daily_trades: u32,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
            "circuit breaker initialised"
        );
        Self {
            state: RwLock::new(Inner {
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
                max_drawdown_today: 0.0,
                peak_equity_today: capital,
                current_date: today,
                killed: false,
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
        }
    }

    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;
        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }

        let current_equity = self.capital + s.daily_pnl;
        if current_equity > s.peak_equity_today {
            s.peak_equity_today = current_equity;
        }
        let drawdown = if s.peak_equity_today > 0.0 {
            (s.peak_equity_today - current_equity) / s.peak_equity_today
        } else {
            0.0
        };
        if drawdown > s.max_drawdown_today {
            s.max_drawdown_today = drawdown;
        }

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            "trade result recorded"
        );
    }

    /// Returns `Ok(())` if trading is allowed, or the tripped breaker's
    /// `circuit_breaker_<cause>` reason string.
    pub fn check(&self) -> Result<(), String> {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return Err("circuit_breaker_killed".to_string());
        }

        let daily_loss_pct = if self.capital > 0.0 {
            (-s.daily_pnl) / self.capital
        } else {
            0.0
        };
        if daily_loss_pct >= self.max_daily_loss_pct {
            warn!(daily_loss_pct, "daily loss breaker tripped");
            return Err("circuit_breaker_daily_loss".to_string());
        }
        if s.consecutive_losses >= self.max_consecutive_losses {
            warn!(consecutive_losses = s.consecutive_losses, "consecutive losses breaker tripped");
            return Err("circuit_breaker_consecutive_losses".to_string());
        }
        if s.max_drawdown_today >= self.max_drawdown_pct {
            warn!(drawdown = s.max_drawdown_today, "max drawdown breaker tripped");
            return Err("circuit_breaker_max_drawdown".to_string());
        }
        if s.daily_trades_count >= self.max_daily_trades {
            warn!(trades = s.daily_trades_count, "trade limit breaker tripped");
            return Err("circuit_breaker_trade_limit".to_string());
        }

        Ok(())
    }

    pub fn get_state(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();
        let daily_pnl_pct = if self.capital > 0.0 {
            (s.daily_pnl / self.capital) * 100.0
        } else {
            0.0
        };
        RiskState {
            risk_mode: self.risk_mode_label(&s),
            daily_pnl: s.daily_pnl,
            daily_pnl_pct,
            consecutive_losses: s.consecutive_losses,
            daily_trades_count: s.daily_trades_count,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            max_drawdown_today: s.max_drawdown_today,
            peak_equity_today: s.peak_equity_today,
            breakers: self.build_breaker_info(&s),
            current_date: s.current_date.clone(),
        }
    }

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today, self.capital);
        info!(date = %today, "daily circuit breaker counters reset");
    }

    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        warn!("circuit breaker kill switch activated");
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled");
            Self::do_reset(&mut s, &today, self.capital);
        }
    }

    fn do_reset(s: &mut Inner, date: &str, capital: f64) {
        s.daily_pnl = 0.0;
        s.consecutive_losses = 0;
        s.daily_trades_count = 0;
        s.daily_wins = 0;
        s.daily_losses = 0;
        s.max_drawdown_today = 0.0;
        s.peak_equity_today = capital;
        s.current_date = date.to_string();
    }

    fn risk_mode_label(&self, s: &Inner) -> String {
        if s.killed {
            return "KILLED".to_string();
        }
        let daily_loss_pct = if self.capital > 0.0 {
            (-s.daily_pnl) / self.capital
        } else {
            0.0
        };
        if daily_loss_pct >= self.max_daily_loss_pct
            || s.consecutive_losses >= self.max_consecutive_losses
            || s.max_drawdown_today >= self.max_drawdown_pct
            || s.daily_trades_count >= self.max_daily_trades
        {
            "BREAKER_TRIPPED".to_string()
        } else if daily_loss_pct >= self.max_daily_loss_pct * 0.75
            || s.consecutive_losses as f64 >= self.max_consecutive_losses as f64 * 0.75
        {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        }
    }

    fn build_breaker_info(&self, s: &Inner) -> Vec<BreakerInfo> {
        let daily_loss_pct = if self.capital > 0.0 {
            ((-s.daily_pnl) / self.capital) * 100.0
        } else {
            0.0
        };
        vec![
            BreakerInfo {
                name: "daily_loss".into(),
                current: daily_loss_pct.max(0.0),
                limit: self.max_daily_loss_pct * 100.0,
                tripped: daily_loss_pct >= self.max_daily_loss_pct * 100.0,
            },
            BreakerInfo {
                name: "consecutive_losses".into(),
                current: s.consecutive_losses as f64,
                limit: self.max_consecutive_losses as f64,
                tripped: s.consecutive_losses >= self.max_consecutive_losses,
            },
            BreakerInfo {
                name: "max_drawdown".into(),
                current: s.max_drawdown_today * 100.0,
                limit: self.max_drawdown_pct * 100.0,
                tripped: s.max_drawdown_today >= self.max_drawdown_pct,
            },
            BreakerInfo {
                name: "trade_limit".into(),
                current: s.daily_trades_count as f64,
                limit: self.max_daily_trades as f64,
                tripped: s.daily_trades_count >= self.max_daily_trades,
            },
        ]
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_consecutive_losses() {
        let cb = CircuitBreaker::new(1000.0, 0.5, 3, 0.5, 100);
        cb.record_trade_result(-1.0);
        cb.record_trade_result(-1.0);
        cb.record_trade_result(-1.0);
        let err = cb.check().unwrap_err();
        assert_eq!(err, "circuit_breaker_consecutive_losses");
    }

    #[test]
    fn trips_on_daily_loss_pct() {
        let cb = CircuitBreaker::new(1000.0, 0.03, 10, 0.5, 100);
        cb.record_trade_result(-40.0);
        let err = cb.check().unwrap_err();
        assert_eq!(err, "circuit_breaker_daily_loss");
    }

    #[test]
    fn wins_reset_consecutive_loss_counter() {
        let cb = CircuitBreaker::new(1000.0, 0.5, 3, 0.5, 100);
        cb.record_trade_result(-1.0);
        cb.record_trade_result(-1.0);
        cb.record_trade_result(5.0);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn kill_switch_blocks_trading() {
        let cb = CircuitBreaker::new(1000.0, 0.5, 10, 0.5, 100);
        cb.kill();
        assert_eq!(cb.check().unwrap_err(), "circuit_breaker_killed");
    }
}
