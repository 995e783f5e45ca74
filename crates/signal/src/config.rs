use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use common::{Error, Result};

/// Trading and risk parameters for signal generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Price value of one pip for the traded instrument.
    pub pip_size: Decimal,

    /// Stop-loss distance from entry, in pips.
    pub sl_buffer_pips: f64,
    /// TP1 as a fraction of the risk distance.
    pub tp1_pct: f64,
    /// TP2 as a fraction of the risk distance. The two must sum to 1.5.
    pub tp2_pct: f64,

    /// Account balance in the account currency.
    pub account_balance: f64,
    /// Percent of balance risked per trade.
    pub risk_per_trade_pct: f64,
    /// Signals below this R:R are dropped.
    pub min_risk_reward: f64,

    /// Position size floor, in lots.
    pub default_lot: f64,
    /// Position size ceiling, in lots.
    pub max_lot: f64,
    /// Lot granularity for rounding.
    pub lot_step: f64,

    pub signal_expiry_minutes: i64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            pip_size: dec!(0.1),
            sl_buffer_pips: 5.0,
            tp1_pct: 0.5,
            tp2_pct: 1.0,
            account_balance: 10_000.0,
            risk_per_trade_pct: 1.0,
            min_risk_reward: 1.0,
            default_lot: 0.01,
            max_lot: 1.0,
            lot_step: 0.01,
            signal_expiry_minutes: 240,
        }
    }
}

const TP_SPLIT_SUM: f64 = 1.5;
const TP_SPLIT_TOLERANCE: f64 = 1e-9;

impl TradingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pip_size <= Decimal::ZERO {
            return Err(Error::Config("pip_size must be positive".into()));
        }
        if self.sl_buffer_pips <= 0.0 {
            return Err(Error::Config("sl_buffer_pips must be positive".into()));
        }
        let tp_sum = self.tp1_pct + self.tp2_pct;
        if (tp_sum - TP_SPLIT_SUM).abs() > TP_SPLIT_TOLERANCE {
            return Err(Error::Config(format!(
                "tp1_pct + tp2_pct must equal {TP_SPLIT_SUM}, got {tp_sum}"
            )));
        }
        if self.account_balance <= 0.0 {
            return Err(Error::Config("account_balance must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.risk_per_trade_pct) || self.risk_per_trade_pct == 0.0 {
            return Err(Error::Config(format!(
                "risk_per_trade_pct must be within (0, 100], got {}",
                self.risk_per_trade_pct
            )));
        }
        if self.min_risk_reward < 1.0 {
            return Err(Error::Config(format!(
                "min_risk_reward must be at least 1, got {}",
                self.min_risk_reward
            )));
        }
        if self.lot_step <= 0.0 || self.default_lot <= 0.0 || self.max_lot <= 0.0 {
            return Err(Error::Config("lot sizes must be positive".into()));
        }
        if self.default_lot > self.max_lot {
            return Err(Error::Config(format!(
                "default_lot {} exceeds max_lot {}",
                self.default_lot, self.max_lot
            )));
        }
        if self.signal_expiry_minutes <= 0 {
            return Err(Error::Config("signal_expiry_minutes must be positive".into()));
        }
        Ok(())
    }

    /// Currency amount at risk per trade.
    pub fn risk_amount(&self) -> f64 {
        self.account_balance * self.risk_per_trade_pct / 100.0
    }

    /// Load and validate from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TradingConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse '{path}': {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TradingConfig::default().validate().is_ok());
    }

    #[test]
    fn tp_split_must_sum_to_three_halves() {
        let cfg = TradingConfig { tp1_pct: 0.6, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = TradingConfig { tp1_pct: 0.75, tp2_pct: 0.75, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn min_risk_reward_below_one_fails() {
        let cfg = TradingConfig { min_risk_reward: 0.5, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_lot_above_max_fails() {
        let cfg = TradingConfig { default_lot: 2.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn risk_amount_is_pct_of_balance() {
        let cfg = TradingConfig::default();
        assert!((cfg.risk_amount() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_round_trip_preserves_defaults() {
        let cfg = TradingConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: TradingConfig = toml::from_str(&text).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.pip_size, cfg.pip_size);
    }
}
