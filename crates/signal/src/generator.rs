//! Converts a confluence analysis into an actionable trade signal.
//!
//! The generator is the gate between analysis and execution: anything below
//! the confluence threshold, without a directional majority, or below the
//! minimum risk:reward never becomes a signal.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use common::{from_pips, to_pips, Direction};
use smc::confluence::{Bias, ConfluenceResult, SetupType};
use smc::structure::TrendState;

use crate::config::TradingConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub id: String,
    pub instrument: String,
    pub direction: Direction,
    pub entry: Decimal,
    pub stop_loss: Decimal,
    pub take_profit_1: Decimal,
    pub take_profit_2: Decimal,
    /// Reward at TP2 over risk at the stop.
    pub risk_reward: f64,
    /// Position size in lots.
    pub position_size: f64,
    pub risk_pct: f64,
    pub confidence: f64,
    pub setup_type: SetupType,
    pub market_structure: TrendState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TradeSignal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct SignalGenerator {
    config: TradingConfig,
}

impl SignalGenerator {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    /// Generate a signal, or nothing. `None` is the expected outcome for
    /// most analyses: below threshold, no directional majority, or a risk:
    /// reward under the configured minimum.
    pub fn generate(
        &self,
        analysis: &ConfluenceResult,
        current_price: Decimal,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<TradeSignal> {
        if !analysis.meets_threshold(threshold) {
            debug!(
                score = analysis.overall_score,
                threshold, "confluence below threshold, no signal"
            );
            return None;
        }

        let direction = self.vote_direction(analysis);
        if direction == Direction::Hold {
            debug!("tied bias vote, no signal");
            return None;
        }

        let entry = current_price;
        let buffer = from_pips(self.config.sl_buffer_pips, self.config.pip_size);
        let tp1_pct = Decimal::from_f64(self.config.tp1_pct).unwrap_or_default();
        let tp2_pct = Decimal::from_f64(self.config.tp2_pct).unwrap_or_default();

        let (stop_loss, take_profit_1, take_profit_2) = if direction == Direction::Buy {
            let stop = entry - buffer;
            let risk = entry - stop;
            (stop, entry + risk * tp1_pct, entry + risk * tp2_pct)
        } else {
            let stop = entry + buffer;
            let risk = stop - entry;
            (stop, entry - risk * tp1_pct, entry - risk * tp2_pct)
        };

        let risk = (entry - stop_loss).abs();
        let reward = (take_profit_2 - entry).abs();
        let risk_reward = if risk > Decimal::ZERO {
            (reward / risk).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        if risk_reward < self.config.min_risk_reward {
            debug!(
                risk_reward,
                min = self.config.min_risk_reward,
                "risk:reward below minimum, no signal"
            );
            return None;
        }

        let stop_pips = to_pips(risk, self.config.pip_size);
        let position_size = self.position_size(stop_pips)?;

        let signal = TradeSignal {
            id: signal_id(&analysis.instrument, now),
            instrument: analysis.instrument.clone(),
            direction,
            entry,
            stop_loss,
            take_profit_1,
            take_profit_2,
            risk_reward,
            position_size,
            risk_pct: self.config.risk_per_trade_pct,
            confidence: analysis.confidence,
            setup_type: analysis.setup_type,
            market_structure: analysis.market_structure,
            created_at: now,
            expires_at: now + Duration::minutes(self.config.signal_expiry_minutes),
        };

        info!(
            id = %signal.id,
            direction = %signal.direction,
            entry = %signal.entry,
            stop = %signal.stop_loss,
            risk_reward = signal.risk_reward,
            lots = signal.position_size,
            "signal generated"
        );
        Some(signal)
    }

    /// Majority vote over every factor's bias across all three timeframes.
    /// A tie, or nothing but neutral factors, resolves to `Hold`.
    fn vote_direction(&self, analysis: &ConfluenceResult) -> Direction {
        let mut bullish = 0usize;
        let mut bearish = 0usize;
        for factor in analysis.factors() {
            match factor.bias {
                Bias::Bullish => bullish += 1,
                Bias::Bearish => bearish += 1,
                Bias::Neutral => {}
            }
        }
        match bullish.cmp(&bearish) {
            std::cmp::Ordering::Greater => Direction::Buy,
            std::cmp::Ordering::Less => Direction::Sell,
            std::cmp::Ordering::Equal => Direction::Hold,
        }
    }

    /// Size from the fixed $10/pip/lot convention: risk amount divided by
    /// the dollar risk per lot at the stop distance, rounded down to the lot
    /// step and clamped to the configured bounds.
    fn position_size(&self, stop_pips: f64) -> Option<f64> {
        if stop_pips <= 0.0 {
            return None;
        }
        let raw = self.config.risk_amount() / (stop_pips * 10.0);
        let stepped = (raw / self.config.lot_step).floor() * self.config.lot_step;
        Some(stepped.clamp(self.config.default_lot, self.config.max_lot))
    }

    /// Validate an emitted signal. R:R violations are errors; size and
    /// expiry issues are warnings.
    pub fn validate(&self, signal: &TradeSignal, now: DateTime<Utc>) -> SignalValidation {
        let mut validation = SignalValidation { is_valid: true, ..Default::default() };

        if signal.risk_reward < self.config.min_risk_reward {
            validation.is_valid = false;
            validation.errors.push(format!(
                "risk:reward {:.2} below minimum {:.2}",
                signal.risk_reward, self.config.min_risk_reward
            ));
        }
        if signal.position_size > self.config.max_lot {
            validation.warnings.push(format!(
                "position size {} exceeds maximum {}",
                signal.position_size, self.config.max_lot
            ));
        }
        if signal.is_expired(now) {
            validation.warnings.push("signal has expired".to_string());
        }
        validation
    }
}

fn signal_id(instrument: &str, now: DateTime<Utc>) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", instrument, now.format("%Y%m%d_%H%M%S"), &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Timeframe;
    use rust_decimal_macros::dec;
    use smc::confluence::{ConfluenceFactor, FactorKind, TimeframeAnalysis};

    fn analysis_with_biases(biases: &[Bias], overall_score: f64) -> ConfluenceResult {
        let mut h4 = TimeframeAnalysis::new(Timeframe::H4);
        for bias in biases {
            h4.add_factor(
                ConfluenceFactor::new(FactorKind::Fvg, *bias, 0.8, 0.25, "test").unwrap(),
            );
        }
        ConfluenceResult {
            instrument: "XAUUSD".to_string(),
            h4,
            h1: TimeframeAnalysis::new(Timeframe::H1),
            m15: TimeframeAnalysis::new(Timeframe::M15),
            overall_score,
            confidence: (overall_score / 100.0).clamp(0.0, 1.0),
            setup_type: SetupType::FvgOnly,
            market_structure: TrendState::Uptrend,
            timestamp: Utc::now(),
        }
    }

    fn generator() -> SignalGenerator {
        SignalGenerator::new(TradingConfig::default())
    }

    #[test]
    fn below_threshold_yields_no_signal() {
        let analysis = analysis_with_biases(&[Bias::Bullish], 50.0);
        assert!(generator().generate(&analysis, dec!(2000), 80.0, Utc::now()).is_none());
    }

    #[test]
    fn tied_vote_yields_no_signal() {
        let analysis = analysis_with_biases(&[Bias::Bullish, Bias::Bearish], 90.0);
        assert!(generator().generate(&analysis, dec!(2000), 80.0, Utc::now()).is_none());
    }

    #[test]
    fn neutral_only_factors_yield_no_signal() {
        let analysis = analysis_with_biases(&[Bias::Neutral, Bias::Neutral], 90.0);
        assert!(generator().generate(&analysis, dec!(2000), 80.0, Utc::now()).is_none());
    }

    #[test]
    fn buy_signal_levels_and_sizing() {
        let analysis = analysis_with_biases(&[Bias::Bullish], 90.0);
        let now = Utc::now();
        let signal = generator().generate(&analysis, dec!(2000), 80.0, now).unwrap();

        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.entry, dec!(2000));
        // 5-pip buffer at pip 0.1 = 0.5 price units.
        assert_eq!(signal.stop_loss, dec!(1999.5));
        assert_eq!(signal.take_profit_1, dec!(2000.25));
        assert_eq!(signal.take_profit_2, dec!(2000.5));
        assert!((signal.risk_reward - 1.0).abs() < 1e-9);
        // $100 risk over 5 pips * $10 = 2 lots, clamped to max_lot.
        assert!((signal.position_size - 1.0).abs() < f64::EPSILON);
        assert_eq!(signal.expires_at, now + Duration::minutes(240));
        assert!(!signal.is_expired(now));
        assert!(signal.is_expired(now + Duration::minutes(241)));
    }

    #[test]
    fn sell_signal_mirrors_levels() {
        let analysis = analysis_with_biases(&[Bias::Bearish], 90.0);
        let signal = generator().generate(&analysis, dec!(2000), 80.0, Utc::now()).unwrap();

        assert_eq!(signal.direction, Direction::Sell);
        assert_eq!(signal.stop_loss, dec!(2000.5));
        assert_eq!(signal.take_profit_1, dec!(1999.75));
        assert_eq!(signal.take_profit_2, dec!(1999.5));
    }

    #[test]
    fn low_risk_reward_yields_no_signal() {
        // tp2 fixes R:R at 1.0; a higher minimum can never be met.
        let config = TradingConfig { min_risk_reward: 1.2, ..Default::default() };
        let generator = SignalGenerator::new(config);
        let analysis = analysis_with_biases(&[Bias::Bullish], 90.0);
        assert!(generator.generate(&analysis, dec!(2000), 80.0, Utc::now()).is_none());
    }

    #[test]
    fn position_size_rounds_to_lot_step() {
        let config = TradingConfig { risk_per_trade_pct: 0.33, ..Default::default() };
        let generator = SignalGenerator::new(config);
        // $33 over 5 pips * $10 = 0.66 lots.
        let size = generator.position_size(5.0).unwrap();
        assert!((size - 0.66).abs() < 1e-9);
    }

    #[test]
    fn tiny_risk_budget_floors_at_default_lot() {
        let config = TradingConfig { account_balance: 100.0, ..Default::default() };
        let generator = SignalGenerator::new(config);
        // $1 over 5 pips * $10 = 0.02 -> within bounds; $1 over 50 pips = 0.002
        // -> floored to default_lot.
        let size = generator.position_size(50.0).unwrap();
        assert!((size - 0.01).abs() < 1e-9);
    }

    #[test]
    fn signal_ids_are_unique() {
        let now = Utc::now();
        assert_ne!(signal_id("XAUUSD", now), signal_id("XAUUSD", now));
    }

    #[test]
    fn validate_flags_expired_and_oversized() {
        let generator = generator();
        let analysis = analysis_with_biases(&[Bias::Bullish], 90.0);
        let now = Utc::now();
        let mut signal = generator.generate(&analysis, dec!(2000), 80.0, now).unwrap();

        let ok = generator.validate(&signal, now);
        assert!(ok.is_valid);
        assert!(ok.warnings.is_empty());

        signal.position_size = 5.0;
        let later = now + Duration::minutes(300);
        let flagged = generator.validate(&signal, later);
        assert!(flagged.is_valid);
        assert_eq!(flagged.warnings.len(), 2);

        signal.risk_reward = 0.5;
        let invalid = generator.validate(&signal, now);
        assert!(!invalid.is_valid);
    }
}
