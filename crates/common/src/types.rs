use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Analysis timeframe. The confluence pipeline works on exactly these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Timeframe {
    H4,
    H1,
    M15,
}

impl Timeframe {
    /// Candle duration in minutes.
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::H4 => 240,
            Timeframe::H1 => 60,
            Timeframe::M15 => 15,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeframe::H4 => write!(f, "H4"),
            Timeframe::H1 => write!(f, "H1"),
            Timeframe::M15 => write!(f, "M15"),
        }
    }
}

/// Direction of a trade signal. `Hold` means no actionable signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
            Direction::Hold => write!(f, "HOLD"),
        }
    }
}

/// One OHLC candle. Immutable once constructed; all detectors borrow slices
/// of these.
///
/// Prices are fixed-point `Decimal` — repeated gap/pool boundary comparisons
/// must not accumulate binary rounding drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Option<u64>,
    pub timeframe: Option<Timeframe>,
    pub instrument: Option<String>,
}

impl Candle {
    /// Construct a validated candle. Rejects `high < low` and any open/close
    /// outside the high/low range; the offending candle is never coerced.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Option<u64>,
        timeframe: Option<Timeframe>,
        instrument: Option<String>,
    ) -> Result<Self> {
        if high < low {
            return Err(Error::InvalidCandle(format!(
                "high ({high}) cannot be less than low ({low})"
            )));
        }
        if open < low || open > high {
            return Err(Error::InvalidCandle(format!(
                "open ({open}) must be within [{low}, {high}]"
            )));
        }
        if close < low || close > high {
            return Err(Error::InvalidCandle(format!(
                "close ({close}) must be within [{low}, {high}]"
            )));
        }

        Ok(Self { timestamp, open, high, low, close, volume, timeframe, instrument })
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body_size(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn upper_wick(&self) -> Decimal {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> Decimal {
        self.open.min(self.close) - self.low
    }

    /// Total candle range (high - low).
    pub fn total_range(&self) -> Decimal {
        self.high - self.low
    }

    /// Body size as a percentage of total range. Zero-range candles report 0.
    pub fn body_percentage(&self) -> f64 {
        let range = self.total_range();
        if range.is_zero() {
            return 0.0;
        }
        let ratio = self.body_size() / range;
        ratio.to_f64().unwrap_or(0.0) * 100.0
    }

    /// A doji has open and close within `threshold` percent of the range.
    pub fn is_doji(&self, threshold: f64) -> bool {
        self.body_percentage() <= threshold
    }

    /// Whether this candle's body engulfs the previous candle's body in the
    /// opposite direction.
    pub fn is_engulfing(&self, previous: &Candle) -> bool {
        if previous.is_bearish()
            && self.is_bullish()
            && self.open < previous.close
            && self.close > previous.open
        {
            return true;
        }
        if previous.is_bullish()
            && self.is_bearish()
            && self.open > previous.close
            && self.close < previous.open
        {
            return true;
        }
        false
    }
}

/// Swing point kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwingKind {
    High,
    Low,
}

impl std::fmt::Display for SwingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwingKind::High => write!(f, "HIGH"),
            SwingKind::Low => write!(f, "LOW"),
        }
    }
}

/// A confirmed swing high or low in market structure.
///
/// Produced only by the structure analyzer; liquidity and order-block
/// detection consume read-only snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub kind: SwingKind,
    /// Strength score in [0, 1] derived from surrounding structure.
    pub strength: f64,
    pub volume: Option<u64>,
    pub confirmed: bool,
    /// Times price has revisited this level since confirmation.
    pub touches: u32,
}

impl SwingPoint {
    pub fn new(
        price: Decimal,
        timestamp: DateTime<Utc>,
        kind: SwingKind,
        strength: f64,
        volume: Option<u64>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(Error::InvalidLevel(format!(
                "swing strength must be within [0, 1], got {strength}"
            )));
        }
        Ok(Self { price, timestamp, kind, strength, volume, confirmed: false, touches: 0 })
    }

    pub fn add_touch(&mut self) {
        self.touches += 1;
    }

    pub fn is_high(&self) -> bool {
        self.kind == SwingKind::High
    }

    pub fn is_low(&self) -> bool {
        self.kind == SwingKind::Low
    }
}

/// Convert a price distance into pips for the given pip size.
/// Returns 0 when `pip_size` is zero (guarded at config validation).
pub fn to_pips(distance: Decimal, pip_size: Decimal) -> f64 {
    if pip_size.is_zero() {
        return 0.0;
    }
    (distance / pip_size).to_f64().unwrap_or(0.0)
}

/// Convert a pip count into a price distance.
pub fn from_pips(pips: f64, pip_size: Decimal) -> Decimal {
    Decimal::from_f64(pips).unwrap_or_default() * pip_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle::new(Utc::now(), open, high, low, close, Some(100), None, None).unwrap()
    }

    #[test]
    fn candle_rejects_high_below_low() {
        let result = Candle::new(
            Utc::now(),
            dec!(10),
            dec!(9),
            dec!(11),
            dec!(10),
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(Error::InvalidCandle(_))));
    }

    #[test]
    fn candle_rejects_close_outside_range() {
        let result = Candle::new(
            Utc::now(),
            dec!(10),
            dec!(11),
            dec!(9),
            dec!(12),
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(Error::InvalidCandle(_))));
    }

    #[test]
    fn candle_geometry_helpers() {
        let c = candle(dec!(10), dec!(12), dec!(9), dec!(11));
        assert!(c.is_bullish());
        assert_eq!(c.body_size(), dec!(1));
        assert_eq!(c.upper_wick(), dec!(1));
        assert_eq!(c.lower_wick(), dec!(1));
        assert_eq!(c.total_range(), dec!(3));
        let body_pct = c.body_percentage();
        assert!((body_pct - 33.333).abs() < 0.01, "got {body_pct}");
    }

    #[test]
    fn doji_detection_uses_body_percentage() {
        let doji = candle(dec!(10.000), dec!(10.5), dec!(9.5), dec!(10.0001));
        assert!(doji.is_doji(0.1));
        let full = candle(dec!(9.5), dec!(10.5), dec!(9.5), dec!(10.5));
        assert!(!full.is_doji(0.1));
    }

    #[test]
    fn engulfing_detection() {
        let prev = candle(dec!(10.4), dec!(10.5), dec!(10.0), dec!(10.1));
        let bull = candle(dec!(10.0), dec!(10.7), dec!(9.9), dec!(10.6));
        assert!(bull.is_engulfing(&prev));
        assert!(!prev.is_engulfing(&bull));
    }

    #[test]
    fn swing_point_rejects_out_of_range_strength() {
        assert!(SwingPoint::new(dec!(2000), Utc::now(), SwingKind::High, 1.2, None).is_err());
        assert!(SwingPoint::new(dec!(2000), Utc::now(), SwingKind::High, 0.8, None).is_ok());
    }

    #[test]
    fn pip_conversion_round_trips() {
        let pip = dec!(0.1);
        assert_eq!(to_pips(dec!(0.5), pip), 5.0);
        assert_eq!(from_pips(5.0, pip), dec!(0.5));
        assert_eq!(to_pips(dec!(1), Decimal::ZERO), 0.0);
    }
}
