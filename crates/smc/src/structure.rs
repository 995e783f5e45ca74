//! Market structure analysis.
//!
//! Maintains swing-high/low history for one instrument and a trend state
//! machine with Break-of-Structure / Change-of-Character detection. This is
//! the only component with state that outlives a single analysis call; other
//! detectors receive read-only swing snapshots.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{Candle, SwingKind, SwingPoint};

use crate::config::StructureConfig;

/// Trend state. Starts `Ranging`; transitions are recomputed from swing
/// progressions on every candle, never latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendState {
    Uptrend,
    Downtrend,
    #[default]
    Ranging,
}

impl std::fmt::Display for TrendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendState::Uptrend => write!(f, "UPTREND"),
            TrendState::Downtrend => write!(f, "DOWNTREND"),
            TrendState::Ranging => write!(f, "RANGING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakKind {
    /// Break of Structure: close beyond the trend's last swing point,
    /// confirming continuation.
    Bos,
    /// Change of Character: close beyond a swing point while ranging,
    /// signaling a potential new trend.
    Choch,
}

impl std::fmt::Display for BreakKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakKind::Bos => write!(f, "BOS"),
            BreakKind::Choch => write!(f, "CHoCH"),
        }
    }
}

/// One entry in the append-only structure-break log. Only `confirmed` is
/// ever mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureBreak {
    pub kind: BreakKind,
    /// The broken swing level, not the breaking close.
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub confirmed: bool,
    pub strength: f64,
    /// Bullish breaks close above a swing high; bearish below a swing low.
    pub bullish: bool,
}

/// Swing history, trend state machine, and break log for one instrument.
pub struct StructureAnalyzer {
    config: StructureConfig,
    pip_size: Decimal,
    instrument: String,
    /// Rolling candle window used for pivot confirmation and averages.
    window: Vec<Candle>,
    swing_highs: Vec<SwingPoint>,
    swing_lows: Vec<SwingPoint>,
    breaks: Vec<StructureBreak>,
    state: TrendState,
    trend_strength: f64,
    last_update: Option<DateTime<Utc>>,
}

impl StructureAnalyzer {
    pub fn new(config: StructureConfig, pip_size: Decimal, instrument: impl Into<String>) -> Self {
        Self {
            config,
            pip_size,
            instrument: instrument.into(),
            window: Vec::new(),
            swing_highs: Vec::new(),
            swing_lows: Vec::new(),
            breaks: Vec::new(),
            state: TrendState::Ranging,
            trend_strength: 0.0,
            last_update: None,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn state(&self) -> TrendState {
        self.state
    }

    pub fn trend_strength(&self) -> f64 {
        self.trend_strength
    }

    pub fn breaks(&self) -> &[StructureBreak] {
        &self.breaks
    }

    /// Read-only, time-ordered snapshot of all live swing points. This is
    /// what the liquidity and order-block consumers receive; they never see
    /// the analyzer's internals.
    pub fn swing_points(&self) -> Vec<SwingPoint> {
        let mut points: Vec<SwingPoint> = self
            .swing_highs
            .iter()
            .chain(self.swing_lows.iter())
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Incorporate one closed candle: confirm any completed swing pivot,
    /// prune old history, recompute trend, then evaluate breaks against the
    /// fresh state.
    pub fn update(&mut self, candle: &Candle) {
        self.last_update = Some(candle.timestamp);
        self.window.push(candle.clone());
        let max_window = self.config.trend_period * 2;
        if self.window.len() > max_window {
            self.window.remove(0);
        }

        self.confirm_pivot();
        self.prune_swings();
        self.recompute_trend();
        if self.has_min_swings() {
            self.detect_break(candle);
        }
    }

    /// A swing confirms one candle late: the middle of the last three
    /// candles is a swing high when its high exceeds both neighbors, a swing
    /// low when its low undercuts both. A candle registers at most one kind
    /// per update (high checked first).
    fn confirm_pivot(&mut self) {
        let n = self.window.len();
        if n < 3 {
            return;
        }
        let (left, mid, right) = (&self.window[n - 3], &self.window[n - 2], &self.window[n - 1]);

        if mid.high > left.high && mid.high > right.high {
            let strength = self.swing_strength(mid);
            if let Ok(mut point) =
                SwingPoint::new(mid.high, mid.timestamp, SwingKind::High, strength, mid.volume)
            {
                point.confirmed = true;
                debug!(instrument = %self.instrument, price = %point.price, "swing high confirmed");
                self.swing_highs.push(point);
            }
        } else if mid.low < left.low && mid.low < right.low {
            let strength = self.swing_strength(mid);
            if let Ok(mut point) =
                SwingPoint::new(mid.low, mid.timestamp, SwingKind::Low, strength, mid.volume)
            {
                point.confirmed = true;
                debug!(instrument = %self.instrument, price = %point.price, "swing low confirmed");
                self.swing_lows.push(point);
            }
        }
    }

    /// Strength of a swing candle: volume ratio (0.4) + range ratio (0.3) +
    /// rejection-wick share (0.3), each against the rolling window.
    fn swing_strength(&self, candle: &Candle) -> f64 {
        let mut strength = 0.0;

        if let Some(volume) = candle.volume {
            let avg = self.average_volume();
            if avg > 0.0 {
                strength += (volume as f64 / avg).min(1.0) * 0.4;
            }
        }

        let avg_range = self.average_range();
        if avg_range > Decimal::ZERO {
            let ratio = (candle.total_range() / avg_range).to_f64().unwrap_or(0.0);
            strength += ratio.min(1.0) * 0.3;
        }

        strength += (1.0 - candle.body_percentage() / 100.0) * 0.3;
        strength.clamp(0.0, 1.0)
    }

    fn average_volume(&self) -> f64 {
        let volumes: Vec<f64> = self
            .window
            .iter()
            .filter_map(|c| c.volume.map(|v| v as f64))
            .collect();
        if volumes.is_empty() {
            return 0.0;
        }
        volumes.iter().sum::<f64>() / volumes.len() as f64
    }

    fn average_range(&self) -> Decimal {
        if self.window.is_empty() {
            return Decimal::ZERO;
        }
        let sum: Decimal = self.window.iter().map(|c| c.total_range()).sum();
        sum / Decimal::from(self.window.len())
    }

    /// Bound swing memory at `2 × trend_period` points per side.
    fn prune_swings(&mut self) {
        let max = self.config.trend_period * 2;
        if self.swing_highs.len() > max {
            self.swing_highs.drain(..self.swing_highs.len() - max);
        }
        if self.swing_lows.len() > max {
            self.swing_lows.drain(..self.swing_lows.len() - max);
        }
    }

    fn has_min_swings(&self) -> bool {
        self.swing_highs.len() >= self.config.min_swing_points
            && self.swing_lows.len() >= self.config.min_swing_points
    }

    /// Trend from the last two swing points per side: higher highs AND
    /// higher lows is an uptrend, lower-lower a downtrend, anything mixed is
    /// ranging. Below the minimum swing count the state is forced ranging.
    fn recompute_trend(&mut self) {
        if !self.has_min_swings() {
            self.state = TrendState::Ranging;
            self.trend_strength = 0.0;
            return;
        }

        let [prev_high, last_high] = last_two(&self.swing_highs);
        let [prev_low, last_low] = last_two(&self.swing_lows);

        self.state = if last_high.price > prev_high.price && last_low.price > prev_low.price {
            TrendState::Uptrend
        } else if last_high.price < prev_high.price && last_low.price < prev_low.price {
            TrendState::Downtrend
        } else {
            TrendState::Ranging
        };

        self.trend_strength = match self.state {
            TrendState::Uptrend => self.progression_consistency(true),
            TrendState::Downtrend => self.progression_consistency(false),
            TrendState::Ranging => 0.0,
        };
    }

    /// Normalized count of swing progressions consistent with the trend
    /// (+1 consistent, -0.5 inconsistent, floored at zero), averaged over
    /// the high and low sides.
    fn progression_consistency(&self, ascending: bool) -> f64 {
        let score_side = |points: &[SwingPoint]| -> f64 {
            let recent = &points[points.len().saturating_sub(self.config.trend_period)..];
            if recent.len() < 2 {
                return 0.0;
            }
            let mut score = 0.0;
            for pair in recent.windows(2) {
                let consistent = if ascending {
                    pair[1].price > pair[0].price
                } else {
                    pair[1].price < pair[0].price
                };
                if consistent {
                    score += 1.0;
                } else if pair[1].price != pair[0].price {
                    score -= 0.5;
                }
            }
            (score / (recent.len() - 1) as f64).max(0.0)
        };

        let high = score_side(&self.swing_highs);
        let low = score_side(&self.swing_lows);
        ((high + low) / 2.0).clamp(0.0, 1.0)
    }

    /// Break evaluation runs against the state recomputed this update, one
    /// branch per update: BOS confirms continuation of an established trend,
    /// CHoCH fires only while ranging. A level already logged as the most
    /// recent break of the same kind is not re-appended.
    fn detect_break(&mut self, candle: &Candle) {
        let (Some(last_high), Some(last_low)) = (self.swing_highs.last(), self.swing_lows.last())
        else {
            return;
        };

        let broken = |kind: BreakKind, point: &SwingPoint, bullish: bool| StructureBreak {
            kind,
            price: point.price,
            timestamp: candle.timestamp,
            confirmed: false,
            strength: point.strength,
            bullish,
        };

        let candidate = match self.state {
            TrendState::Uptrend => (candle.close > last_high.price)
                .then(|| broken(BreakKind::Bos, last_high, true)),
            TrendState::Downtrend => (candle.close < last_low.price)
                .then(|| broken(BreakKind::Bos, last_low, false)),
            TrendState::Ranging => {
                if candle.close > last_high.price {
                    Some(broken(BreakKind::Choch, last_high, true))
                } else if candle.close < last_low.price {
                    Some(broken(BreakKind::Choch, last_low, false))
                } else {
                    None
                }
            }
        };

        if let Some(brk) = candidate {
            let duplicate = self
                .breaks
                .last()
                .is_some_and(|last| last.kind == brk.kind && last.price == brk.price);
            if !duplicate {
                debug!(
                    instrument = %self.instrument,
                    kind = %brk.kind,
                    price = %brk.price,
                    bullish = brk.bullish,
                    "structure break"
                );
                self.breaks.push(brk);
            }
        }
    }

    /// Confirm the most recent break matching by kind and price within the
    /// configured pip tolerance.
    pub fn confirm_break(&mut self, kind: BreakKind, price: Decimal) {
        let tolerance = Decimal::from_f64(self.config.break_confirm_tolerance_pips)
            .unwrap_or(Decimal::ZERO)
            * self.pip_size;
        if let Some(brk) = self
            .breaks
            .iter_mut()
            .rev()
            .find(|b| b.kind == kind && (b.price - price).abs() <= tolerance)
        {
            brk.confirmed = true;
        }
    }

    /// Breaks younger than `max_age_hours`, newest first.
    pub fn recent_breaks(&self, now: DateTime<Utc>, max_age_hours: i64) -> Vec<StructureBreak> {
        let cutoff = now - Duration::hours(max_age_hours);
        let mut recent: Vec<StructureBreak> = self
            .breaks
            .iter()
            .filter(|b| b.timestamp >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent
    }
}

fn last_two(points: &[SwingPoint]) -> [&SwingPoint; 2] {
    [&points[points.len() - 2], &points[points.len() - 1]]
}
