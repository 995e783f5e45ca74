//! Fair Value Gap detection.
//!
//! A Fair Value Gap is a three-candle price imbalance: the market gaps in one
//! direction fast enough that a price zone is left untraded. Price tends to
//! revisit ("fill") these zones, so unfilled gaps act as magnets and entry
//! zones.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{to_pips, Candle, Error, Result};

use crate::config::FvgConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FvgKind {
    Bullish,
    Bearish,
}

impl std::fmt::Display for FvgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FvgKind::Bullish => write!(f, "BULLISH"),
            FvgKind::Bearish => write!(f, "BEARISH"),
        }
    }
}

/// A detected Fair Value Gap. Constructed atomically from a validated
/// three-candle pattern; mutated only by fill/touch events, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairValueGap {
    pub kind: FvgKind,
    pub top: Decimal,
    pub bottom: Decimal,
    pub start_candle: Candle,
    pub mid_candle: Candle,
    pub end_candle: Candle,
    pub size: Decimal,
    pub mid_price: Decimal,
    /// Detection timestamp — the closing candle of the pattern.
    pub timestamp: DateTime<Utc>,
    pub strength: f64,
    pub filled: bool,
    pub fill_time: Option<DateTime<Utc>>,
    pub touches: u32,
}

impl FairValueGap {
    /// Invariant: `top > bottom` always holds for a constructed gap.
    pub fn new(
        kind: FvgKind,
        top: Decimal,
        bottom: Decimal,
        start_candle: Candle,
        mid_candle: Candle,
        end_candle: Candle,
    ) -> Result<Self> {
        if top <= bottom {
            return Err(Error::InvalidLevel(format!(
                "FVG top ({top}) must be greater than bottom ({bottom})"
            )));
        }

        let timestamp = end_candle.timestamp;
        Ok(Self {
            kind,
            top,
            bottom,
            size: top - bottom,
            mid_price: (top + bottom) / Decimal::TWO,
            start_candle,
            mid_candle,
            end_candle,
            timestamp,
            strength: 0.0,
            filled: false,
            fill_time: None,
            touches: 0,
        })
    }

    pub fn mark_filled(&mut self, fill_time: DateTime<Utc>) {
        self.filled = true;
        self.fill_time = Some(fill_time);
        self.touches += 1;
    }

    pub fn add_touch(&mut self) {
        self.touches += 1;
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_minutes()
    }
}

/// Scans candle sequences for three-candle imbalance patterns.
pub struct FvgDetector {
    config: FvgConfig,
    pip_size: Decimal,
}

impl FvgDetector {
    pub fn new(config: FvgConfig, pip_size: Decimal) -> Self {
        Self { config, pip_size }
    }

    /// Detect gaps over the full candle slice in detection order.
    ///
    /// Fewer than three candles is an expected non-match, not an error.
    /// Gaps below the configured minimum strength are discarded.
    pub fn detect(&self, candles: &[Candle], avg_volume: f64) -> Vec<FairValueGap> {
        if candles.len() < 3 {
            return Vec::new();
        }

        let mut gaps = Vec::new();
        for window in candles.windows(3) {
            if let Some(gap) = self.analyze_window(&window[0], &window[1], &window[2], avg_volume)
            {
                if gap.strength >= self.config.min_strength {
                    debug!(
                        kind = %gap.kind,
                        bottom = %gap.bottom,
                        top = %gap.top,
                        strength = gap.strength,
                        "FVG detected"
                    );
                    gaps.push(gap);
                }
            }
        }
        gaps
    }

    /// Analyze one three-candle window.
    ///
    /// Bullish: both steps gap upward (`c1.low > c0.high` and
    /// `c2.low > c1.high`); the untraded zone is the first gap of the run,
    /// bounded by `min(c0.high, c1.high)` below and `min(c1.low, c2.low)`
    /// above. Bearish is the mirror. Windows where the bounds collapse are
    /// silently skipped.
    fn analyze_window(
        &self,
        first: &Candle,
        mid: &Candle,
        last: &Candle,
        avg_volume: f64,
    ) -> Option<FairValueGap> {
        let (kind, bottom, top) = if mid.low > first.high && last.low > mid.high {
            let bottom = first.high.min(mid.high);
            let top = mid.low.min(last.low);
            (FvgKind::Bullish, bottom, top)
        } else if mid.high < first.low && last.high < mid.low {
            let top = first.low.max(mid.low);
            let bottom = mid.high.max(last.high);
            (FvgKind::Bearish, bottom, top)
        } else {
            return None;
        };

        if top <= bottom {
            return None;
        }

        let mut gap = FairValueGap::new(
            kind,
            top,
            bottom,
            first.clone(),
            mid.clone(),
            last.clone(),
        )
        .ok()?;

        let gap_volume = last.volume.map(|v| v as f64).unwrap_or(avg_volume);
        gap.strength = self.strength(&gap, avg_volume, gap_volume);
        Some(gap)
    }

    /// Strength = 0.4·size-fit + 0.3·volume + 0.3·middle-candle wick credit.
    fn strength(&self, gap: &FairValueGap, avg_volume: f64, gap_volume: f64) -> f64 {
        let size_pips = to_pips(gap.size, self.pip_size);
        let size_strength = if size_pips < self.config.min_size_pips {
            0.2
        } else if size_pips > self.config.max_size_pips {
            0.5
        } else {
            1.0
        };

        let volume_strength = if self.config.require_volume_spike {
            if avg_volume > 0.0 {
                (gap_volume / avg_volume / self.config.volume_multiplier).min(1.0)
            } else {
                1.0
            }
        } else {
            1.0
        };

        // A small middle-candle body means the imbalance was not contested.
        let wick_strength = (1.0 - gap.mid_candle.body_percentage() / 100.0).max(0.3);

        let strength = size_strength * 0.4 + volume_strength * 0.3 + wick_strength * 0.3;
        strength.clamp(0.0, 1.0)
    }

    /// Whether price has re-entered the gap from the breakout side, within
    /// the configured pip tolerance.
    pub fn is_filled(&self, gap: &FairValueGap, current_price: Decimal) -> bool {
        if gap.filled {
            return true;
        }
        let tolerance = Decimal::from_f64(self.config.fill_tolerance_pips)
            .unwrap_or(Decimal::ZERO)
            * self.pip_size;
        match gap.kind {
            FvgKind::Bullish => current_price <= gap.bottom + tolerance,
            FvgKind::Bearish => current_price >= gap.top - tolerance,
        }
    }

    /// Active gaps: unfilled, younger than `max_age_minutes`, and (when
    /// configured) at least the minimum size. Sorted strongest first.
    pub fn active(
        &self,
        gaps: &[FairValueGap],
        current_price: Decimal,
        now: DateTime<Utc>,
        max_age_minutes: i64,
    ) -> Vec<FairValueGap> {
        let mut active: Vec<FairValueGap> = gaps
            .iter()
            .filter(|g| g.age_minutes(now) <= max_age_minutes)
            .filter(|g| !self.is_filled(g, current_price))
            .filter(|g| {
                !self.config.ignore_small_fvgs
                    || to_pips(g.size, self.pip_size) >= self.config.min_size_pips
            })
            .cloned()
            .collect();

        active.sort_by(|a, b| {
            b.strength.partial_cmp(&a.strength).unwrap_or(Ordering::Equal)
        });
        active
    }

    /// Summary statistics over a detected gap set.
    pub fn statistics(&self, gaps: &[FairValueGap]) -> FvgStatistics {
        let total = gaps.len();
        if total == 0 {
            return FvgStatistics::default();
        }

        let bullish = gaps.iter().filter(|g| g.kind == FvgKind::Bullish).count();
        let filled = gaps.iter().filter(|g| g.filled).count();
        let avg_strength = gaps.iter().map(|g| g.strength).sum::<f64>() / total as f64;
        let avg_size_pips = gaps
            .iter()
            .map(|g| to_pips(g.size, self.pip_size))
            .sum::<f64>()
            / total as f64;

        FvgStatistics {
            total,
            bullish,
            bearish: total - bullish,
            filled,
            fill_rate_pct: filled as f64 / total as f64 * 100.0,
            avg_strength,
            avg_size_pips,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FvgStatistics {
    pub total: usize,
    pub bullish: usize,
    pub bearish: usize,
    pub filled: usize,
    pub fill_rate_pct: f64,
    pub avg_strength: f64,
    pub avg_size_pips: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn candle_at(
        minutes: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Candle {
        let base = Utc::now();
        Candle::new(
            base + Duration::minutes(minutes),
            open,
            high,
            low,
            close,
            Some(1_000),
            None,
            None,
        )
        .unwrap()
    }

    fn detector() -> FvgDetector {
        FvgDetector::new(FvgConfig::default(), dec!(1))
    }

    /// Gap-up run: three candles where each step leaves the prior high
    /// untouched. The gap zone is bounded by c0.high and c1.low.
    fn gap_up_candles() -> Vec<Candle> {
        vec![
            candle_at(0, dec!(1950), dec!(1951), dec!(1949), dec!(1950.5)),
            candle_at(60, dec!(1952), dec!(1952.9), dec!(1951.5), dec!(1952.8)),
            candle_at(120, dec!(1953.5), dec!(1954), dec!(1953), dec!(1953.7)),
        ]
    }

    #[test]
    fn fewer_than_three_candles_yields_empty() {
        let candles = gap_up_candles();
        assert!(detector().detect(&candles[..2], 0.0).is_empty());
        assert!(detector().detect(&[], 0.0).is_empty());
    }

    #[test]
    fn gap_up_run_yields_exactly_one_bullish_gap() {
        let gaps = detector().detect(&gap_up_candles(), 0.0);
        assert_eq!(gaps.len(), 1);
        let gap = &gaps[0];
        assert_eq!(gap.kind, FvgKind::Bullish);
        assert_eq!(gap.bottom, dec!(1951));
        assert_eq!(gap.top, dec!(1951.5));
        assert_eq!(gap.size, dec!(0.5));
        assert!(gap.top > gap.bottom);
    }

    #[test]
    fn gap_down_run_yields_bearish_gap_mirrored() {
        let candles = vec![
            candle_at(0, dec!(1952), dec!(1953), dec!(1951), dec!(1951.5)),
            candle_at(60, dec!(1950), dec!(1950.5), dec!(1949.1), dec!(1949.2)),
            candle_at(120, dec!(1948.5), dec!(1949), dec!(1948), dec!(1948.3)),
        ];
        let gaps = detector().detect(&candles, 0.0);
        assert_eq!(gaps.len(), 1);
        let gap = &gaps[0];
        assert_eq!(gap.kind, FvgKind::Bearish);
        assert_eq!(gap.top, dec!(1951));
        assert_eq!(gap.bottom, dec!(1950.5));
        assert!(gap.top > gap.bottom);
    }

    #[test]
    fn overlapping_candles_are_not_a_gap() {
        let candles = vec![
            candle_at(0, dec!(1950), dec!(1951), dec!(1949), dec!(1950.5)),
            candle_at(60, dec!(1950.5), dec!(1951.5), dec!(1950), dec!(1951)),
            candle_at(120, dec!(1951), dec!(1952), dec!(1950.5), dec!(1951.8)),
        ];
        assert!(detector().detect(&candles, 0.0).is_empty());
    }

    #[test]
    fn detection_is_idempotent() {
        let candles = gap_up_candles();
        let d = detector();
        assert_eq!(d.detect(&candles, 500.0), d.detect(&candles, 500.0));
    }

    #[test]
    fn construction_rejects_inverted_bounds() {
        let candles = gap_up_candles();
        let result = FairValueGap::new(
            FvgKind::Bullish,
            dec!(1951),
            dec!(1951.5),
            candles[0].clone(),
            candles[1].clone(),
            candles[2].clone(),
        );
        assert!(matches!(result, Err(Error::InvalidLevel(_))));
    }

    #[test]
    fn bullish_gap_fills_from_above() {
        let d = detector();
        let gaps = d.detect(&gap_up_candles(), 0.0);
        let gap = &gaps[0];
        // Price above the zone: not filled.
        assert!(!d.is_filled(gap, dec!(1955)));
        // Price back through the zone, within 2-pip tolerance of the bottom.
        assert!(d.is_filled(gap, dec!(1952.5)));
        assert!(d.is_filled(gap, dec!(1950)));
    }

    #[test]
    fn active_filters_age_and_fill_and_sorts_by_strength() {
        let d = FvgDetector::new(
            FvgConfig { ignore_small_fvgs: false, ..Default::default() },
            dec!(1),
        );
        let gaps = d.detect(&gap_up_candles(), 0.0);
        let now = gaps[0].timestamp;

        let active = d.active(&gaps, dec!(1955), now + Duration::minutes(30), 240);
        assert_eq!(active.len(), 1);

        // Too old.
        assert!(d
            .active(&gaps, dec!(1955), now + Duration::minutes(500), 240)
            .is_empty());

        // Filled by current price.
        assert!(d.active(&gaps, dec!(1950), now, 240).is_empty());
    }

    #[test]
    fn small_gaps_are_dropped_when_configured() {
        let d = detector(); // ignore_small_fvgs = true, min 5 pips, pip = 1
        let gaps = d.detect(&gap_up_candles(), 0.0);
        let now = gaps[0].timestamp;
        // 0.5-pip gap is below the 5-pip minimum.
        assert!(d.active(&gaps, dec!(1955), now, 240).is_empty());
    }

    #[test]
    fn statistics_reports_counts_and_fill_rate() {
        let d = detector();
        let mut gaps = d.detect(&gap_up_candles(), 0.0);
        gaps[0].mark_filled(Utc::now());
        let stats = d.statistics(&gaps);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.bullish, 1);
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.fill_rate_pct, 100.0);
        assert!(d.statistics(&[]).total == 0);
    }
}
