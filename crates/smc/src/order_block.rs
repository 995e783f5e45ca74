//! Order block detection.
//!
//! An order block is a consolidation candle from which a strong directional
//! move originates, read as the footprint of institutional accumulation. The
//! detector scans closed candles for the accumulation signature and scores
//! each block on volume, range, rejection and round-number proximity.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{Candle, Error, Result};

use crate::config::OrderBlockConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObKind {
    /// Accumulation before an upward move; acts as demand on retest.
    Bullish,
    /// Accumulation before a downward move; acts as supply on retest.
    Bearish,
}

impl std::fmt::Display for ObKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObKind::Bullish => write!(f, "BULLISH"),
            ObKind::Bearish => write!(f, "BEARISH"),
        }
    }
}

/// A detected order block. `price` is the candle close, the refined entry
/// level inside the `low..=high` zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub kind: ObKind,
    pub price: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub strength: f64,
    pub touches: u32,
    pub last_touch: Option<DateTime<Utc>>,
    pub respected: bool,
    pub broken: bool,
    /// Body as a fraction of total range; small values mean long wicks.
    pub wick_ratio: f64,
    pub range: Decimal,
    pub rejection: bool,
    pub near_round_number: bool,
    pub instrument: Option<String>,
}

impl OrderBlock {
    pub fn new(kind: ObKind, candle: &Candle) -> Result<Self> {
        let range = candle.total_range();
        if range <= Decimal::ZERO {
            return Err(Error::InvalidLevel("order block range must be positive".into()));
        }
        Ok(Self {
            kind,
            price: candle.close,
            high: candle.high,
            low: candle.low,
            volume: candle.volume,
            timestamp: candle.timestamp,
            strength: 0.0,
            touches: 0,
            last_touch: None,
            respected: false,
            broken: false,
            wick_ratio: candle.body_percentage() / 100.0,
            range,
            rejection: rejection_pattern(candle),
            near_round_number: false,
            instrument: candle.instrument.clone(),
        })
    }

    pub fn add_touch(&mut self, timestamp: DateTime<Utc>) {
        self.touches += 1;
        self.last_touch = Some(timestamp);
    }

    pub fn mark_respected(&mut self) {
        self.respected = true;
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_minutes()
    }
}

/// Rejection: either long wicks overall, or a strong wick against the
/// candle's own direction.
fn rejection_pattern(candle: &Candle) -> bool {
    if candle.body_percentage() / 100.0 > 0.6 {
        return true;
    }
    let threshold = candle.body_size() * Decimal::new(8, 1);
    if candle.is_bullish() {
        candle.upper_wick() > threshold
    } else {
        candle.lower_wick() > threshold
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObStatistics {
    pub total: usize,
    pub bullish: usize,
    pub bearish: usize,
    pub respected: usize,
    pub broken: usize,
    pub respect_rate: f64,
    pub avg_strength: f64,
    pub avg_touches: f64,
}

pub struct ObDetector {
    config: OrderBlockConfig,
    pip_size: Decimal,
}

impl ObDetector {
    pub fn new(config: OrderBlockConfig, pip_size: Decimal) -> Self {
        Self { config, pip_size }
    }

    /// Scan a closed-candle series for order blocks. Only interior candles
    /// past the lookback warm-up are considered; each must precede a strong
    /// move and carry the accumulation signature.
    pub fn detect(&self, candles: &[Candle]) -> Vec<OrderBlock> {
        if candles.len() < self.config.lookback_candles {
            return Vec::new();
        }

        let avg_volume = self.average_volume(candles);
        let avg_range = self.average_range(candles);
        let mut blocks = Vec::new();

        for i in self.config.lookback_candles..candles.len() {
            if i == 0 || i + 1 >= candles.len() {
                continue;
            }
            let candle = &candles[i];
            if !self.is_candidate(&candles[i - 1], candle, &candles[i + 1]) {
                continue;
            }

            let kind = self.block_direction(candles, i);
            let Ok(mut block) = OrderBlock::new(kind, candle) else {
                continue;
            };
            block.near_round_number = self.near_round_number(block.price);
            block.strength = self.strength(&block, avg_volume, avg_range);

            if self.is_valid(&block) {
                debug!(
                    kind = %block.kind,
                    price = %block.price,
                    strength = block.strength,
                    "order block detected"
                );
                blocks.push(block);
            }
        }

        blocks
    }

    /// Accumulation signature: the next candle closes at least half the
    /// candidate's range away, the range itself is significant, volume is
    /// present, and the candidate consolidates against its predecessor
    /// (small body, overlapping ranges, close near the previous close).
    fn is_candidate(&self, prev: &Candle, candle: &Candle, next: &Candle) -> bool {
        let range = candle.total_range();
        if range < self.config.min_candle_range {
            return false;
        }
        if candle.volume.unwrap_or(0) == 0 {
            return false;
        }
        if (next.close - candle.close).abs() < range * Decimal::new(5, 1) {
            return false;
        }

        let overlap = candle.high.min(prev.high) >= candle.low.max(prev.low);
        candle.body_percentage() <= 40.0
            && overlap
            && (candle.close - prev.close).abs() < range * Decimal::new(3, 1)
    }

    /// Direction by majority vote over the next three candles; a side must
    /// outnumber the other by more than 1.5x, otherwise the candidate's own
    /// bias decides.
    fn block_direction(&self, candles: &[Candle], index: usize) -> ObKind {
        let end = (index + 4).min(candles.len());
        let future = &candles[index + 1..end];
        if future.is_empty() {
            return if candles[index].is_bullish() { ObKind::Bullish } else { ObKind::Bearish };
        }

        let bullish = future.iter().filter(|c| c.is_bullish()).count() as f64;
        let bearish = future.len() as f64 - bullish;
        if bullish > bearish * 1.5 {
            ObKind::Bullish
        } else if bearish > bullish * 1.5 {
            ObKind::Bearish
        } else if candles[index].is_bullish() {
            ObKind::Bullish
        } else {
            ObKind::Bearish
        }
    }

    /// Strength weights: 0.4 volume ratio, 0.3 range ratio, 0.2 rejection
    /// credit, 0.1 round-number bonus.
    fn strength(&self, block: &OrderBlock, avg_volume: f64, avg_range: Decimal) -> f64 {
        let volume_strength = match block.volume {
            Some(v) if avg_volume > 0.0 => {
                let multiplier = v as f64 / avg_volume;
                (multiplier / self.config.min_volume_multiplier).min(1.0)
            }
            _ => 1.0,
        };

        let range_strength = if avg_range > Decimal::ZERO {
            (block.range / avg_range).to_f64().unwrap_or(0.0).min(1.0)
        } else {
            0.0
        };

        let wick_strength = if self.config.require_rejection {
            if block.rejection {
                1.0
            } else {
                0.5
            }
        } else {
            1.0
        };

        let round_strength = if block.near_round_number { 1.2 } else { 1.0 };

        let strength = volume_strength * 0.4
            + range_strength * 0.3
            + wick_strength * 0.2
            + round_strength * 0.1;
        strength.clamp(0.0, 1.0)
    }

    fn is_valid(&self, block: &OrderBlock) -> bool {
        block.strength >= self.config.min_strength
            && block.wick_ratio <= self.config.wick_ratio_threshold
            && block.range >= self.config.min_candle_range
    }

    /// Psychological levels at 0/50/100 steps of the instrument's handle.
    fn near_round_number(&self, price: Decimal) -> bool {
        if !self.config.near_round_numbers {
            return false;
        }
        let tolerance = Decimal::from_f64(self.config.round_number_pips)
            .unwrap_or(Decimal::ZERO)
            * self.pip_size;
        let hundred = (price / Decimal::ONE_HUNDRED).floor() * Decimal::ONE_HUNDRED;
        [Decimal::ZERO, Decimal::new(50, 0), Decimal::ONE_HUNDRED]
            .iter()
            .any(|offset| (price - (hundred + offset)).abs() <= tolerance)
    }

    fn average_volume(&self, candles: &[Candle]) -> f64 {
        let start = candles.len().saturating_sub(self.config.avg_volume_periods);
        let volumes: Vec<f64> = candles[start..]
            .iter()
            .filter_map(|c| c.volume.map(|v| v as f64))
            .collect();
        if volumes.is_empty() {
            return 0.0;
        }
        volumes.iter().sum::<f64>() / volumes.len() as f64
    }

    fn average_range(&self, candles: &[Candle]) -> Decimal {
        let start = candles.len().saturating_sub(self.config.avg_volume_periods);
        let window = &candles[start..];
        if window.is_empty() {
            return Decimal::ZERO;
        }
        let sum: Decimal = window.iter().map(|c| c.total_range()).sum();
        sum / Decimal::from(window.len())
    }

    /// Unbroken blocks within the age limit, strongest first. A touch is
    /// recorded while the current price sits within a 10-pip tolerance of
    /// the block level.
    pub fn active(
        &self,
        blocks: &mut [OrderBlock],
        current_price: Decimal,
        now: DateTime<Utc>,
        max_age_minutes: i64,
    ) -> Vec<OrderBlock> {
        let tolerance = Decimal::from(10) * self.pip_size;
        let mut active: Vec<OrderBlock> = Vec::new();

        for block in blocks.iter_mut() {
            if block.broken || block.age_minutes(now) > max_age_minutes {
                continue;
            }
            if (current_price - block.price).abs() <= tolerance {
                block.add_touch(now);
            }
            active.push(block.clone());
        }

        active.sort_by(|a, b| b.strength.partial_cmp(&a.strength).unwrap_or(std::cmp::Ordering::Equal));
        active
    }

    /// A block is respected once it has accumulated the minimum touches and
    /// price has moved at least 30% of the block's range beyond it in the
    /// expected direction.
    pub fn is_respected(&self, block: &OrderBlock, current_price: Decimal) -> bool {
        if block.touches < self.config.min_touches {
            return false;
        }
        let reaction = block.range * Decimal::new(3, 1);
        match block.kind {
            ObKind::Bullish => current_price > block.price + reaction,
            ObKind::Bearish => current_price < block.price - reaction,
        }
    }

    pub fn statistics(&self, blocks: &[OrderBlock]) -> ObStatistics {
        if blocks.is_empty() {
            return ObStatistics::default();
        }
        let total = blocks.len();
        let bullish = blocks.iter().filter(|b| b.kind == ObKind::Bullish).count();
        let respected = blocks.iter().filter(|b| b.respected).count();
        let broken = blocks.iter().filter(|b| b.broken).count();
        ObStatistics {
            total,
            bullish,
            bearish: total - bullish,
            respected,
            broken,
            respect_rate: respected as f64 / total as f64 * 100.0,
            avg_strength: blocks.iter().map(|b| b.strength).sum::<f64>() / total as f64,
            avg_touches: blocks.iter().map(|b| f64::from(b.touches)).sum::<f64>() / total as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(minutes: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal, volume: u64) -> Candle {
        Candle::new(
            Utc::now() + Duration::minutes(minutes * 15),
            open,
            high,
            low,
            close,
            Some(volume),
            None,
            None,
        )
        .unwrap()
    }

    fn detector() -> ObDetector {
        let config = OrderBlockConfig { lookback_candles: 3, avg_volume_periods: 3, ..Default::default() };
        ObDetector::new(config, dec!(0.1))
    }

    /// Filler bars, one consolidation candidate, then a three-bar bullish
    /// impulse away from it.
    fn bullish_scenario() -> Vec<Candle> {
        vec![
            candle(0, dec!(2000), dec!(2001), dec!(1999), dec!(2000.5), 1_000),
            candle(1, dec!(2000), dec!(2001), dec!(1999), dec!(2000.5), 1_000),
            candle(2, dec!(2000), dec!(2001), dec!(1999), dec!(2000.5), 1_000),
            // Candidate: small body, overlaps the previous bar, closes near
            // the previous close, long upper wick on elevated volume.
            candle(3, dec!(2000.2), dec!(2001.0), dec!(2000.0), dec!(2000.4), 2_000),
            candle(4, dec!(2000.5), dec!(2001.3), dec!(2000.4), dec!(2001.2), 1_000),
            candle(5, dec!(2001.2), dec!(2001.9), dec!(2001.1), dec!(2001.8), 1_000),
            candle(6, dec!(2001.8), dec!(2002.5), dec!(2001.7), dec!(2002.4), 1_000),
        ]
    }

    #[test]
    fn detects_bullish_block_before_impulse() {
        let blocks = detector().detect(&bullish_scenario());
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.kind, ObKind::Bullish);
        assert_eq!(block.price, dec!(2000.4));
        assert_eq!(block.range, dec!(1.0));
        assert!(block.rejection);
        assert!(block.near_round_number);
        assert!(block.strength >= 0.3);
    }

    #[test]
    fn detects_bearish_block_before_drop() {
        let candles = vec![
            candle(0, dec!(2000), dec!(2001), dec!(1999), dec!(1999.5), 1_000),
            candle(1, dec!(2000), dec!(2001), dec!(1999), dec!(1999.5), 1_000),
            candle(2, dec!(2000), dec!(2001), dec!(1999), dec!(1999.5), 1_000),
            candle(3, dec!(1999.8), dec!(2000.0), dec!(1999.0), dec!(1999.6), 2_000),
            candle(4, dec!(1999.5), dec!(1999.6), dec!(1998.7), dec!(1998.8), 1_000),
            candle(5, dec!(1998.8), dec!(1998.9), dec!(1998.1), dec!(1998.2), 1_000),
            candle(6, dec!(1998.2), dec!(1998.3), dec!(1997.5), dec!(1997.6), 1_000),
        ];
        let blocks = detector().detect(&candles);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, ObKind::Bearish);
    }

    #[test]
    fn too_few_candles_yields_nothing() {
        let candles = bullish_scenario()[..2].to_vec();
        assert!(detector().detect(&candles).is_empty());
    }

    #[test]
    fn zero_volume_candidate_is_rejected() {
        let mut candles = bullish_scenario();
        candles[3].volume = Some(0);
        assert!(detector().detect(&candles).is_empty());
    }

    #[test]
    fn weak_follow_through_is_rejected() {
        let mut candles = bullish_scenario();
        // Next close only 0.2 away from the candidate close: under half the
        // candidate's 1.0 range.
        candles[4].close = dec!(2000.6);
        candles[4].high = dec!(2000.8);
        assert!(detector().detect(&candles).is_empty());
    }

    #[test]
    fn active_records_touches_and_filters_age() {
        let d = detector();
        let mut blocks = d.detect(&bullish_scenario());
        assert_eq!(blocks.len(), 1);
        let now = blocks[0].timestamp + Duration::minutes(30);

        // Price within 10 pips (1.0 at pip 0.1) of the block level.
        let active = d.active(&mut blocks, dec!(2000.9), now, 240);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].touches, 1);

        // Beyond the age limit the block is no longer active.
        let stale = blocks[0].timestamp + Duration::minutes(500);
        assert!(d.active(&mut blocks, dec!(2000.9), stale, 240).is_empty());
    }

    #[test]
    fn broken_blocks_are_excluded_from_active() {
        let d = detector();
        let mut blocks = d.detect(&bullish_scenario());
        let now = blocks[0].timestamp + Duration::minutes(30);
        blocks[0].mark_broken();
        assert!(d.active(&mut blocks, dec!(2000.4), now, 240).is_empty());
    }

    #[test]
    fn respect_requires_touches_and_reaction() {
        let d = detector();
        let mut blocks = d.detect(&bullish_scenario());
        let block = &mut blocks[0];

        // No touches yet.
        assert!(!d.is_respected(block, dec!(2001.0)));

        block.add_touch(block.timestamp + Duration::minutes(15));
        block.add_touch(block.timestamp + Duration::minutes(30));

        // Reaction threshold is 30% of the 1.0 range above the 2000.4 level.
        assert!(!d.is_respected(block, dec!(2000.5)));
        assert!(d.is_respected(block, dec!(2000.8)));
    }

    #[test]
    fn statistics_aggregate_counts() {
        let d = detector();
        let mut blocks = d.detect(&bullish_scenario());
        blocks[0].mark_respected();
        let stats = d.statistics(&blocks);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.bullish, 1);
        assert_eq!(stats.respected, 1);
        assert!((stats.respect_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn round_number_proximity_uses_pip_tolerance() {
        let d = detector();
        assert!(d.near_round_number(dec!(2049.8)));
        assert!(d.near_round_number(dec!(2003.0)));
        assert!(!d.near_round_number(dec!(2027.0)));
    }
}
