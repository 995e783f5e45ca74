//! Liquidity pool and sweep analysis.
//!
//! Clusters of swing points near the same level attract resting stop orders;
//! a fast push through such a cluster followed by rejection is a liquidity
//! sweep. Scores from both feed the confluence model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{from_pips, to_pips, Candle, Error, Result, SwingPoint};

use crate::config::LiquidityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolKind {
    /// Clustered swing highs: buy-side liquidity resting above.
    High,
    /// Clustered swing lows: sell-side liquidity resting below.
    Low,
    /// Mixed cluster; tracked but never swept.
    Side,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::High => write!(f, "HIGH"),
            PoolKind::Low => write!(f, "LOW"),
            PoolKind::Side => write!(f, "SIDE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SweepKind {
    BuySide,
    SellSide,
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepKind::BuySide => write!(f, "BUY_SIDE"),
            SweepKind::SellSide => write!(f, "SELL_SIDE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPool {
    pub price: Decimal,
    pub strength: f64,
    pub kind: PoolKind,
    pub timestamp: DateTime<Utc>,
    pub touches: u32,
    pub last_touch: Option<DateTime<Utc>>,
    pub swept: bool,
    pub sweep_time: Option<DateTime<Utc>>,
    pub sweep_price: Option<Decimal>,
}

impl LiquidityPool {
    pub fn new(
        price: Decimal,
        strength: f64,
        kind: PoolKind,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(Error::InvalidLevel(format!(
                "pool strength must be within [0, 1], got {strength}"
            )));
        }
        if price <= Decimal::ZERO {
            return Err(Error::InvalidLevel(format!("pool price must be positive, got {price}")));
        }
        Ok(Self {
            price,
            strength,
            kind,
            timestamp,
            touches: 0,
            last_touch: None,
            swept: false,
            sweep_time: None,
            sweep_price: None,
        })
    }

    pub fn add_touch(&mut self, timestamp: DateTime<Utc>) {
        self.touches += 1;
        self.last_touch = Some(timestamp);
    }

    pub fn mark_swept(&mut self, sweep_time: DateTime<Utc>, sweep_price: Decimal) {
        self.swept = true;
        self.sweep_time = Some(sweep_time);
        self.sweep_price = Some(sweep_price);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySweep {
    pub kind: SweepKind,
    pub pool_price: Decimal,
    pub sweep_price: Decimal,
    pub sweep_time: DateTime<Utc>,
    /// Extension beyond the pool, in pips.
    pub extension_pips: f64,
    pub strength: f64,
    pub reversal_price: Option<Decimal>,
    pub confirmed: bool,
}

impl LiquiditySweep {
    pub fn confirm_reversal(&mut self, reversal_price: Decimal) {
        self.reversal_price = Some(reversal_price);
        self.confirmed = true;
    }
}

/// Aggregate liquidity picture handed to the confluence layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiquidityFlow {
    pub total_pools: usize,
    pub high_pools: usize,
    pub low_pools: usize,
    pub side_pools: usize,
    pub total_sweeps: usize,
    pub buy_sweeps: usize,
    pub sell_sweeps: usize,
    pub confirmed_sweeps: usize,
    pub sweep_rate: f64,
    pub nearest_high_pool: Option<LiquidityPool>,
    pub nearest_low_pool: Option<LiquidityPool>,
    /// Overall liquidity score in [0, 1].
    pub score: f64,
}

pub struct LiquidityAnalyzer {
    config: LiquidityConfig,
    pip_size: Decimal,
}

impl LiquidityAnalyzer {
    pub fn new(config: LiquidityConfig, pip_size: Decimal) -> Self {
        Self { config, pip_size }
    }

    /// Pools form from adjacent swing-point pairs sitting within
    /// `pool_range_pips` of each other, when the current price is near
    /// either point. The pool level is the first point's price.
    pub fn identify_pools(
        &self,
        swings: &[SwingPoint],
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<LiquidityPool> {
        if swings.len() < 2 {
            return Vec::new();
        }

        let tolerance = from_pips(self.config.pool_range_pips, self.pip_size);
        let mut pools = Vec::new();

        for pair in swings.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);

            let span_pips = to_pips((second.price - first.price).abs(), self.pip_size);
            if span_pips > self.config.pool_range_pips {
                continue;
            }
            let near = (current_price - first.price).abs() <= tolerance
                || (current_price - second.price).abs() <= tolerance;
            if !near {
                continue;
            }

            let kind = if first.is_high() && second.is_high() {
                PoolKind::High
            } else if first.is_low() && second.is_low() {
                PoolKind::Low
            } else {
                PoolKind::Side
            };
            let strength = self.pool_strength(first, second, now);
            if let Ok(pool) = LiquidityPool::new(first.price, strength, kind, first.timestamp) {
                debug!(kind = %pool.kind, price = %pool.price, strength = pool.strength, "liquidity pool");
                pools.push(pool);
            }
        }

        pools
    }

    /// Touch ratio (0.4) + recency decay over 24h (0.3) + mean swing
    /// strength (0.3).
    fn pool_strength(&self, first: &SwingPoint, second: &SwingPoint, now: DateTime<Utc>) -> f64 {
        let touch_target = (self.config.min_pool_touches * 2) as f64;
        let touch_strength = ((first.touches + second.touches) as f64 / touch_target).min(1.0);

        let first_age = (now - first.timestamp).num_seconds() as f64 / 3600.0;
        let second_age = (now - second.timestamp).num_seconds() as f64 / 3600.0;
        let recency_strength = 1.0 - first_age.min(second_age) / 24.0;

        let point_strength = (first.strength + second.strength) / 2.0;

        (touch_strength * 0.4 + recency_strength * 0.3 + point_strength * 0.3).clamp(0.0, 1.0)
    }

    /// One sweep at most per un-swept pool: price beyond a High pool is a
    /// buy-side sweep, below a Low pool a sell-side sweep, and the extension
    /// must reach `sweep_extension_pips`. Side pools never sweep.
    pub fn detect_sweeps(
        &self,
        pools: &[LiquidityPool],
        candles: &[Candle],
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<LiquiditySweep> {
        pools
            .iter()
            .filter(|pool| !pool.swept)
            .filter_map(|pool| self.sweep_for_pool(pool, candles, current_price, now))
            .collect()
    }

    fn sweep_for_pool(
        &self,
        pool: &LiquidityPool,
        candles: &[Candle],
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<LiquiditySweep> {
        let kind = match pool.kind {
            PoolKind::High if current_price > pool.price => SweepKind::BuySide,
            PoolKind::Low if current_price < pool.price => SweepKind::SellSide,
            _ => return None,
        };

        let extension_pips = to_pips((current_price - pool.price).abs(), self.pip_size);
        if extension_pips < self.config.sweep_extension_pips {
            return None;
        }

        let avg_volume = self.average_volume(candles);
        let sweep_volume = candles.last().and_then(|c| c.volume).unwrap_or(0) as f64;

        let mut sweep = LiquiditySweep {
            kind,
            pool_price: pool.price,
            sweep_price: current_price,
            sweep_time: now,
            extension_pips,
            strength: 0.0,
            reversal_price: None,
            confirmed: false,
        };
        sweep.strength = self.sweep_strength(&sweep, sweep_volume, avg_volume);
        debug!(kind = %sweep.kind, pool = %sweep.pool_price, extension_pips, "liquidity sweep");
        Some(sweep)
    }

    /// Volume ratio against the spike multiplier (0.6) + extension-band fit
    /// (0.4): full credit inside [ext, 3·ext], half below, 0.3 for an
    /// overshoot past the band.
    fn sweep_strength(&self, sweep: &LiquiditySweep, sweep_volume: f64, avg_volume: f64) -> f64 {
        let volume_strength = if avg_volume > 0.0 {
            ((sweep_volume / avg_volume) / self.config.volume_spike_multiplier).min(1.0)
        } else {
            1.0
        };

        let ext = self.config.sweep_extension_pips;
        let extension_strength = if (ext..=ext * 3.0).contains(&sweep.extension_pips) {
            1.0
        } else if sweep.extension_pips < ext {
            0.5
        } else {
            0.3
        };

        (volume_strength * 0.6 + extension_strength * 0.4).clamp(0.0, 1.0)
    }

    fn average_volume(&self, candles: &[Candle]) -> f64 {
        let start = candles.len().saturating_sub(self.config.avg_volume_period);
        let volumes: Vec<f64> = candles[start..]
            .iter()
            .filter_map(|c| c.volume.map(|v| v as f64))
            .collect();
        if volumes.is_empty() {
            return 0.0;
        }
        volumes.iter().sum::<f64>() / volumes.len() as f64
    }

    pub fn analyze_flow(
        &self,
        pools: &[LiquidityPool],
        sweeps: &[LiquiditySweep],
        current_price: Decimal,
    ) -> LiquidityFlow {
        let nearest = |kind: PoolKind| {
            pools
                .iter()
                .filter(|p| p.kind == kind)
                .min_by_key(|p| (current_price - p.price).abs())
                .cloned()
        };

        let total_sweeps = sweeps.len();
        let confirmed_sweeps = sweeps.iter().filter(|s| s.confirmed).count();

        LiquidityFlow {
            total_pools: pools.len(),
            high_pools: pools.iter().filter(|p| p.kind == PoolKind::High).count(),
            low_pools: pools.iter().filter(|p| p.kind == PoolKind::Low).count(),
            side_pools: pools.iter().filter(|p| p.kind == PoolKind::Side).count(),
            total_sweeps,
            buy_sweeps: sweeps.iter().filter(|s| s.kind == SweepKind::BuySide).count(),
            sell_sweeps: sweeps.iter().filter(|s| s.kind == SweepKind::SellSide).count(),
            confirmed_sweeps,
            sweep_rate: if total_sweeps > 0 {
                confirmed_sweeps as f64 / total_sweeps as f64 * 100.0
            } else {
                0.0
            },
            nearest_high_pool: nearest(PoolKind::High),
            nearest_low_pool: nearest(PoolKind::Low),
            score: self.liquidity_score(pools, sweeps),
        }
    }

    /// `0.6 · avg pool strength + 0.4 · (avg sweep strength · activity)`,
    /// where activity saturates at five sweeps. No pools means no score.
    fn liquidity_score(&self, pools: &[LiquidityPool], sweeps: &[LiquiditySweep]) -> f64 {
        if pools.is_empty() {
            return 0.0;
        }
        let avg_pool = pools.iter().map(|p| p.strength).sum::<f64>() / pools.len() as f64;

        let sweep_component = if sweeps.is_empty() {
            0.0
        } else {
            let avg_sweep = sweeps.iter().map(|s| s.strength).sum::<f64>() / sweeps.len() as f64;
            avg_sweep * (sweeps.len() as f64 / 5.0).min(1.0)
        };

        (avg_pool * 0.6 + sweep_component * 0.4).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::SwingKind;
    use rust_decimal_macros::dec;

    fn analyzer() -> LiquidityAnalyzer {
        // Tests use a pip size of 1 so one price unit is one pip.
        LiquidityAnalyzer::new(LiquidityConfig::default(), dec!(1))
    }

    fn swing(price: Decimal, kind: SwingKind, hours_ago: i64, now: DateTime<Utc>) -> SwingPoint {
        SwingPoint::new(price, now - Duration::hours(hours_ago), kind, 0.5, Some(1_000)).unwrap()
    }

    fn candle(close: Decimal, volume: u64, now: DateTime<Utc>) -> Candle {
        Candle::new(now, close, close + dec!(1), close - dec!(1), close, Some(volume), None, None)
            .unwrap()
    }

    #[test]
    fn adjacent_equal_highs_form_high_pool() {
        let now = Utc::now();
        let swings = vec![
            swing(dec!(2000), SwingKind::High, 2, now),
            swing(dec!(2004), SwingKind::High, 1, now),
        ];
        let pools = analyzer().identify_pools(&swings, dec!(2001), now);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].kind, PoolKind::High);
        assert_eq!(pools[0].price, dec!(2000));
        assert!(pools[0].strength > 0.0 && pools[0].strength <= 1.0);
    }

    #[test]
    fn distant_points_do_not_pool() {
        let now = Utc::now();
        let swings = vec![
            swing(dec!(2000), SwingKind::High, 2, now),
            swing(dec!(2050), SwingKind::High, 1, now),
        ];
        assert!(analyzer().identify_pools(&swings, dec!(2001), now).is_empty());
    }

    #[test]
    fn pool_requires_price_nearby() {
        let now = Utc::now();
        let swings = vec![
            swing(dec!(2000), SwingKind::High, 2, now),
            swing(dec!(2004), SwingKind::High, 1, now),
        ];
        assert!(analyzer().identify_pools(&swings, dec!(2100), now).is_empty());
    }

    #[test]
    fn mixed_pair_forms_side_pool() {
        let now = Utc::now();
        let swings = vec![
            swing(dec!(2000), SwingKind::High, 2, now),
            swing(dec!(1998), SwingKind::Low, 1, now),
        ];
        let pools = analyzer().identify_pools(&swings, dec!(1999), now);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].kind, PoolKind::Side);
    }

    #[test]
    fn buy_side_sweep_above_high_pool() {
        let now = Utc::now();
        let pool = LiquidityPool::new(dec!(2000), 0.5, PoolKind::High, now).unwrap();
        let candles = vec![candle(dec!(2005), 2_000, now)];

        // Price 6 pips beyond the pool at a 5-pip extension threshold.
        let sweeps = analyzer().detect_sweeps(&[pool], &candles, dec!(2006), now);
        assert_eq!(sweeps.len(), 1);
        let sweep = &sweeps[0];
        assert_eq!(sweep.kind, SweepKind::BuySide);
        assert_eq!(sweep.pool_price, dec!(2000));
        assert_eq!(sweep.sweep_price, dec!(2006));
        assert!((sweep.extension_pips - 6.0).abs() < 1e-9);
        // 6 pips sits inside the [5, 15] band: full extension credit.
        assert!(sweep.strength > 0.0);
    }

    #[test]
    fn short_extension_is_not_a_sweep() {
        let now = Utc::now();
        let pool = LiquidityPool::new(dec!(2000), 0.5, PoolKind::High, now).unwrap();
        let candles = vec![candle(dec!(2002), 1_000, now)];
        assert!(analyzer().detect_sweeps(&[pool], &candles, dec!(2003), now).is_empty());
    }

    #[test]
    fn swept_and_side_pools_are_skipped() {
        let now = Utc::now();
        let mut swept = LiquidityPool::new(dec!(2000), 0.5, PoolKind::High, now).unwrap();
        swept.mark_swept(now, dec!(2006));
        let side = LiquidityPool::new(dec!(2010), 0.5, PoolKind::Side, now).unwrap();
        let candles = vec![candle(dec!(2006), 1_000, now)];
        assert!(analyzer()
            .detect_sweeps(&[swept, side], &candles, dec!(2020), now)
            .is_empty());
    }

    #[test]
    fn sell_side_sweep_below_low_pool() {
        let now = Utc::now();
        let pool = LiquidityPool::new(dec!(1990), 0.5, PoolKind::Low, now).unwrap();
        let candles = vec![candle(dec!(1984), 3_000, now)];
        let sweeps = analyzer().detect_sweeps(&[pool], &candles, dec!(1983), now);
        assert_eq!(sweeps.len(), 1);
        assert_eq!(sweeps[0].kind, SweepKind::SellSide);
    }

    #[test]
    fn flow_reports_counts_and_nearest_pools() {
        let now = Utc::now();
        let high_near = LiquidityPool::new(dec!(2005), 0.6, PoolKind::High, now).unwrap();
        let high_far = LiquidityPool::new(dec!(2020), 0.4, PoolKind::High, now).unwrap();
        let low = LiquidityPool::new(dec!(1990), 0.8, PoolKind::Low, now).unwrap();
        let pools = vec![high_near.clone(), high_far, low.clone()];

        let flow = analyzer().analyze_flow(&pools, &[], dec!(2000));
        assert_eq!(flow.total_pools, 3);
        assert_eq!(flow.high_pools, 2);
        assert_eq!(flow.low_pools, 1);
        assert_eq!(flow.nearest_high_pool.as_ref().unwrap().price, high_near.price);
        assert_eq!(flow.nearest_low_pool.as_ref().unwrap().price, low.price);
        // Pure pool component: 0.6 * avg(0.6, 0.4, 0.8).
        assert!((flow.score - 0.36).abs() < 1e-9);
    }

    #[test]
    fn score_is_zero_without_pools() {
        let flow = analyzer().analyze_flow(&[], &[], dec!(2000));
        assert_eq!(flow.score, 0.0);
        assert_eq!(flow.sweep_rate, 0.0);
    }

    #[test]
    fn sweep_activity_saturates_at_five() {
        let now = Utc::now();
        let pool = LiquidityPool::new(dec!(2000), 1.0, PoolKind::High, now).unwrap();
        let sweep = LiquiditySweep {
            kind: SweepKind::BuySide,
            pool_price: dec!(2000),
            sweep_price: dec!(2006),
            sweep_time: now,
            extension_pips: 6.0,
            strength: 1.0,
            reversal_price: None,
            confirmed: false,
        };
        let five = vec![sweep.clone(); 5];
        let ten = vec![sweep; 10];
        let a = analyzer();
        let with_five = a.analyze_flow(&[pool.clone()], &five, dec!(2000)).score;
        let with_ten = a.analyze_flow(&[pool], &ten, dec!(2000)).score;
        assert!((with_five - with_ten).abs() < 1e-9);
        assert!((with_five - 1.0).abs() < 1e-9);
    }
}
