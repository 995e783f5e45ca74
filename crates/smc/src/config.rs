use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use common::{Error, Result};

/// Fair Value Gap detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FvgConfig {
    /// Sweet-spot lower bound for gap size, in pips.
    pub min_size_pips: f64,
    /// Sweet-spot upper bound for gap size, in pips.
    pub max_size_pips: f64,
    /// Gaps below this strength are discarded at detection time.
    pub min_strength: f64,
    /// Drop gaps smaller than `min_size_pips` when selecting active gaps.
    pub ignore_small_fvgs: bool,
    /// Require a volume spike for full volume credit in strength scoring.
    pub require_volume_spike: bool,
    /// Volume considered a spike when above `avg_volume * volume_multiplier`.
    pub volume_multiplier: f64,
    /// Tolerance around the gap boundary when deciding a fill, in pips.
    pub fill_tolerance_pips: f64,
}

impl Default for FvgConfig {
    fn default() -> Self {
        Self {
            min_size_pips: 5.0,
            max_size_pips: 100.0,
            min_strength: 0.3,
            ignore_small_fvgs: true,
            require_volume_spike: false,
            volume_multiplier: 1.5,
            fill_tolerance_pips: 2.0,
        }
    }
}

impl FvgConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size_pips <= 0.0 || self.max_size_pips <= self.min_size_pips {
            return Err(Error::Config(format!(
                "FVG size range invalid: [{}, {}]",
                self.min_size_pips, self.max_size_pips
            )));
        }
        if !(0.0..=1.0).contains(&self.min_strength) {
            return Err(Error::Config(format!(
                "FVG min_strength must be within [0, 1], got {}",
                self.min_strength
            )));
        }
        if self.volume_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "FVG volume_multiplier must be >= 1, got {}",
                self.volume_multiplier
            )));
        }
        Ok(())
    }
}

/// Order block detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBlockConfig {
    /// Minimum candles required before detection runs.
    pub lookback_candles: usize,
    /// Minimum candle range (in price units) for a candidate.
    pub min_candle_range: Decimal,
    /// Maximum body-to-range ratio for a valid block.
    pub wick_ratio_threshold: f64,
    /// Volume above `avg * min_volume_multiplier` earns full volume credit.
    pub min_volume_multiplier: f64,
    /// Window for the rolling average volume.
    pub avg_volume_periods: usize,
    /// Require a rejection wick for full wick credit.
    pub require_rejection: bool,
    /// Touches needed before a block can be declared respected.
    pub min_touches: u32,
    /// Minimum validity strength.
    pub min_strength: f64,
    /// Credit blocks sitting near round-number levels.
    pub near_round_numbers: bool,
    /// Distance from a round number still counted as "near", in pips.
    pub round_number_pips: f64,
}

impl Default for OrderBlockConfig {
    fn default() -> Self {
        Self {
            lookback_candles: 20,
            min_candle_range: dec!(0.5),
            wick_ratio_threshold: 0.6,
            min_volume_multiplier: 1.5,
            avg_volume_periods: 20,
            require_rejection: true,
            min_touches: 2,
            min_strength: 0.3,
            near_round_numbers: true,
            round_number_pips: 50.0,
        }
    }
}

impl OrderBlockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lookback_candles < 5 {
            return Err(Error::Config(format!(
                "order block lookback_candles must be >= 5, got {}",
                self.lookback_candles
            )));
        }
        if self.min_candle_range <= Decimal::ZERO {
            return Err(Error::Config(
                "order block min_candle_range must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.wick_ratio_threshold) {
            return Err(Error::Config(format!(
                "order block wick_ratio_threshold must be within [0, 1], got {}",
                self.wick_ratio_threshold
            )));
        }
        Ok(())
    }
}

/// Liquidity pool and sweep detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    /// Maximum distance between paired swing points, in pips.
    pub pool_range_pips: f64,
    /// Touch count at which a pool earns full touch credit.
    pub min_pool_touches: u32,
    /// Minimum price extension beyond a pool for a sweep, in pips.
    pub sweep_extension_pips: f64,
    /// Volume above `avg * volume_spike_multiplier` earns full sweep credit.
    pub volume_spike_multiplier: f64,
    /// Window for the rolling average volume.
    pub avg_volume_period: usize,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            pool_range_pips: 10.0,
            min_pool_touches: 3,
            sweep_extension_pips: 5.0,
            volume_spike_multiplier: 2.0,
            avg_volume_period: 20,
        }
    }
}

impl LiquidityConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_range_pips <= 0.0 {
            return Err(Error::Config(
                "liquidity pool_range_pips must be positive".into(),
            ));
        }
        if self.sweep_extension_pips <= 0.0 {
            return Err(Error::Config(
                "liquidity sweep_extension_pips must be positive".into(),
            ));
        }
        if self.volume_spike_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "liquidity volume_spike_multiplier must be >= 1, got {}",
                self.volume_spike_multiplier
            )));
        }
        Ok(())
    }
}

/// Market structure analysis parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Swing window for trend recomputation; history is pruned at twice this.
    pub trend_period: usize,
    /// Swing points required on each side before trend is evaluated.
    pub min_swing_points: usize,
    /// Tolerance when matching a break for confirmation, in pips.
    pub break_confirm_tolerance_pips: f64,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            trend_period: 20,
            min_swing_points: 3,
            break_confirm_tolerance_pips: 10.0,
        }
    }
}

impl StructureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trend_period < 2 {
            return Err(Error::Config(format!(
                "structure trend_period must be >= 2, got {}",
                self.trend_period
            )));
        }
        if self.min_swing_points < 2 {
            return Err(Error::Config(format!(
                "structure min_swing_points must be >= 2, got {}",
                self.min_swing_points
            )));
        }
        Ok(())
    }
}

/// Top-level SMC configuration: detector parameters plus the confluence
/// weight tables. Construct via `Default` and adjust, or load from TOML.
///
/// Example `config/smc.toml`:
/// ```toml
/// pip_size = "0.1"
/// confluence_threshold = 80.0
/// fvg_weight = 25.0
/// ob_weight = 30.0
/// liquidity_weight = 25.0
/// structure_weight = 20.0
///
/// [fvg]
/// min_size_pips = 5.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmcConfig {
    /// Price value of one pip for the instrument under analysis.
    pub pip_size: Decimal,

    pub fvg: FvgConfig,
    pub order_block: OrderBlockConfig,
    pub liquidity: LiquidityConfig,
    pub structure: StructureConfig,

    /// Minimum overall confluence score for signal generation.
    pub confluence_threshold: f64,

    // Category weights; must sum to 100.
    pub fvg_weight: f64,
    pub ob_weight: f64,
    pub liquidity_weight: f64,
    pub structure_weight: f64,

    // Timeframe weights; must sum to 100.
    pub h4_weight: f64,
    pub h1_weight: f64,
    pub m15_weight: f64,

    /// Gate signal quality on multi-timeframe alignment.
    pub require_multi_timeframe: bool,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            pip_size: dec!(0.1),
            fvg: FvgConfig::default(),
            order_block: OrderBlockConfig::default(),
            liquidity: LiquidityConfig::default(),
            structure: StructureConfig::default(),
            confluence_threshold: 80.0,
            fvg_weight: 25.0,
            ob_weight: 30.0,
            liquidity_weight: 25.0,
            structure_weight: 20.0,
            h4_weight: 40.0,
            h1_weight: 35.0,
            m15_weight: 25.0,
            require_multi_timeframe: true,
        }
    }
}

/// Weight groups may drift from 100 by at most this much.
const WEIGHT_SUM_TOLERANCE: f64 = 0.1;

impl SmcConfig {
    /// Validate the full configuration. Called by the loaders; a violation is
    /// a startup error, never a runtime one.
    pub fn validate(&self) -> Result<()> {
        if self.pip_size <= Decimal::ZERO {
            return Err(Error::Config("pip_size must be positive".into()));
        }

        if !(50.0..=100.0).contains(&self.confluence_threshold) {
            return Err(Error::Config(format!(
                "confluence_threshold must be within [50, 100], got {}",
                self.confluence_threshold
            )));
        }

        let category_sum =
            self.fvg_weight + self.ob_weight + self.liquidity_weight + self.structure_weight;
        if (category_sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::Config(format!(
                "category weights must sum to 100, got {category_sum}"
            )));
        }

        let tf_sum = self.h4_weight + self.h1_weight + self.m15_weight;
        if (tf_sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::Config(format!(
                "timeframe weights must sum to 100, got {tf_sum}"
            )));
        }

        self.fvg.validate()?;
        self.order_block.validate()?;
        self.liquidity.validate()?;
        self.structure.validate()?;
        Ok(())
    }

    /// Load and validate from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SmcConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse '{path}': {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
