//! Multi-timeframe confluence scoring.
//!
//! Combines the detector outputs into weighted per-timeframe scores and a
//! cross-timeframe confluence score in [0, 100]. Factor categories and the
//! timeframe mix are weighted from `SmcConfig`; category weight groups are
//! validated to sum to 100 at config load.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::{Candle, Error, Result, Timeframe};

use crate::config::SmcConfig;
use crate::fvg::FvgDetector;
use crate::liquidity::{LiquidityAnalyzer, SweepKind};
use crate::order_block::{ObDetector, ObKind};
use crate::structure::{StructureAnalyzer, TrendState};
use crate::FvgKind;

/// Where a factor came from. Category membership decides which of the four
/// sub-scores the factor feeds; confirmation factors feed none but still
/// dilute the weight normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactorKind {
    Fvg,
    OrderBlock,
    LiquiditySweep,
    Structure,
    PriceRejection,
    BullishConfirmation,
    BearishConfirmation,
}

impl std::fmt::Display for FactorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FactorKind::Fvg => "FVG",
            FactorKind::OrderBlock => "ORDER_BLOCK",
            FactorKind::LiquiditySweep => "LIQUIDITY_SWEEP",
            FactorKind::Structure => "STRUCTURE",
            FactorKind::PriceRejection => "PRICE_REJECTION",
            FactorKind::BullishConfirmation => "BULLISH_CONFIRMATION",
            FactorKind::BearishConfirmation => "BEARISH_CONFIRMATION",
        };
        write!(f, "{label}")
    }
}

/// Directional lean carried by each factor, used by the signal layer's
/// majority vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceFactor {
    pub kind: FactorKind,
    pub bias: Bias,
    pub score: f64,
    pub weight: f64,
    pub description: String,
}

impl ConfluenceFactor {
    pub fn new(
        kind: FactorKind,
        bias: Bias,
        score: f64,
        weight: f64,
        description: impl Into<String>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&score) {
            return Err(Error::InvalidLevel(format!(
                "factor score must be within [0, 1], got {score}"
            )));
        }
        if weight < 0.0 {
            return Err(Error::InvalidLevel(format!(
                "factor weight must be non-negative, got {weight}"
            )));
        }
        Ok(Self { kind, bias, score, weight, description: description.into() })
    }
}

/// Per-timeframe scores. Every `add_factor` recomputes all five scores from
/// the full factor list; nothing is maintained incrementally.
#[derive(Debug, Clone, Serialize)]
pub struct TimeframeAnalysis {
    pub timeframe: Timeframe,
    pub fvg_score: f64,
    pub ob_score: f64,
    pub liquidity_score: f64,
    pub structure_score: f64,
    pub overall_score: f64,
    pub factors: Vec<ConfluenceFactor>,
}

impl TimeframeAnalysis {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            fvg_score: 0.0,
            ob_score: 0.0,
            liquidity_score: 0.0,
            structure_score: 0.0,
            overall_score: 0.0,
            factors: Vec::new(),
        }
    }

    pub fn add_factor(&mut self, factor: ConfluenceFactor) {
        self.factors.push(factor);
        self.recalculate();
    }

    fn recalculate(&mut self) {
        self.fvg_score = 0.0;
        self.ob_score = 0.0;
        self.liquidity_score = 0.0;
        self.structure_score = 0.0;
        self.overall_score = 0.0;
        if self.factors.is_empty() {
            return;
        }

        let total_weight: f64 = self.factors.iter().map(|f| f.weight).sum();
        for factor in &self.factors {
            let weighted = factor.score * factor.weight;
            match factor.kind {
                FactorKind::Fvg => self.fvg_score += weighted,
                FactorKind::OrderBlock => self.ob_score += weighted,
                FactorKind::LiquiditySweep => self.liquidity_score += weighted,
                FactorKind::Structure => self.structure_score += weighted,
                _ => {}
            }
        }

        if total_weight > 0.0 {
            self.fvg_score = self.fvg_score / total_weight * 100.0;
            self.ob_score = self.ob_score / total_weight * 100.0;
            self.liquidity_score = self.liquidity_score / total_weight * 100.0;
            self.structure_score = self.structure_score / total_weight * 100.0;
        }

        self.overall_score = self.fvg_score * 0.25
            + self.ob_score * 0.30
            + self.liquidity_score * 0.25
            + self.structure_score * 0.20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupType {
    FvgOb,
    FvgLiquidity,
    ObLiquidity,
    FvgOnly,
    ObOnly,
    LiquidityOnly,
    Structural,
    InsufficientData,
}

impl std::fmt::Display for SetupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SetupType::FvgOb => "FVG+OB",
            SetupType::FvgLiquidity => "FVG+LIQUIDITY",
            SetupType::ObLiquidity => "OB+LIQUIDITY",
            SetupType::FvgOnly => "FVG_ONLY",
            SetupType::ObOnly => "OB_ONLY",
            SetupType::LiquidityOnly => "LIQUIDITY_ONLY",
            SetupType::Structural => "STRUCTURAL",
            SetupType::InsufficientData => "INSUFFICIENT_DATA",
        };
        write!(f, "{label}")
    }
}

/// Full confluence analysis output.
#[derive(Debug, Clone, Serialize)]
pub struct ConfluenceResult {
    pub instrument: String,
    pub h4: TimeframeAnalysis,
    pub h1: TimeframeAnalysis,
    pub m15: TimeframeAnalysis,
    pub overall_score: f64,
    pub confidence: f64,
    pub setup_type: SetupType,
    pub market_structure: TrendState,
    pub timestamp: DateTime<Utc>,
}

impl ConfluenceResult {
    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.overall_score >= threshold
    }

    /// All factors across the three timeframes, for the signal layer's
    /// direction vote.
    pub fn factors(&self) -> impl Iterator<Item = &ConfluenceFactor> {
        self.h4.factors.iter().chain(self.h1.factors.iter()).chain(self.m15.factors.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalQuality {
    pub overall_quality: f64,
    /// Advisory R:R proxy from the score band, not a measured ratio.
    pub rr_potential: f64,
    pub entry_precision: f64,
    pub timeframe_alignment: f64,
    pub combined_quality: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SetupValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ConfluenceAnalyzer {
    config: SmcConfig,
}

impl ConfluenceAnalyzer {
    pub fn new(config: SmcConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SmcConfig {
        &self.config
    }

    /// Run the full pipeline for one instrument: FVG and order-block
    /// detection on H1 candles, liquidity off the structure snapshot, then
    /// the three timeframe analyses and the weighted overall score.
    pub fn analyze(
        &self,
        h4_candles: &[Candle],
        h1_candles: &[Candle],
        m15_candles: &[Candle],
        current_price: Decimal,
        structure: &StructureAnalyzer,
        now: DateTime<Utc>,
    ) -> ConfluenceResult {
        let pip_size = self.config.pip_size;
        let fvg_detector = FvgDetector::new(self.config.fvg.clone(), pip_size);
        let ob_detector = ObDetector::new(self.config.order_block.clone(), pip_size);
        let liquidity = LiquidityAnalyzer::new(self.config.liquidity.clone(), pip_size);

        let avg_volume = average_volume(h1_candles);
        let gaps = fvg_detector.detect(h1_candles, avg_volume);
        let mut blocks = ob_detector.detect(h1_candles);

        let swings = structure.swing_points();
        let pools = liquidity.identify_pools(&swings, current_price, now);
        let sweeps = liquidity.detect_sweeps(&pools, h1_candles, current_price, now);

        let mut h4 = TimeframeAnalysis::new(Timeframe::H4);
        let mut h1 = TimeframeAnalysis::new(Timeframe::H1);
        let mut m15 = TimeframeAnalysis::new(Timeframe::M15);

        // Deeper timeframes see further back but take fewer factors.
        let plans = [
            (&mut h4, h4_candles, 1440, 3),
            (&mut h1, h1_candles, 720, 2),
            (&mut m15, m15_candles, 240, 1),
        ];
        for (analysis, candles, window_minutes, cap) in plans {
            if candles.is_empty() {
                continue;
            }
            let active_gaps = fvg_detector.active(&gaps, current_price, now, window_minutes);
            for gap in active_gaps.iter().take(cap) {
                let bias = match gap.kind {
                    FvgKind::Bullish => Bias::Bullish,
                    FvgKind::Bearish => Bias::Bearish,
                };
                if let Ok(factor) = ConfluenceFactor::new(
                    FactorKind::Fvg,
                    bias,
                    gap.strength,
                    self.config.fvg_weight / 100.0,
                    format!("{} FVG at {}", gap.kind, gap.mid_price),
                ) {
                    analysis.add_factor(factor);
                }
            }

            let active_blocks = ob_detector.active(&mut blocks, current_price, now, window_minutes);
            for block in active_blocks.iter().take(cap) {
                let bias = match block.kind {
                    ObKind::Bullish => Bias::Bullish,
                    ObKind::Bearish => Bias::Bearish,
                };
                if let Ok(factor) = ConfluenceFactor::new(
                    FactorKind::OrderBlock,
                    bias,
                    block.strength,
                    self.config.ob_weight / 100.0,
                    format!("{} OB at {}", block.kind, block.price),
                ) {
                    analysis.add_factor(factor);
                }
            }

            // Established trend context applies to every timeframe.
            if structure.state() != TrendState::Ranging {
                let bias = match structure.state() {
                    TrendState::Uptrend => Bias::Bullish,
                    TrendState::Downtrend => Bias::Bearish,
                    TrendState::Ranging => Bias::Neutral,
                };
                if let Ok(factor) = ConfluenceFactor::new(
                    FactorKind::Structure,
                    bias,
                    structure.trend_strength().clamp(0.0, 1.0),
                    self.config.structure_weight / 100.0,
                    format!("{} structure", structure.state()),
                ) {
                    analysis.add_factor(factor);
                }
            }
        }

        // H1 carries the liquidity picture: the last two sweeps. A sweep is
        // read as a reversal cue, so its bias opposes the swept side.
        for sweep in sweeps.iter().rev().take(2) {
            let bias = match sweep.kind {
                SweepKind::BuySide => Bias::Bearish,
                SweepKind::SellSide => Bias::Bullish,
            };
            if let Ok(factor) = ConfluenceFactor::new(
                FactorKind::LiquiditySweep,
                bias,
                sweep.strength,
                self.config.liquidity_weight / 100.0,
                format!("{} sweep at {}", sweep.kind, sweep.pool_price),
            ) {
                h1.add_factor(factor);
            }
        }

        self.add_m15_price_action(&mut m15, m15_candles);

        let overall_score = h4.overall_score * self.config.h4_weight / 100.0
            + h1.overall_score * self.config.h1_weight / 100.0
            + m15.overall_score * self.config.m15_weight / 100.0;
        let confidence = (overall_score / 100.0).clamp(0.0, 1.0);
        let setup_type = setup_type_from(&h4);

        info!(
            instrument = structure.instrument(),
            overall_score,
            confidence,
            setup = %setup_type,
            "confluence analysis"
        );

        ConfluenceResult {
            instrument: structure.instrument().to_string(),
            h4,
            h1,
            m15,
            overall_score,
            confidence,
            setup_type,
            market_structure: structure.state(),
            timestamp: now,
        }
    }

    /// Micro price action on the last two M15 candles, one factor at most:
    /// a doji reads as rejection, an engulfing-style flip as confirmation.
    fn add_m15_price_action(&self, m15: &mut TimeframeAnalysis, candles: &[Candle]) {
        let [prev, last] = match candles {
            [.., prev, last] => [prev, last],
            _ => return,
        };

        let factor = if last.is_doji(0.1) {
            ConfluenceFactor::new(
                FactorKind::PriceRejection,
                Bias::Neutral,
                0.6,
                0.5,
                "Doji at key level",
            )
        } else if last.is_bullish() && prev.is_bearish() && last.close > prev.close {
            ConfluenceFactor::new(
                FactorKind::BullishConfirmation,
                Bias::Bullish,
                0.7,
                0.5,
                "Bullish confirmation",
            )
        } else if last.is_bearish() && prev.is_bullish() && last.close < prev.close {
            ConfluenceFactor::new(
                FactorKind::BearishConfirmation,
                Bias::Bearish,
                0.7,
                0.5,
                "Bearish confirmation",
            )
        } else {
            return;
        };

        if let Ok(factor) = factor {
            m15.add_factor(factor);
        }
    }

    /// Advisory quality metrics for an analysis, without touching price.
    pub fn signal_quality(&self, result: &ConfluenceResult) -> SignalQuality {
        let rr_potential = if result.overall_score > 80.0 {
            1.0
        } else if result.overall_score > 70.0 {
            0.8
        } else {
            0.6
        };

        let mut entry_precision = 1.0;
        if !result.m15.factors.is_empty() {
            let precision_factors = result
                .m15
                .factors
                .iter()
                .filter(|f| {
                    matches!(
                        f.kind,
                        FactorKind::PriceRejection
                            | FactorKind::BullishConfirmation
                            | FactorKind::BearishConfirmation
                    )
                })
                .count();
            entry_precision = (precision_factors as f64 / 2.0).min(1.0);
        }

        let mut timeframe_alignment = 1.0;
        if self.config.require_multi_timeframe {
            let aligned = [&result.h4, &result.h1, &result.m15]
                .iter()
                .filter(|tf| tf.overall_score > 60.0)
                .count();
            timeframe_alignment = aligned as f64 / 3.0;
            entry_precision *= timeframe_alignment;
        }

        SignalQuality {
            overall_quality: result.overall_score,
            rr_potential,
            entry_precision,
            timeframe_alignment,
            combined_quality: (result.overall_score + rr_potential + entry_precision) / 3.0,
        }
    }

    /// Structured validation of an analysis against the configured
    /// requirements. Failures are data, not errors.
    pub fn validate_setup(&self, result: &ConfluenceResult) -> SetupValidation {
        let mut validation = SetupValidation { is_valid: true, ..Default::default() };

        if !result.meets_threshold(self.config.confluence_threshold) {
            validation.is_valid = false;
            validation.errors.push(format!(
                "confluence score {:.1} below threshold {:.1}",
                result.overall_score, self.config.confluence_threshold
            ));
        }

        if self.config.require_multi_timeframe
            && result.h4.overall_score < 50.0
            && result.h1.overall_score < 50.0
            && result.m15.overall_score < 50.0
        {
            validation.is_valid = false;
            validation.errors.push("insufficient multi-timeframe alignment".to_string());
        }

        let has_bullish = result.h4.factors.iter().any(|f| f.bias == Bias::Bullish);
        let has_bearish = result.h4.factors.iter().any(|f| f.bias == Bias::Bearish);
        if has_bullish && has_bearish {
            validation.warnings.push("conflicting factor biases detected".to_string());
        }

        if !validation.is_valid {
            debug!(errors = ?validation.errors, "setup rejected");
        }
        validation
    }
}

fn setup_type_from(h4: &TimeframeAnalysis) -> SetupType {
    if h4.factors.is_empty() {
        return SetupType::InsufficientData;
    }
    let has = |kind: FactorKind| h4.factors.iter().any(|f| f.kind == kind);
    let fvg = has(FactorKind::Fvg);
    let ob = has(FactorKind::OrderBlock);
    let liquidity = has(FactorKind::LiquiditySweep);

    match (fvg, ob, liquidity) {
        (true, true, _) => SetupType::FvgOb,
        (true, false, true) => SetupType::FvgLiquidity,
        (false, true, true) => SetupType::ObLiquidity,
        (true, false, false) => SetupType::FvgOnly,
        (false, true, false) => SetupType::ObOnly,
        (false, false, true) => SetupType::LiquidityOnly,
        (false, false, false) => SetupType::Structural,
    }
}

fn average_volume(candles: &[Candle]) -> f64 {
    let volumes: Vec<f64> =
        candles.iter().filter_map(|c| c.volume.map(|v| v as f64)).collect();
    if volumes.is_empty() {
        return 0.0;
    }
    volumes.iter().sum::<f64>() / volumes.len() as f64
}
