pub mod config;
pub mod confluence;
pub mod fvg;
pub mod liquidity;
pub mod order_block;
pub mod structure;

pub use config::{
    FvgConfig, LiquidityConfig, OrderBlockConfig, SmcConfig, StructureConfig,
};
pub use confluence::{
    Bias, ConfluenceAnalyzer, ConfluenceFactor, ConfluenceResult, FactorKind, SetupType,
    SetupValidation, SignalQuality, TimeframeAnalysis,
};
pub use fvg::{FairValueGap, FvgDetector, FvgKind};
pub use liquidity::{LiquidityAnalyzer, LiquidityFlow, LiquidityPool, LiquiditySweep, PoolKind, SweepKind};
pub use order_block::{ObDetector, ObKind, OrderBlock};
pub use structure::{BreakKind, StructureAnalyzer, StructureBreak, TrendState};
