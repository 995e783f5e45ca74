//! Trade signal generation from confluence analysis: direction vote, price
//! levels, position sizing, and signal validation.

pub mod config;
pub mod generator;

pub use config::TradingConfig;
pub use generator::{SignalGenerator, SignalValidation, TradeSignal};
