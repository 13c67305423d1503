pub mod config;
pub mod generator;
pub mod indicators;

pub use config::{LevelMode, SignalConfig};
pub use generator::{round_to_tick, Decision, SignalGenerator, TrendAssessment};
pub use indicators::{IndicatorParams, IndicatorSet};
