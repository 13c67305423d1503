pub mod manager;

pub use manager::{PositionTracker, PriceUpdate, TrackerConfig};
