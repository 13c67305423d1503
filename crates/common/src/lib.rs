pub mod config;
pub mod error;
pub mod exchange;
pub mod position;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::{MarketDataProvider, NotificationSink, TradeHistory};
pub use position::*;
pub use types::*;
