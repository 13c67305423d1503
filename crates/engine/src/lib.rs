pub mod binance;
pub mod connection;
pub mod lifecycle;
pub mod monitor;
pub mod relay;
pub mod scanner;

pub use binance::{BinanceFuturesClient, MarkPriceStream};
pub use connection::{Backoff, ConnectionState};
pub use lifecycle::{Engine, EngineHandle};
pub use monitor::PositionMonitor;
pub use relay::{EventRelay, LogSink};
pub use scanner::{ScanConfig, Scanner};
