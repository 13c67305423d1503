pub mod rest;
pub mod stream;

pub use rest::BinanceFuturesClient;
pub use stream::MarkPriceStream;
