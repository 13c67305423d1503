use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use common::{
    BookLevel, Candle, Error, Instrument, MarketDataProvider, OrderBookSnapshot, Result, Ticker,
};

const BASE_URL: &str = "https://fapi.binance.com";

/// Binance error code for an unknown symbol.
const INVALID_SYMBOL: i64 = -1121;

/// Depth limits the futures API accepts.
const DEPTH_LIMITS: [usize; 7] = [5, 10, 20, 50, 100, 500, 1000];

/// Public-endpoint REST client for Binance USDⓈ-M futures market data.
///
/// No API key is needed; every call is an unsigned GET.
pub struct BinanceFuturesClient {
    base_url: String,
    http: Client,
}

impl BinanceFuturesClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(BASE_URL, request_timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(map_status(status, &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl MarketDataProvider for BinanceFuturesClient {
    async fn instruments(&self) -> Result<Vec<Instrument>> {
        let body = self.get("/fapi/v1/exchangeInfo", &[]).await?;
        let instruments = parse_exchange_info(&body)?;
        debug!(count = instruments.len(), "Fetched futures instrument universe");
        Ok(instruments)
    }

    async fn candles(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.get("/fapi/v1/klines", &query).await?;
        parse_klines(&body)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let limit = DEPTH_LIMITS
            .iter()
            .copied()
            .find(|l| *l >= depth)
            .unwrap_or(1000);
        let query = [("symbol", symbol.to_string()), ("limit", limit.to_string())];
        let body = self.get("/fapi/v1/depth", &query).await?;
        parse_depth(&body, depth)
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        let query = [("symbol", symbol.to_string())];
        let body = self.get("/fapi/v1/ticker/24hr", &query).await?;
        parse_ticker(&body)
    }
}

// ─── Error mapping ───────────────────────────────────────────────────────────

fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

fn map_status(status: StatusCode, body: &str) -> Error {
    let api = serde_json::from_str::<ApiError>(body).ok();
    if status == StatusCode::NOT_FOUND || api.as_ref().map(|a| a.code) == Some(INVALID_SYMBOL) {
        let msg = api.map(|a| a.msg).unwrap_or_else(|| body.to_string());
        return Error::NotFound(msg);
    }
    Error::Exchange(format!("HTTP {status}: {body}"))
}

// ─── Response parsing ────────────────────────────────────────────────────────

fn num(raw: &str, field: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| Error::Exchange(format!("non-numeric {field}: '{raw}'")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(default)]
    contract_type: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

/// Trading USDT-quoted perpetuals with their `PRICE_FILTER` tick size.
pub(crate) fn parse_exchange_info(body: &str) -> Result<Vec<Instrument>> {
    let info: ExchangeInfo = serde_json::from_str(body)?;
    let instruments = info
        .symbols
        .into_iter()
        .filter(|s| s.status == "TRADING" && s.contract_type == "PERPETUAL" && s.quote_asset == "USDT")
        .map(|s| {
            let tick_size = s
                .filters
                .iter()
                .find(|f| f.get("filterType").and_then(|v| v.as_str()) == Some("PRICE_FILTER"))
                .and_then(|f| f.get("tickSize"))
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            Instrument::new(s.symbol, tick_size)
        })
        .collect();
    Ok(instruments)
}

/// Kline rows: `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub(crate) fn parse_klines(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(body)?;
    rows.iter()
        .map(|row| {
            let field = |i: usize, name: &str| -> Result<f64> {
                let raw = row
                    .get(i)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::Exchange(format!("kline row missing {name}")))?;
                num(raw, name)
            };
            let open_ms = row
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Error::Exchange("kline row missing open time".into()))?;
            let open_time = Utc
                .timestamp_millis_opt(open_ms)
                .single()
                .ok_or_else(|| Error::Exchange(format!("bad kline open time {open_ms}")))?;
            Ok(Candle {
                open_time,
                open: field(1, "open")?,
                high: field(2, "high")?,
                low: field(3, "low")?,
                close: field(4, "close")?,
                volume: field(5, "volume")?,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct Depth {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

pub(crate) fn parse_depth(body: &str, depth: usize) -> Result<OrderBookSnapshot> {
    let raw: Depth = serde_json::from_str(body)?;
    let levels = |side: Vec<(String, String)>| -> Result<Vec<BookLevel>> {
        side.into_iter()
            .take(depth)
            .map(|(p, q)| {
                Ok(BookLevel {
                    price: num(&p, "price")?,
                    quantity: num(&q, "quantity")?,
                })
            })
            .collect()
    };
    Ok(OrderBookSnapshot {
        bids: levels(raw.bids)?,
        asks: levels(raw.asks)?,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    last_price: String,
    quote_volume: String,
}

pub(crate) fn parse_ticker(body: &str) -> Result<Ticker> {
    let t: Ticker24h = serde_json::from_str(body)?;
    Ok(Ticker {
        last_price: num(&t.last_price, "lastPrice")?,
        quote_volume: num(&t.quote_volume, "quoteVolume")?,
        symbol: t.symbol,
    })
}
