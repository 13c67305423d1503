use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use common::{
    Candle, CycleReport, Direction, EngineState, Error, Instrument, MarketDataProvider, Result,
    ScanFailure,
};
use strategy::{Decision, IndicatorSet, SignalGenerator, TrendAssessment};
use tracker::{PositionTracker, PriceUpdate};

/// `[scan]` section of the scanner settings file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Explicit universe. Empty means every discovered instrument.
    pub instruments: Vec<String>,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub fetch_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub timeframe: String,
    pub candle_limit: usize,
    pub poc_timeframes: Vec<String>,
    pub order_book_depth: usize,
    /// 24h quote volume (USDT) below which an instrument is skipped.
    pub min_quote_volume: f64,
    /// Relative bid/ask spread above which an instrument is skipped.
    pub max_spread: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            interval_secs: 300,
            batch_size: 10,
            batch_pause_ms: 2000,
            fetch_timeout_secs: 10,
            stop_grace_secs: 10,
            timeframe: "5m".into(),
            candle_limit: 100,
            poc_timeframes: vec!["3m".into(), "5m".into(), "15m".into()],
            order_book_depth: 5,
            min_quote_volume: 300_000.0,
            max_spread: 0.003,
        }
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be >= 1".into()));
        }
        if self.interval_secs == 0 || self.fetch_timeout_secs == 0 {
            return Err(Error::Config(
                "interval_secs and fetch_timeout_secs must be positive".into(),
            ));
        }
        if self.candle_limit < 2 || self.timeframe.trim().is_empty() {
            return Err(Error::Config(
                "candle_limit must be >= 2 and timeframe non-empty".into(),
            ));
        }
        Ok(())
    }
}

/// What happened to one instrument this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Failed the liquidity pre-filter.
    Filtered,
    Evaluated { signal: bool, closed: usize },
}

/// Runs scan cycles over an instrument universe.
///
/// Each instrument is fetched, evaluated, and reconciled with the tracker
/// independently; failures stay contained to that instrument.
pub struct Scanner {
    provider: Arc<dyn MarketDataProvider>,
    generator: SignalGenerator,
    tracker: Arc<PositionTracker>,
    config: ScanConfig,
    state: Arc<RwLock<EngineState>>,
}

impl Scanner {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        generator: SignalGenerator,
        tracker: Arc<PositionTracker>,
        config: ScanConfig,
        state: Arc<RwLock<EngineState>>,
    ) -> Self {
        Self {
            provider,
            generator,
            tracker,
            config,
            state,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    async fn is_running(&self) -> bool {
        *self.state.read().await == EngineState::Running
    }

    /// Resolve the instruments to scan. Fails only when the provider itself
    /// is unreachable, which is the caller's cue to back off.
    pub async fn universe(&self) -> Result<Vec<Instrument>> {
        let all = self
            .fetch("instruments", "*", self.provider.instruments())
            .await?;
        if self.config.instruments.is_empty() {
            return Ok(all);
        }
        let wanted: Vec<Instrument> = all
            .into_iter()
            .filter(|i| self.config.instruments.contains(&i.symbol))
            .collect();
        if wanted.len() < self.config.instruments.len() {
            let missing: Vec<&String> = self
                .config
                .instruments
                .iter()
                .filter(|s| !wanted.iter().any(|i| &i.symbol == *s))
                .collect();
            warn!(?missing, "Configured instruments not tradeable, skipping");
        }
        Ok(wanted)
    }

    /// One pass over `universe` in sequential batches of parallel tasks.
    ///
    /// The running flag is checked before the first batch and after each
    /// one; leaving `Running` ends the cycle early with `interrupted` set.
    pub async fn run_scan_cycle(self: &Arc<Self>, universe: &[Instrument]) -> CycleReport {
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..CycleReport::default()
        };

        if !self.is_running().await {
            report.interrupted = true;
            report.finished_at = Some(Utc::now());
            return report;
        }

        let batches: Vec<&[Instrument]> = universe.chunks(self.config.batch_size.max(1)).collect();
        let batch_count = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            let mut tasks = JoinSet::new();
            for instrument in batch {
                let this = Arc::clone(self);
                let instrument = instrument.clone();
                tasks.spawn(async move {
                    let result = this.scan_instrument(&instrument).await;
                    (instrument.symbol, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                report.processed += 1;
                match joined {
                    Ok((_, Ok(Outcome::Filtered))) => report.filtered += 1,
                    Ok((_, Ok(Outcome::Evaluated { signal, closed }))) => {
                        if signal {
                            report.signals_found += 1;
                        }
                        report.positions_closed += closed;
                    }
                    Ok((symbol, Err(e))) => {
                        warn!(instrument = %symbol, error = %e, retryable = e.is_retryable(), "Instrument skipped this cycle");
                        report.errors.push(ScanFailure {
                            symbol,
                            error: e.to_string(),
                            retryable: e.is_retryable(),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Instrument task panicked");
                        report.errors.push(ScanFailure {
                            symbol: "<task>".into(),
                            error: e.to_string(),
                            retryable: false,
                        });
                    }
                }
            }

            if !self.is_running().await {
                info!(batch = i + 1, of = batch_count, "Scan cycle interrupted");
                report.interrupted = true;
                break;
            }
            if i + 1 < batch_count {
                tokio::time::sleep(self.config.batch_pause()).await;
            }
        }

        report.finished_at = Some(Utc::now());
        report
    }

    /// Fetch, evaluate, then apply price updates before any new open.
    async fn scan_instrument(&self, instrument: &Instrument) -> Result<Outcome> {
        let symbol = instrument.symbol.as_str();
        let ticker = self.fetch("ticker", symbol, self.provider.ticker(symbol)).await?;
        let open = self.tracker.positions(symbol).await;

        // Instruments we already hold are always evaluated so their
        // positions keep being managed.
        if open.is_empty() && !self.passes_liquidity(instrument, ticker.quote_volume).await? {
            return Ok(Outcome::Filtered);
        }

        let candles = self
            .fetch(
                "candles",
                symbol,
                self.provider
                    .candles(symbol, &self.config.timeframe, self.config.candle_limit),
            )
            .await?;
        let poc_frames = self.poc_frames(symbol, &candles).await;
        let frame_refs: Vec<&[Candle]> = poc_frames.iter().map(Vec::as_slice).collect();

        let params = self.generator.config().indicator_params();
        let indicators = IndicatorSet::compute(&candles, &params, &frame_refs).ok_or_else(|| {
            Error::DataUnavailable(format!(
                "{} candles, need at least {}",
                candles.len(),
                params.rsi_period + 1
            ))
        })?;

        let now = Utc::now();
        let decision = self.generator.evaluate(instrument, &candles, &indicators, now);

        // Price update and trend checks for what is already open.
        let mut closed = 0;
        if !open.is_empty() {
            let mut reversal: Option<Direction> = None;
            let mut reinforcements = Vec::new();
            for position in &open {
                let against = position.direction().opposite();
                if decision.direction() == Some(against) {
                    reversal = Some(against);
                    continue;
                }
                match self.generator.assess_trend(
                    position.direction(),
                    position.entry(),
                    instrument,
                    &candles,
                    &indicators,
                ) {
                    TrendAssessment::Reversal => {
                        reversal.get_or_insert(against);
                    }
                    TrendAssessment::Reinforced(targets) => {
                        reinforcements.push((position.direction(), targets))
                    }
                    TrendAssessment::Unchanged => {}
                }
            }

            let mut update = PriceUpdate::new(ticker.last_price, now);
            update.reversal = reversal;
            closed = self.tracker.refresh_price(symbol, update).await.len();

            for (direction, targets) in reinforcements {
                self.tracker.reinforce(symbol, direction, targets).await;
            }
        }

        let signal = match decision {
            Decision::Emit(signal) => {
                info!(
                    instrument = %symbol,
                    direction = %signal.direction,
                    confidence = signal.confidence,
                    entry = signal.entry,
                    "Signal emitted"
                );
                if let Err(reason) = self.tracker.open(signal).await {
                    info!(instrument = %symbol, reason = %reason, "Signal not opened");
                }
                true
            }
            Decision::Rejected { direction, reason } => {
                info!(instrument = %symbol, direction = %direction, reason = %reason, "Setup rejected");
                false
            }
            Decision::Neutral => false,
        };

        Ok(Outcome::Evaluated { signal, closed })
    }

    async fn passes_liquidity(&self, instrument: &Instrument, quote_volume: f64) -> Result<bool> {
        let symbol = instrument.symbol.as_str();
        if quote_volume < self.config.min_quote_volume {
            debug!(instrument = %symbol, quote_volume, "Below 24h volume floor");
            return Ok(false);
        }
        let book = self
            .fetch(
                "order book",
                symbol,
                self.provider.order_book(symbol, self.config.order_book_depth),
            )
            .await?;
        match book.spread() {
            Some(spread) if spread <= self.config.max_spread => Ok(true),
            spread => {
                debug!(instrument = %symbol, ?spread, "Spread too wide or book empty");
                Ok(false)
            }
        }
    }

    /// Candle sets pooled for the point of control. A frame that fails to
    /// load is left out rather than failing the instrument.
    async fn poc_frames(&self, symbol: &str, primary: &[Candle]) -> Vec<Vec<Candle>> {
        let mut frames = Vec::with_capacity(self.config.poc_timeframes.len());
        for tf in &self.config.poc_timeframes {
            if *tf == self.config.timeframe {
                frames.push(primary.to_vec());
                continue;
            }
            let fetched = self
                .fetch(
                    "poc candles",
                    symbol,
                    self.provider.candles(symbol, tf, self.config.candle_limit),
                )
                .await;
            match fetched {
                Ok(candles) => frames.push(candles),
                Err(e) => debug!(instrument = %symbol, timeframe = %tf, error = %e, "POC frame unavailable"),
            }
        }
        frames
    }

    /// Bound one provider call by the fetch timeout.
    async fn fetch<T>(
        &self,
        what: &str,
        symbol: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.fetch_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{what} for {symbol} after {}s",
                self.config.fetch_timeout_secs
            ))),
        }
    }
}
