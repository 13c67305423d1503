use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use common::{
    CycleReport, EngineCommand, EngineState, MarketDataProvider, Position, SignalEvent,
};
use strategy::SignalGenerator;
use tracker::PositionTracker;

use crate::connection::Backoff;
use crate::scanner::{ScanConfig, Scanner};

/// Cloneable handle passed to other crates (Telegram, API).
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
    tracker: Arc<PositionTracker>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Immutable copy of every open position, keyed by instrument.
    pub async fn open_positions(&self) -> HashMap<String, Vec<Position>> {
        self.tracker.snapshot().await
    }

    /// Close everything open on `symbol` at its last marked price.
    /// Works in any engine state.
    pub async fn request_manual_close(&self, symbol: &str) -> Vec<Position> {
        info!(instrument = %symbol, "Manual close requested");
        self.tracker.manual_close(symbol).await
    }

    /// Report of the most recent finished (or interrupted) scan cycle.
    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SignalEvent> {
        self.tracker.subscribe()
    }

    pub fn tracker(&self) -> Arc<PositionTracker> {
        self.tracker.clone()
    }
}

/// The main engine: owns the scan loop and processes operator commands.
pub struct Engine {
    scanner: Arc<Scanner>,
    state: Arc<RwLock<EngineState>>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
    /// Wakes the scan loop early on state changes.
    wake: Arc<Notify>,
    command_rx: mpsc::Receiver<EngineCommand>,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        generator: SignalGenerator,
        tracker: Arc<PositionTracker>,
        config: ScanConfig,
    ) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(EngineState::Stopped));
        let last_report = Arc::new(RwLock::new(None));

        let scanner = Arc::new(Scanner::new(
            provider,
            generator,
            tracker.clone(),
            config,
            state.clone(),
        ));

        let handle = EngineHandle {
            command_tx,
            state: state.clone(),
            tracker,
            last_report: last_report.clone(),
        };

        let engine = Engine {
            scanner,
            state,
            last_report,
            wake: Arc::new(Notify::new()),
            command_rx,
        };

        (engine, handle)
    }

    /// Run the engine. This task drives the scan loop and command processing.
    /// Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!("Engine initialized in Stopped state. Waiting for Start command.");

        let mut scan_task: Option<JoinHandle<()>> = None;

        loop {
            match self.command_rx.recv().await {
                Some(EngineCommand::Start) => {
                    let current = *self.state.read().await;
                    match current {
                        EngineState::Running => info!("Engine already running"),
                        EngineState::Paused => {
                            info!("Engine resumed by start");
                            *self.state.write().await = EngineState::Running;
                            self.wake.notify_one();
                        }
                        EngineState::Stopped => {
                            // A previous loop that outlived its grace was aborted
                            if let Some(task) = scan_task.take() {
                                task.abort();
                            }
                            let config = self.scanner.config();
                            info!(
                                interval_secs = config.interval_secs,
                                batch_size = config.batch_size,
                                "Starting scan loop"
                            );
                            *self.state.write().await = EngineState::Running;
                            scan_task = Some(tokio::spawn(scan_loop(
                                self.scanner.clone(),
                                self.state.clone(),
                                self.wake.clone(),
                                self.last_report.clone(),
                            )));
                        }
                    }
                }

                Some(EngineCommand::Stop) => {
                    *self.state.write().await = EngineState::Stopped;
                    self.wake.notify_one();
                    if let Some(mut task) = scan_task.take() {
                        let grace = self.scanner.config().stop_grace();
                        info!(grace = ?grace, "Engine stopping, waiting for in-flight cycle");
                        if tokio::time::timeout(grace, &mut task).await.is_err() {
                            warn!("Scan cycle did not finish within grace period, aborting");
                            task.abort();
                        }
                    }
                    info!("Engine stopped");
                }

                Some(EngineCommand::Pause) => {
                    let current = *self.state.read().await;
                    if current == EngineState::Running {
                        info!("Engine paused, scans suspended, positions still monitored");
                        *self.state.write().await = EngineState::Paused;
                        self.wake.notify_one();
                    }
                }

                Some(EngineCommand::Resume) => {
                    let current = *self.state.read().await;
                    if current == EngineState::Paused {
                        info!("Engine resumed");
                        *self.state.write().await = EngineState::Running;
                        self.wake.notify_one();
                    }
                }

                None => {
                    warn!("Engine command channel closed, shutting down");
                    *self.state.write().await = EngineState::Stopped;
                    if let Some(task) = scan_task.take() {
                        task.abort();
                    }
                    break;
                }
            }
        }
    }
}

/// Periodic scan loop. Exits once the state is `Stopped`; idles while `Paused`.
async fn scan_loop(
    scanner: Arc<Scanner>,
    state: Arc<RwLock<EngineState>>,
    wake: Arc<Notify>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
) {
    let mut backoff = Backoff::default();
    let interval = scanner.config().interval();

    loop {
        let current = *state.read().await;
        match current {
            EngineState::Stopped => break,
            EngineState::Paused => {
                wake.notified().await;
                continue;
            }
            EngineState::Running => {}
        }

        let universe = match scanner.universe().await {
            Ok(universe) => {
                backoff.reset();
                universe
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "Instrument discovery failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }
                continue;
            }
        };

        let report = scanner.run_scan_cycle(&universe).await;
        let elapsed_ms = match (report.started_at, report.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        info!(
            processed = report.processed,
            filtered = report.filtered,
            signals = report.signals_found,
            closed = report.positions_closed,
            errors = report.error_count(),
            interrupted = report.interrupted,
            elapsed_ms,
            "Scan cycle finished"
        );
        *last_report.write().await = Some(report);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
        }
    }

    info!("Scan loop exited");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use common::{Candle, Error, Instrument, OrderBookSnapshot, Result, Ticker};
    use history::MemoryTradeLog;
    use strategy::SignalConfig;
    use tracker::TrackerConfig;

    use super::*;

    /// Provider with one instrument and no usable data; every cycle records
    /// exactly one failure.
    struct EmptyMarket;

    #[async_trait]
    impl MarketDataProvider for EmptyMarket {
        async fn instruments(&self) -> Result<Vec<Instrument>> {
            Ok(vec![Instrument::new("BTCUSDT", 0.1)])
        }
        async fn candles(&self, _: &str, _: &str, _: usize) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn order_book(&self, _: &str, _: usize) -> Result<OrderBookSnapshot> {
            Err(Error::DataUnavailable("no book".into()))
        }
        async fn ticker(&self, symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last_price: 100.0,
                quote_volume: 1e9,
            })
        }
    }

    fn engine() -> (Engine, EngineHandle) {
        let tracker = Arc::new(PositionTracker::new(
            TrackerConfig::default(),
            Arc::new(MemoryTradeLog::new()),
        ));
        Engine::new(
            Arc::new(EmptyMarket),
            SignalGenerator::new(SignalConfig::default()),
            tracker,
            ScanConfig {
                batch_pause_ms: 0,
                stop_grace_secs: 1,
                ..ScanConfig::default()
            },
        )
    }

    async fn wait_for_report(handle: &EngineHandle) -> CycleReport {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(report) = handle.last_report().await {
                    return report;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timeout")
    }

    #[tokio::test]
    async fn start_runs_a_cycle() {
        let (engine, handle) = engine();
        tokio::spawn(engine.run());
        assert_eq!(handle.state().await, EngineState::Stopped);

        handle.send(EngineCommand::Start).await;
        let report = wait_for_report(&handle).await;
        assert_eq!(handle.state().await, EngineState::Running);
        assert_eq!(report.processed, 1);
        assert_eq!(report.error_count(), 1);
        assert!(!report.interrupted);
    }

    #[tokio::test]
    async fn pause_resume_and_stop_transitions() {
        let (engine, handle) = engine();
        tokio::spawn(engine.run());

        // Pause is ignored unless running
        handle.send(EngineCommand::Pause).await;
        handle.send(EngineCommand::Start).await;
        wait_for_report(&handle).await;

        handle.send(EngineCommand::Pause).await;
        handle.send(EngineCommand::Resume).await;
        handle.send(EngineCommand::Pause).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state().await, EngineState::Paused);

        handle.send(EngineCommand::Stop).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state().await, EngineState::Stopped);
    }

    #[tokio::test]
    async fn manual_close_works_while_stopped() {
        let (_engine, handle) = engine();
        assert!(handle.request_manual_close("BTCUSDT").await.is_empty());
        assert!(handle.open_positions().await.is_empty());
    }
}
