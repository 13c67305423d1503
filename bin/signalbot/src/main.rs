mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, EngineCommand, MarketDataProvider, PriceTick, TradeHistory};
use engine::{BinanceFuturesClient, Engine, EventRelay, LogSink, MarkPriceStream, PositionMonitor};
use history::SqliteTradeLog;
use settings::Settings;
use strategy::SignalGenerator;
use telegram_ctrl::{start_bot, BotDeps, TelegramNotifier};
use tracker::PositionTracker;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ───────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("Invalid environment configuration")?;
    let mut settings = Settings::load(&cfg.scanner_config_path)?;
    settings.apply_overrides(|key| std::env::var(key).ok())?;
    settings.validate().context("Invalid scanner settings")?;
    info!(
        config = %cfg.scanner_config_path,
        interval_secs = settings.scan.interval_secs,
        batch_size = settings.scan.batch_size,
        instruments = settings.scan.instruments.len(),
        "SignalBot starting"
    );

    // ── Trade history ────────────────────────────────────────────────────────
    let history: Arc<dyn TradeHistory> = Arc::new(
        SqliteTradeLog::connect(&cfg.database_url)
            .await
            .context("Failed to open trade history database")?,
    );
    info!("Trade history ready");

    // ── Core ─────────────────────────────────────────────────────────────────
    let tracker = Arc::new(PositionTracker::new(settings.tracker.clone(), history.clone()));
    let provider: Arc<dyn MarketDataProvider> =
        Arc::new(BinanceFuturesClient::new(settings.scan.fetch_timeout())?);
    let generator = SignalGenerator::new(settings.signal.clone());
    let (engine, engine_handle) =
        Engine::new(provider, generator, tracker.clone(), settings.scan.clone());

    // ── Price monitoring ─────────────────────────────────────────────────────
    let (tick_tx, tick_rx) = broadcast::channel::<PriceTick>(4096);
    let stream = MarkPriceStream::new(tick_tx);
    let stream_state = stream.state_handle();
    let monitor = PositionMonitor::new(tracker.clone(), tick_rx);

    // ── Notifications ────────────────────────────────────────────────────────
    let mut relay = EventRelay::new(tracker.subscribe()).with_sink(Arc::new(LogSink));
    match &cfg.telegram_token {
        Some(token) if !cfg.telegram_allowed_user_ids.is_empty() => {
            relay = relay.with_sink(Arc::new(TelegramNotifier::new(
                token.clone(),
                &cfg.telegram_allowed_user_ids,
            )));
            let bot_deps = BotDeps {
                engine: engine_handle.clone(),
                allowed_user_ids: Arc::new(cfg.telegram_allowed_user_ids.clone()),
            };
            tokio::spawn(start_bot(token.clone(), bot_deps));
        }
        Some(_) => warn!("TELEGRAM_TOKEN set without TELEGRAM_ALLOWED_USER_IDS, Telegram disabled"),
        None => info!("Telegram not configured, events are logged only"),
    }

    // ── Dashboard API ────────────────────────────────────────────────────────
    let api_state = api::AppState {
        engine: engine_handle.clone(),
        history,
        stream_state,
        dashboard_token: cfg.dashboard_token.clone(),
    };
    let port = cfg.dashboard_port;

    // ── Spawn all tasks ──────────────────────────────────────────────────────
    tokio::spawn(engine.run());
    tokio::spawn(stream.run());
    tokio::spawn(monitor.run());
    tokio::spawn(relay.run());
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, port).await {
            error!(error = %e, "Dashboard API stopped");
        }
    });

    engine_handle.send(EngineCommand::Start).await;

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received. Stopping engine.");
    engine_handle.send(EngineCommand::Stop).await;
    // Give the engine its grace period to wind down the current cycle
    tokio::time::sleep(settings.scan.stop_grace()).await;
    Ok(())
}
