use std::sync::Arc;

use teloxide::{dispatching::UpdateHandler, prelude::*, utils::command::BotCommands};
use tracing::{info, warn};

use common::{EngineCommand, EngineState, Position};
use engine::EngineHandle;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Dependencies injected into every handler via `dptree`.
#[derive(Clone)]
pub struct BotDeps {
    pub engine: EngineHandle,
    pub allowed_user_ids: Arc<Vec<i64>>,
}

/// Telegram bot commands exposed to the operator.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "SignalBot commands:")]
pub enum Command {
    #[command(description = "Start scanning")]
    Start,
    #[command(description = "Stop scanning (open positions stay monitored)")]
    Stop,
    #[command(description = "Pause scan cycles")]
    Pause,
    #[command(description = "Resume scan cycles")]
    Resume,
    #[command(description = "Show engine state and last cycle")]
    Status,
    #[command(description = "List open positions")]
    Positions,
    #[command(description = "Close positions on an instrument, e.g. /close BTCUSDT")]
    Close(String),
}

/// Start the Telegram bot in long-polling mode.
pub async fn start_bot(token: String, deps: BotDeps) {
    let bot = Bot::new(token);
    let deps = Arc::new(deps);

    info!("Telegram bot starting (long-polling)");

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync>> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Start].endpoint(handle_start))
        .branch(case![Command::Stop].endpoint(handle_stop))
        .branch(case![Command::Pause].endpoint(handle_pause))
        .branch(case![Command::Resume].endpoint(handle_resume))
        .branch(case![Command::Status].endpoint(handle_status))
        .branch(case![Command::Positions].endpoint(handle_positions))
        .branch(case![Command::Close(symbol)].endpoint(handle_close));

    Update::filter_message()
        .filter_map(|msg: Message| msg.from().map(|u| u.id))
        .filter_async(auth_filter)
        .branch(command_handler)
}

/// Silently drop messages from users not in the allowed list.
async fn auth_filter(user_id: UserId, deps: Arc<BotDeps>) -> bool {
    let uid = user_id.0 as i64;
    let allowed = deps.allowed_user_ids.contains(&uid);
    if !allowed {
        warn!(user_id = uid, "Unauthorized Telegram access attempt");
    }
    allowed
}

async fn handle_start(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = deps.engine.state().await;
    if state == EngineState::Running {
        bot.send_message(msg.chat.id, "Engine is already running.").await?;
    } else {
        deps.engine.send(EngineCommand::Start).await;
        bot.send_message(msg.chat.id, "Engine started.").await?;
    }
    Ok(())
}

async fn handle_stop(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = deps.engine.state().await;
    if state == EngineState::Stopped {
        bot.send_message(msg.chat.id, "Engine is already stopped.").await?;
    } else {
        deps.engine.send(EngineCommand::Stop).await;
        bot.send_message(msg.chat.id, "Engine stopping. Open positions stay monitored.")
            .await?;
    }
    Ok(())
}

async fn handle_pause(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = deps.engine.state().await;
    if state != EngineState::Running {
        bot.send_message(msg.chat.id, format!("Engine is {state}, nothing to pause."))
            .await?;
    } else {
        deps.engine.send(EngineCommand::Pause).await;
        bot.send_message(msg.chat.id, "Scanning paused.").await?;
    }
    Ok(())
}

async fn handle_resume(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = deps.engine.state().await;
    if state != EngineState::Paused {
        bot.send_message(msg.chat.id, format!("Engine is {state}, not paused."))
            .await?;
    } else {
        deps.engine.send(EngineCommand::Resume).await;
        bot.send_message(msg.chat.id, "Scanning resumed.").await?;
    }
    Ok(())
}

async fn handle_status(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = deps.engine.state().await;
    let open = deps.engine.tracker().open_count().await;
    let last = match deps.engine.last_report().await {
        Some(r) => format!(
            "Last cycle: {} processed, {} filtered, {} signals, {} closed, {} errors{}",
            r.processed,
            r.filtered,
            r.signals_found,
            r.positions_closed,
            r.error_count(),
            if r.interrupted { " (interrupted)" } else { "" }
        ),
        None => "No cycle completed yet".to_string(),
    };
    let text = format!(
        "SignalBot Status\n\
         Engine: {state}\n\
         Open positions: {open}\n\
         {last}"
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_positions(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let snapshot = deps.engine.open_positions().await;
    let mut positions: Vec<Position> = snapshot.into_values().flatten().collect();
    positions.sort_by(|a, b| a.symbol().cmp(b.symbol()));
    bot.send_message(msg.chat.id, positions_text(&positions)).await?;
    Ok(())
}

async fn handle_close(bot: Bot, msg: Message, deps: Arc<BotDeps>, symbol: String) -> HandlerResult {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /close <SYMBOL>").await?;
        return Ok(());
    }
    let closed = deps.engine.request_manual_close(&symbol).await;
    let text = if closed.is_empty() {
        format!("No open positions on {symbol}.")
    } else {
        format!("Closed {} position(s) on {symbol}.", closed.len())
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

fn positions_text(positions: &[Position]) -> String {
    if positions.is_empty() {
        return "No open positions.".to_string();
    }
    let mut out = String::from("Open positions:");
    for p in positions {
        out.push_str(&format!(
            "\n{} {} @ {} | now {} ({:+.2}%) | TP {} SL {}",
            p.symbol(),
            p.direction(),
            p.entry(),
            p.current_price,
            p.pnl_pct_at(p.current_price),
            p.take_profit,
            p.stop_loss,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::{Direction, Signal, Targets};

    use super::*;

    #[test]
    fn close_command_takes_symbol_argument() {
        let cmd = Command::parse("/close BTCUSDT", "signalbot").unwrap();
        assert_eq!(cmd, Command::Close("BTCUSDT".into()));
        assert_eq!(
            Command::parse("/positions", "signalbot").unwrap(),
            Command::Positions
        );
    }

    #[test]
    fn positions_listing() {
        assert_eq!(positions_text(&[]), "No open positions.");

        let signal = Signal::new(
            "ETHUSDT",
            Direction::Short,
            2000.0,
            Targets {
                take_profit: 1900.0,
                stop_loss: 2050.0,
            },
            68.0,
            Utc::now(),
            "test",
        )
        .unwrap();
        let mut p = Position::pending(signal, 100.0, Utc::now());
        p.activate().unwrap();
        p.mark(1980.0);
        let text = positions_text(&[p]);
        assert!(text.contains("ETHUSDT SHORT @ 2000 | now 1980 (+1.00%) | TP 1900 SL 2050"));
    }
}
