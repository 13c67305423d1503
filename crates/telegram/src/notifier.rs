use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::warn;

use common::{NotificationSink, Position, SignalEvent};

/// Pushes lifecycle events to the operator chats.
pub struct TelegramNotifier {
    bot: Bot,
    chat_ids: Vec<ChatId>,
}

impl TelegramNotifier {
    /// Private chats share the user's ID, so the allow-list doubles as the
    /// recipient list.
    pub fn new(token: impl Into<String>, user_ids: &[i64]) -> Self {
        Self {
            bot: Bot::new(token),
            chat_ids: user_ids.iter().map(|id| ChatId(*id)).collect(),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, event: &SignalEvent) {
        let text = format_event(event);
        for &chat_id in &self.chat_ids {
            if let Err(e) = self.bot.send_message(chat_id, text.clone()).await {
                warn!(chat_id = ?chat_id, error = %e, "Failed to send Telegram notification");
            }
        }
    }
}

/// Operator-facing text for one event.
pub fn format_event(event: &SignalEvent) -> String {
    match event {
        SignalEvent::SignalOpened(p) => format!(
            "NEW SIGNAL {} {}\n\
             Entry: {}\n\
             TP: {}\n\
             SL: {}\n\
             R:R {:.2} | Confidence {:.1}%\n\
             {}",
            p.direction(),
            p.symbol(),
            p.entry(),
            p.take_profit,
            p.stop_loss,
            p.targets().risk_reward(p.entry()),
            p.signal.confidence,
            p.signal.rationale,
        ),
        SignalEvent::SignalUpdated(p) => format!(
            "LEVELS MOVED {} {}\n\
             TP: {}\n\
             SL: {}\n\
             Price: {} ({:+.2}%)",
            p.direction(),
            p.symbol(),
            p.take_profit,
            p.stop_loss,
            p.current_price,
            p.pnl_pct_at(p.current_price),
        ),
        SignalEvent::SignalClosed(p) => {
            let price = p.close_price.unwrap_or(p.current_price);
            let reason = p
                .close_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "UNKNOWN".into());
            format!(
                "CLOSED {} {} ({reason})\n\
                 Entry: {} -> Exit: {}\n\
                 PnL: {:+.2}% ({:+.2} USD)\n\
                 Held: {}",
                p.direction(),
                p.symbol(),
                p.entry(),
                price,
                p.pnl_pct_at(price),
                p.unrealized_pnl,
                held_for(p),
            )
        }
    }
}

fn held_for(p: &Position) -> String {
    let Some(closed_at) = p.closed_at else {
        return "-".into();
    };
    let mins = (closed_at - p.opened_at).num_minutes().max(0);
    if mins >= 60 {
        format!("{}h {}m", mins / 60, mins % 60)
    } else {
        format!("{mins}m")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use common::{CloseReason, Direction, Signal, Targets};

    use super::*;

    fn long_position() -> Position {
        let signal = Signal::new(
            "BTCUSDT",
            Direction::Long,
            100.0,
            Targets {
                take_profit: 104.0,
                stop_loss: 98.0,
            },
            71.5,
            Utc::now(),
            "RSI 28.0, volume x1.30",
        )
        .unwrap();
        let mut p = Position::pending(signal, 100.0, Utc::now() - Duration::minutes(95));
        p.activate().unwrap();
        p
    }

    #[test]
    fn opened_message_lists_levels() {
        let text = format_event(&SignalEvent::SignalOpened(long_position()));
        assert!(text.starts_with("NEW SIGNAL LONG BTCUSDT"));
        assert!(text.contains("TP: 104"));
        assert!(text.contains("SL: 98"));
        assert!(text.contains("R:R 2.00"));
        assert!(text.contains("Confidence 71.5%"));
    }

    #[test]
    fn closed_message_has_pnl_reason_and_duration() {
        let mut p = long_position();
        p.close(CloseReason::TakeProfit, 104.0, p.opened_at + Duration::minutes(95))
            .unwrap();
        let text = format_event(&SignalEvent::SignalClosed(p));
        assert!(text.contains("(TAKE_PROFIT)"));
        assert!(text.contains("PnL: +4.00% (+4.00 USD)"));
        assert!(text.contains("Held: 1h 35m"));
    }

    #[test]
    fn update_message_shows_new_levels() {
        let mut p = long_position();
        p.mark(102.0);
        p.retarget(Targets {
            take_profit: 106.0,
            stop_loss: 99.0,
        })
        .unwrap();
        let text = format_event(&SignalEvent::SignalUpdated(p));
        assert!(text.contains("TP: 106"));
        assert!(text.contains("SL: 99"));
        assert!(text.contains("(+2.00%)"));
    }
}
