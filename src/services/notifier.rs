use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

use crate::execution::collaborators::Notifier;
use crate::models::ReplicaOrder;

/// Telegram delivery keyed by follower id, which doubles as the chat id.
/// Failures are logged but never block replication.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(http: reqwest::Client, bot_token: String) -> Self {
        Self { http, bot_token }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, follower_id: i64, message: &str) {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token
        );

        let body = json!({
            "chat_id": follower_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        follower_id,
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(follower_id, error = %e, "Failed to send Telegram notification");
            }
        }
    }
}

/// Format the message sent after a replica order executes.
pub fn format_replica_filled(order: &ReplicaOrder, price: Decimal, closed: bool) -> String {
    let title = if closed {
        "Position Closed"
    } else if order.reduce_only {
        "Position Reduced"
    } else {
        "Order Filled"
    };
    format!(
        "*{}*\nExchange: {}\nSymbol: `{}`\nSide: {}\nSize: {} @ {}",
        title,
        order.exchange,
        order.symbol,
        order.side,
        order.quantity.normalize(),
        price.normalize(),
    )
}

/// Format the warning sent once a follower's token balance runs out.
pub fn format_fee_exhausted(balance: Decimal) -> String {
    format!(
        "*Copy Trading Paused*\nYour token balance is {}. Top up to keep copying trades.",
        balance.round_dp(2),
    )
}
