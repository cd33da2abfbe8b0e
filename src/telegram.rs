use crate::alerts::{host_label, Alert, NotificationSink};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};
use tracing::{debug, warn};

/// Sends alerts as HTML messages to a fixed set of chats, at most
/// `rate_limit_per_minute` messages per chat.
pub struct TelegramSink {
    bot: Bot,
    chat_ids: Vec<i64>,
    limiter: Mutex<RateLimiter>,
}

impl TelegramSink {
    pub fn new(bot: Bot, chat_ids: Vec<i64>, rate_limit_per_minute: u32) -> Self {
        Self {
            bot,
            chat_ids,
            limiter: Mutex::new(RateLimiter::new(rate_limit_per_minute)),
        }
    }

    fn allowed_chats(&self, now_unix: i64) -> Vec<i64> {
        let mut limiter = self.limiter.lock().unwrap_or_else(PoisonError::into_inner);
        self.chat_ids
            .iter()
            .copied()
            .filter(|chat_id| {
                let allowed = limiter.allow(*chat_id, now_unix);
                if !allowed {
                    debug!(chat_id, "telegram rate limit reached, alert skipped");
                }
                allowed
            })
            .collect()
    }
}

impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn dispatch(&self, alert: &Alert) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(rule = %alert.rule_id, "no async runtime, telegram alert dropped");
            return;
        };
        let text = format_alert_html(alert);
        for chat_id in self.allowed_chats(now_unix()) {
            let bot = self.bot.clone();
            let text = text.clone();
            handle.spawn(async move {
                if let Err(err) = bot
                    .send_message(ChatId(chat_id), text)
                    .parse_mode(ParseMode::Html)
                    .await
                {
                    warn!(chat_id, error = %err, "failed to send telegram alert");
                }
            });
        }
    }
}

struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_unix - ts >= 60 {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_unix);
        true
    }
}

pub fn format_alert_html(alert: &Alert) -> String {
    format!(
        "\u{1F6A8} <b>AEGIS ALERT</b>\nHost: <code>{}</code>\nMetric: <b>{}</b>\nCurrent: {:.1}% (limit {:.1}%)\nRule: <code>{}</code>\nAt: {}",
        escape_html(host_label(&alert.hostname)),
        alert.metric,
        alert.value,
        alert.threshold,
        escape_html(&alert.rule_id),
        alert.fired_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
