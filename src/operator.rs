// src/operator.rs
use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;

/// Operator-facing channel for unexpected errors and cycle diagnostics.
///
/// Reports are fire-and-forget: implementations never block the caller on
/// delivery and swallow their own failures.
pub trait OperatorChannel: Send + Sync {
    fn report(&self, detail: &str, unexpected: bool);
}

/// Writes reports to the log only.
#[derive(Debug, Default)]
pub struct LogOperatorChannel;

impl OperatorChannel for LogOperatorChannel {
    fn report(&self, detail: &str, unexpected: bool) {
        if unexpected {
            error!("{}", detail);
        } else {
            info!("{}", detail);
        }
    }
}

/// Chat webhooks reject longer messages.
const MAX_MESSAGE_LEN: usize = 2000;

/// Posts reports to a chat webhook.
pub struct WebhookOperatorChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookOperatorChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

fn format_report(detail: &str, unexpected: bool) -> String {
    if unexpected {
        let date = Utc::now().format("%Y-%m-%d %H:%M:%S");
        format!("Error in poller!\nIt happened at `{}`\n```{}```", date, detail)
    } else {
        detail.to_string()
    }
}

/// Split on char boundaries into pieces of at most `limit` bytes.
pub(crate) fn split_message(message: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for ch in message.chars() {
        if current.len() + ch.len_utf8() > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

impl OperatorChannel for WebhookOperatorChannel {
    fn report(&self, detail: &str, unexpected: bool) {
        LogOperatorChannel.report(detail, unexpected);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, operator report only logged");
            return;
        };

        let parts = split_message(&format_report(detail, unexpected), MAX_MESSAGE_LEN);
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            for part in parts {
                let sent = client
                    .post(&url)
                    .json(&json!({ "content": part }))
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = sent {
                    warn!("Failed to deliver operator report: {}", e);
                    break;
                }
            }
        });
    }
}
