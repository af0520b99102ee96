//! Operator alerting behind an opaque sink. CRITICAL alerts are
//! delivered synchronously; everything else goes through a queued
//! dispatcher that is rate-limited per minute.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::{GridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Success,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Success => "SUCCESS",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub body: String,
    pub fields: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Opaque alert destination (Telegram, Slack webhook, pager, ...).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// POSTs alerts as JSON to a webhook.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let resp = self.client.post(&self.url).json(alert).send().await?;
        if !resp.status().is_success() {
            return Err(GridError::Internal(format!(
                "alert webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Sink that only logs; used when no webhook is configured.
pub struct LogAlerter;

#[async_trait]
impl AlertSink for LogAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.level {
            AlertLevel::Critical => error!(title = %alert.title, body = %alert.body, "ALERT"),
            AlertLevel::Warning => warn!(title = %alert.title, body = %alert.body, "alert"),
            _ => info!(title = %alert.title, body = %alert.body, "alert"),
        }
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAlerter {
    pub sent: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for MemoryAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.sent.lock().await.push(alert.clone());
        Ok(())
    }
}

/// Front door for alerting. Queued sends drop with a warning once the
/// per-minute budget is spent; CRITICAL bypasses both queue and budget.
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    queue_tx: mpsc::Sender<Alert>,
    minute_budget: u32,
    window: Mutex<(DateTime<Utc>, u32)>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, max_per_minute: u32) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<Alert>(256);

        let dispatcher = Arc::new(Self {
            sink: sink.clone(),
            queue_tx,
            minute_budget: max_per_minute,
            window: Mutex::new((Utc::now(), 0)),
        });

        tokio::spawn(async move {
            while let Some(alert) = queue_rx.recv().await {
                if let Err(err) = sink.send(&alert).await {
                    warn!(error = %err, title = %alert.title, "alert delivery failed");
                }
            }
        });

        dispatcher
    }

    pub async fn send(
        &self,
        level: AlertLevel,
        title: impl Into<String>,
        body: impl Into<String>,
        fields: HashMap<String, Value>,
    ) -> Result<()> {
        let alert = Alert {
            level,
            title: title.into(),
            body: body.into(),
            fields,
            created_at: Utc::now(),
        };

        if level == AlertLevel::Critical {
            // Synchronous path: the caller learns about delivery failure.
            return self.sink.send(&alert).await;
        }

        if !self.take_budget().await {
            warn!(title = %alert.title, "alert dropped by per-minute rate limit");
            return Ok(());
        }

        if self.queue_tx.try_send(alert).is_err() {
            warn!("alert queue full, dropping alert");
        }
        Ok(())
    }

    async fn take_budget(&self) -> bool {
        let mut window = self.window.lock().await;
        let now = Utc::now();
        if now - window.0 >= Duration::minutes(1) {
            *window = (now, 0);
        }
        if window.1 >= self.minute_budget {
            return false;
        }
        window.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn critical_is_synchronous() {
        let sink = Arc::new(MemoryAlerter::default());
        let dispatcher = AlertDispatcher::new(sink.clone(), 5);

        dispatcher
            .send(AlertLevel::Critical, "lockdown", "level 5", HashMap::new())
            .await
            .unwrap();

        // Delivered before send() returned, no queue drain needed.
        assert_eq!(sink.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn queued_alerts_respect_minute_budget() {
        let sink = Arc::new(MemoryAlerter::default());
        let dispatcher = AlertDispatcher::new(sink.clone(), 2);

        for i in 0..5 {
            dispatcher
                .send(AlertLevel::Info, format!("a{i}"), "", HashMap::new())
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(sink.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn critical_bypasses_budget() {
        let sink = Arc::new(MemoryAlerter::default());
        let dispatcher = AlertDispatcher::new(sink.clone(), 1);

        dispatcher
            .send(AlertLevel::Info, "a", "", HashMap::new())
            .await
            .unwrap();
        dispatcher
            .send(AlertLevel::Critical, "b", "", HashMap::new())
            .await
            .unwrap();
        dispatcher
            .send(AlertLevel::Critical, "c", "", HashMap::new())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(sink.sent.lock().await.len(), 3);
    }
}
