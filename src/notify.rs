//! Alert egress.
//!
//! The engine only builds structured alerts and deduplicates incidents;
//! actual delivery (mail, push) belongs to an external collaborator behind
//! `AlertChannel`. The shipped channel writes to the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{BatchError, Severity};

/// Structured alert handed to the delivery collaborator.
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub job_id: String,
    pub execution_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
            job_id: String::new(),
            execution_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: &str, execution_id: Option<&str>) -> Self {
        self.job_id = job_id.to_string();
        self.execution_id = execution_id.map(str::to_string);
        self
    }

    /// One incident is one (job, title) pair; repeats inside the cooldown
    /// window are the same incident.
    fn incident_key(&self) -> String {
        format!("{}:{}", self.job_id, self.title)
    }
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), BatchError>;
}

/// Default channel: structured log lines.
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn deliver(&self, alert: &Alert) -> Result<(), BatchError> {
        match alert.severity {
            Severity::Critical | Severity::High => error!(
                job_id = %alert.job_id,
                severity = %alert.severity,
                "{}: {}",
                alert.title,
                alert.body
            ),
            Severity::Medium => warn!(
                job_id = %alert.job_id,
                "{}: {}",
                alert.title,
                alert.body
            ),
            Severity::Low => info!(
                job_id = %alert.job_id,
                "{}: {}",
                alert.title,
                alert.body
            ),
        }
        Ok(())
    }
}

/// At-most-once-per-incident dispatch within a cooldown window.
pub struct AlertDispatcher {
    channel: Arc<dyn AlertChannel>,
    cooldown: Duration,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertDispatcher {
    pub fn new(channel: Arc<dyn AlertChannel>, cooldown: Duration) -> Self {
        Self {
            channel,
            cooldown,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver unless the same incident fired within the cooldown.
    /// Returns whether the alert went out.
    pub async fn dispatch(&self, alert: Alert) -> bool {
        let key = alert.incident_key();
        let now = Utc::now();
        {
            let mut recent = self.recent.lock().expect("alert dispatcher lock poisoned");
            if let Some(last) = recent.get(&key) {
                let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.cooldown {
                    return false;
                }
            }
            recent.insert(key, now);
        }

        if let Err(e) = self.channel.deliver(&alert).await {
            warn!("alert delivery failed: {e}");
        }
        true
    }
}
