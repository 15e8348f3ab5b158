// src/reporter.rs - Outbound status notification contract
use chrono::{DateTime, Local};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("status delivery failed: {0}")]
    Delivery(String),
    #[error("status payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Payload sent on every job status transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub printer_id: i64,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub timestamp: DateTime<Local>,
}

impl StatusUpdate {
    pub fn new(printer_id: i64, job_id: Uuid, status: JobStatus) -> Self {
        Self {
            printer_id,
            job_id,
            status,
            timestamp: Local::now(),
        }
    }
}

/// Receives status-change notifications from a fabricator. Delivery is
/// best-effort: the fabricator logs failures and never rolls back the
/// transition that triggered the notification.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn job_status_changed(&self, update: StatusUpdate) -> Result<(), ReporterError>;
}

/// Reporter that emits each update as a JSON log line. Default for hosts
/// running without an upstream status service.
#[derive(Debug, Default)]
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn job_status_changed(&self, update: StatusUpdate) -> Result<(), ReporterError> {
        let payload = serde_json::to_string(&update)?;
        tracing::info!(target: "farmhost::status", "{payload}");
        Ok(())
    }
}

/// Reporter that forwards updates over an in-process channel; used by the
/// web/bridge layers and by tests to observe transitions in order.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusReporter for ChannelReporter {
    async fn job_status_changed(&self, update: StatusUpdate) -> Result<(), ReporterError> {
        self.tx
            .send(update)
            .map_err(|e| ReporterError::Delivery(e.to_string()))
    }
}
