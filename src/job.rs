// src/job.rs - A queued fabrication program plus its metadata
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

/// Lifecycle of one queued job. `Ready` until a fabricator picks it up,
/// then driven exclusively by that fabricator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ready,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Ready => "ready",
            JobStatus::Printing => "printing",
            JobStatus::Paused => "paused",
            JobStatus::Complete => "complete",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One fabrication program queued for a device.
///
/// `content` is immutable after construction; only `status` and the
/// transient `working_path` mutate, and only under the fabricator that
/// currently owns the job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    content: Arc<str>,
    pub description: String,
    pub owner_id: i64,
    pub status: JobStatus,
    pub source_path: PathBuf,
    pub should_delete: bool,
    pub priority: i32,
    pub device_name: String,
    pub created_at: DateTime<Local>,
    working_path: Option<PathBuf>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        content: impl Into<Arc<str>>,
        description: impl Into<String>,
        owner_id: i64,
        status: JobStatus,
        source_path: impl Into<PathBuf>,
        should_delete: bool,
        priority: i32,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            description: description.into(),
            owner_id,
            status,
            source_path: source_path.into(),
            should_delete,
            priority,
            device_name: device_name.into(),
            created_at: Local::now(),
            working_path: None,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    pub fn working_path(&self) -> Option<&Path> {
        self.working_path.as_deref()
    }

    /// Write the program to a working file under `dir` and return its path.
    /// Idempotent per instance: a second call returns the recorded path
    /// without rewriting.
    pub async fn materialize(&mut self, dir: &Path) -> std::io::Result<PathBuf> {
        if let Some(path) = &self.working_path {
            return Ok(path.clone());
        }
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.gcode", self.id));
        fs::write(&path, self.content.as_bytes()).await?;
        tracing::debug!("job {} materialized at {}", self.id, path.display());
        self.working_path = Some(path.clone());
        Ok(path)
    }

    /// Remove the materialized working file. A file that is already gone is
    /// not an error.
    pub async fn cleanup(&mut self) {
        let Some(path) = self.working_path.take() else {
            return;
        };
        match fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("job {} working file removed", self.id),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("job {}: failed to remove {}: {}", self.id, path.display(), e),
        }
    }
}
