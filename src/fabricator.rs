// src/fabricator.rs - Orchestrator binding one device to one queue
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::device::{ControlFlags, Device, DeviceError, MachineStatus, ProgramOutcome};
use crate::job::{Job, JobStatus};
use crate::queue::JobQueue;
use crate::reporter::{StatusReporter, StatusUpdate};

#[derive(Debug, Error)]
pub enum FabricatorError {
    #[error("no open serial connection for {0}")]
    ConnectionUnavailable(String),
    #[error("queue is empty")]
    EmptyQueue,
    #[error("a job is already being streamed")]
    Busy,
    #[error("device does not support {0}")]
    Unsupported(&'static str),
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),
    #[error("program source missing: {0}")]
    SourceMissing(PathBuf),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("job file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives one device through its queue and exposes the external control
/// surface. Two contexts touch a fabricator concurrently: the worker task
/// inside `begin`, and any number of control calls (`pause`/`resume`/
/// `cancel`/`status`). Control is cooperative; the streaming loop observes
/// the flags only at line boundaries, so pause/cancel latency is bounded by
/// one command round trip.
pub struct Fabricator {
    name: String,
    printer_id: i64,
    device: Arc<dyn Device>,
    queue: JobQueue,
    job: RwLock<Option<Job>>,
    ctrl: Arc<ControlFlags>,
    reporter: Arc<dyn StatusReporter>,
    data_dir: PathBuf,
    // held for the full duration of begin(); a second begin() fails fast
    stream_guard: Mutex<()>,
}

impl Fabricator {
    pub fn new(
        printer_id: i64,
        device: Arc<dyn Device>,
        reporter: Arc<dyn StatusReporter>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: device.name().to_string(),
            printer_id,
            device,
            queue: JobQueue::new(),
            job: RwLock::new(None),
            ctrl: Arc::new(ControlFlags::default()),
            reporter,
            data_dir: data_dir.into(),
            stream_guard: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn printer_id(&self) -> i64 {
        self.printer_id
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Shared handle to this device's backlog.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// The fabricator's view of the machine state. Always equal to
    /// `device().status()`: both read the same status cell.
    pub fn status(&self) -> MachineStatus {
        self.device.status()
    }

    pub async fn current_job(&self) -> Option<Job> {
        self.job.read().await.clone()
    }

    /// Pull the next job and stream it to completion.
    ///
    /// All faults below this boundary come back as the `Err` value with the
    /// device forced to `Error`; nothing panics past here. The serial
    /// connection is opened at the start of the call and released on every
    /// exit path.
    pub async fn begin(&self) -> Result<ProgramOutcome, FabricatorError> {
        let _stream = self
            .stream_guard
            .try_lock()
            .map_err(|_| FabricatorError::Busy)?;

        if let Err(e) = self.device.connect().await {
            tracing::warn!("{}: cannot open serial connection: {}", self.name, e);
            return Err(FabricatorError::ConnectionUnavailable(self.name.clone()));
        }

        let mut job = match self.queue.get_next().await {
            Ok(job) => job,
            Err(_) => {
                self.device.disconnect().await;
                return Err(FabricatorError::EmptyQueue);
            }
        };

        let path = match job.materialize(&self.data_dir).await {
            Ok(path) => path,
            Err(e) => {
                self.device.disconnect().await;
                return Err(FabricatorError::Io(e));
            }
        };

        tracing::info!("{}: starting job {} ({})", self.name, job.id, job.description);
        self.ctrl.reset();
        *self.job.write().await = Some(job);
        self.device.set_status(MachineStatus::Printing);
        self.notify(JobStatus::Printing).await;

        let result = self.stream(&path).await;

        let (machine_status, job_status) = match &result {
            Ok(ProgramOutcome::Complete) => (MachineStatus::Complete, JobStatus::Complete),
            Ok(ProgramOutcome::Cancelled) => (MachineStatus::Cancelled, JobStatus::Cancelled),
            Err(_) => (MachineStatus::Error, JobStatus::Error),
        };
        self.device.set_status(machine_status);
        self.notify(job_status).await;
        self.device.disconnect().await;
        self.release_job().await;

        match &result {
            Ok(outcome) => tracing::info!("{}: job finished: {:?}", self.name, outcome),
            Err(e) => tracing::error!("{}: job failed: {}", self.name, e),
        }
        result
    }

    async fn stream(&self, path: &Path) -> Result<ProgramOutcome, FabricatorError> {
        let program = match fs::read_to_string(path).await {
            Ok(program) => program,
            Err(e) => {
                tracing::error!("{}: program at {} unreadable: {}", self.name, path.display(), e);
                // park the machine before reporting the missing source
                if let Err(e) = self.device.ending_sequence().await {
                    tracing::error!("{}: ending sequence failed: {}", self.name, e);
                }
                return Err(FabricatorError::SourceMissing(path.to_path_buf()));
            }
        };
        self.device.home().await?;
        Ok(self.device.run_program(&program, &self.ctrl).await?)
    }

    /// Suspend streaming after the in-flight command completes. Valid only
    /// while printing, and only on devices with the pause capability.
    pub async fn pause(&self) -> Result<(), FabricatorError> {
        if !self.device.can_pause() {
            return Err(FabricatorError::Unsupported("pause"));
        }
        // check and write under one lock so a finishing loop cannot be
        // overwritten with a stale `Paused`
        if !self
            .device
            .status_cell()
            .transition(MachineStatus::Printing, MachineStatus::Paused)
        {
            return Err(FabricatorError::InvalidTransition(
                "pause is only valid while printing",
            ));
        }
        self.ctrl.request_pause();
        self.notify(JobStatus::Paused).await;
        tracing::info!("{}: paused", self.name);
        Ok(())
    }

    /// Continue from the next unsent line. Valid only from `Paused`.
    pub async fn resume(&self) -> Result<(), FabricatorError> {
        if !self
            .device
            .status_cell()
            .transition(MachineStatus::Paused, MachineStatus::Printing)
        {
            return Err(FabricatorError::InvalidTransition(
                "resume is only valid while paused",
            ));
        }
        self.ctrl.clear_pause();
        self.notify(JobStatus::Printing).await;
        tracing::info!("{}: resumed", self.name);
        Ok(())
    }

    /// Request cancellation. Returns once the signal is set; the streaming
    /// loop observes it at the next line boundary, runs the ending sequence
    /// and unwinds. Poll `status()` to observe completion; the `cancelled`
    /// job notification goes out only after the ending sequence, when
    /// `begin` finalizes.
    pub async fn cancel(&self) -> Result<(), FabricatorError> {
        if !self.device.status_cell().transition_from(
            &[MachineStatus::Printing, MachineStatus::Paused],
            MachineStatus::Cancelled,
        ) {
            return Err(FabricatorError::InvalidTransition(
                "cancel is only valid while printing or paused",
            ));
        }
        self.ctrl.request_cancel();
        tracing::info!("{}: cancel requested", self.name);
        Ok(())
    }

    /// Clear a finished job and return the device to `Idle`. Valid only
    /// from a terminal state, and only once the worker has released the
    /// machine: while `begin` is still unwinding (e.g. running the ending
    /// sequence after a cancel) the reset is refused with `Busy`.
    pub async fn reset_to_idle(&self) -> Result<(), FabricatorError> {
        let _stream = self
            .stream_guard
            .try_lock()
            .map_err(|_| FabricatorError::Busy)?;
        if !self.device.status().is_terminal() {
            return Err(FabricatorError::InvalidTransition(
                "reset is only valid from a terminal state",
            ));
        }
        *self.job.write().await = None;
        self.device.set_status(MachineStatus::Idle);
        tracing::info!("{}: reset to idle", self.name);
        Ok(())
    }

    /// Set the current job's status and push the transition to the
    /// reporter. Best-effort: a delivery failure is logged, never unwound.
    /// No-op if the job already carries `status`.
    async fn notify(&self, status: JobStatus) {
        let job_id = {
            let mut slot = self.job.write().await;
            match slot.as_mut() {
                Some(job) if job.status != status => {
                    job.set_status(status);
                    Some(job.id)
                }
                _ => None,
            }
        };
        let Some(job_id) = job_id else { return };
        let update = StatusUpdate::new(self.printer_id, job_id, status);
        if let Err(e) = self.reporter.job_status_changed(update).await {
            tracing::warn!(
                "{}: status notification `{}` for job {} not delivered: {}",
                self.name,
                status,
                job_id,
                e
            );
        }
    }

    /// Drop the finished job: remove its working file and, when requested,
    /// its source file.
    async fn release_job(&self) {
        let Some(mut job) = self.job.write().await.take() else {
            return;
        };
        job.cleanup().await;
        if job.should_delete {
            if let Err(e) = fs::remove_file(&job.source_path).await {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(
                        "{}: failed to delete source {}: {}",
                        self.name,
                        job.source_path.display(),
                        e
                    );
                }
            }
        }
    }
}
