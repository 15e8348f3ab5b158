// src/device/mod.rs - Hardware adapter contract and the line/ack streaming loop
pub mod emulated;
pub mod serial;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;

/// Response substring that acknowledges a command was accepted.
pub const ACK_TOKEN: &str = "ok";

/// Comment delimiter in the command language; text after it on a line is
/// discarded before sending.
pub const COMMENT_CHAR: char = ';';

/// Settle delay after writing a command, before polling for the ack.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// How often a paused streaming loop re-checks its control flags.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Homing/reset sequence run before streaming a program.
pub const HOMING_SEQUENCE: &[&str] = &["G28", "G92 E0"];

/// Safety shutdown issued whenever a program is aborted: relative mode,
/// retract, raise, absolute mode, park, fan off, heaters to zero.
pub const ENDING_SEQUENCE: &[&str] = &[
    "G91",
    "G1 F1800 E-3",
    "G1 F3000 Z10",
    "G90",
    "G1 X0 Y220",
    "M106 S0",
    "M104 S0",
    "M140 S0",
];

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("serial connection is not open")]
    NotConnected,
    #[error("no acknowledgment after {0} consecutive silent reads")]
    ProtocolTimeout(u32),
    #[error("serial transport fault: {0}")]
    Transport(#[from] std::io::Error),
}

/// Machine-visible state, mirrored by the owning fabricator.
/// `Complete`, `Cancelled` and `Error` are terminal for the current job;
/// an explicit reset returns the device to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    Idle,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl MachineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MachineStatus::Complete | MachineStatus::Cancelled | MachineStatus::Error
        )
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineStatus::Idle => "idle",
            MachineStatus::Printing => "printing",
            MachineStatus::Paused => "paused",
            MachineStatus::Complete => "complete",
            MachineStatus::Cancelled => "cancelled",
            MachineStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Shared status slot. Reads and writes go through one mutex so a control
/// task never observes a torn value from the streaming task.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<Mutex<MachineStatus>>);

impl StatusCell {
    pub fn get(&self) -> MachineStatus {
        *self.0.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn set(&self, status: MachineStatus) {
        *self.0.lock().unwrap_or_else(|poison| poison.into_inner()) = status;
    }

    /// Replace `expected` with `new` in one critical section. Returns
    /// whether the swap happened; the cell is untouched on a mismatch.
    pub fn transition(&self, expected: MachineStatus, new: MachineStatus) -> bool {
        self.transition_from(&[expected], new)
    }

    /// `transition` accepting any of the `expected` states.
    pub fn transition_from(&self, expected: &[MachineStatus], new: MachineStatus) -> bool {
        let mut status = self.0.lock().unwrap_or_else(|poison| poison.into_inner());
        if expected.contains(&status) {
            *status = new;
            true
        } else {
            false
        }
    }
}

/// Cooperative pause/cancel signals shared between the fabricator's control
/// surface and the streaming loop. The loop observes them only at line
/// boundaries, never mid-command, so the machine is never interrupted with
/// a command half-sent.
#[derive(Debug, Default)]
pub struct ControlFlags {
    pause: AtomicBool,
    cancel: AtomicBool,
}

impl ControlFlags {
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// How a streamed program ended when no fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramOutcome {
    Complete,
    Cancelled,
}

/// Filament/nozzle state applied by the program-header loader before a job
/// starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialState {
    pub filament_type: Option<String>,
    pub filament_diameter: Option<f64>,
    pub nozzle_diameter: Option<f64>,
}

/// Strip an inline or whole-line comment and surrounding whitespace.
pub fn strip_comment(raw: &str) -> &str {
    let line = match raw.find(COMMENT_CHAR) {
        Some(at) => &raw[..at],
        None => raw,
    };
    line.trim()
}

/// One physical or emulated machine. Exactly one fabricator owns a device
/// at a time; the device does not own a queue.
///
/// Implementors supply the transport (`connect`/`disconnect`/`send_line`)
/// and capability flags; the streaming loop and safety sequences are shared.
#[async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn hardware_id(&self) -> &str;

    fn status_cell(&self) -> &StatusCell;

    fn status(&self) -> MachineStatus {
        self.status_cell().get()
    }

    fn set_status(&self, status: MachineStatus) {
        self.status_cell().set(status);
    }

    /// Open the serial channel. Idempotent when already open.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Close the serial channel. Safe to call when already closed.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Send one command line and block until the device acknowledges it.
    /// Transport faults and ack timeouts force the device to `Error`.
    async fn send_line(&self, line: &str) -> Result<(), DeviceError>;

    /// Whether the streaming loop may be suspended between lines. Devices
    /// without this capability fail pause requests instead of ignoring them.
    fn can_pause(&self) -> bool {
        false
    }

    fn change_filament(&self, filament_type: &str, diameter: f64);

    fn change_nozzle(&self, diameter: f64);

    /// Homing/reset sequence run before a program starts.
    async fn home(&self) -> Result<(), DeviceError> {
        for command in HOMING_SEQUENCE {
            self.send_line(command).await?;
        }
        Ok(())
    }

    /// Safety shutdown run whenever a program is aborted.
    async fn ending_sequence(&self) -> Result<(), DeviceError> {
        tracing::info!("{}: running ending sequence", self.name());
        for command in ENDING_SEQUENCE {
            self.send_line(command).await?;
        }
        Ok(())
    }

    /// Stream a program line by line. Comments and blank lines are skipped.
    /// Between lines the control flags are checked: a pause request holds
    /// the loop (connection open, nothing sent) until resumed or cancelled;
    /// a cancel request stops the stream, runs the ending sequence and
    /// reports `Cancelled`. Faults from `send_line` abort the remaining
    /// lines and propagate.
    async fn run_program(
        &self,
        program: &str,
        ctrl: &ControlFlags,
    ) -> Result<ProgramOutcome, DeviceError> {
        for raw in program.lines() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }
            while ctrl.paused() && !ctrl.cancelled() {
                sleep(PAUSE_POLL_INTERVAL).await;
            }
            if ctrl.cancelled() {
                self.ending_sequence().await?;
                return Ok(ProgramOutcome::Cancelled);
            }
            self.send_line(line).await?;
        }
        Ok(ProgramOutcome::Complete)
    }
}
