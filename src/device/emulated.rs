// src/device/emulated.rs - In-memory device for virtual printers and tests
use std::io;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use super::{Device, DeviceError, MachineStatus, MaterialState, StatusCell};

/// Device that accepts every line immediately and records it instead of
/// touching hardware. Backs emulated printers on the farm and the
/// integration tests: latency and transport faults are scriptable.
pub struct EmulatedDevice {
    name: String,
    hardware_id: String,
    status: StatusCell,
    connected: AtomicBool,
    attachable: bool,
    pausable: bool,
    line_delay: Duration,
    // Some(n): the nth send from now fails with a transport fault
    fail_after: StdMutex<Option<usize>>,
    sent: StdMutex<Vec<String>>,
    material: StdMutex<MaterialState>,
}

impl EmulatedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            hardware_id: format!("EMU:{name}"),
            name,
            status: StatusCell::default(),
            connected: AtomicBool::new(false),
            attachable: true,
            pausable: true,
            line_delay: Duration::ZERO,
            fail_after: StdMutex::new(None),
            sent: StdMutex::new(Vec::new()),
            material: StdMutex::new(MaterialState::default()),
        }
    }

    /// Withdraw or grant the pause capability.
    pub fn with_pause(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    /// Simulate an unplugged machine: every `connect` fails.
    pub fn unplugged(mut self) -> Self {
        self.attachable = false;
        self
    }

    /// Hold each accepted line for `delay`, approximating a machine that
    /// takes time to execute commands.
    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    /// Inject a transport fault on the `n`th line sent from now (0 fails the
    /// next send).
    pub fn fail_after(self, n: usize) -> Self {
        *self
            .fail_after
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(n);
        self
    }

    /// Every line accepted so far, in send order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub fn material(&self) -> MaterialState {
        self.material
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

#[async_trait]
impl Device for EmulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        if !self.attachable {
            return Err(DeviceError::NotConnected);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_line(&self, line: &str) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        if self.line_delay > Duration::ZERO {
            sleep(self.line_delay).await;
        }
        {
            let mut fail_after = self
                .fail_after
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            match fail_after.as_mut() {
                Some(0) => {
                    fail_after.take();
                    self.status.set(MachineStatus::Error);
                    return Err(DeviceError::Transport(io::Error::other(
                        "injected serial fault",
                    )));
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        tracing::trace!("{}: accepted {}", self.name, line);
        self.sent
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(line.to_string());
        Ok(())
    }

    fn can_pause(&self) -> bool {
        self.pausable
    }

    fn change_filament(&self, filament_type: &str, diameter: f64) {
        let mut material = self
            .material
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        material.filament_type = Some(filament_type.to_string());
        material.filament_diameter = Some(diameter);
    }

    fn change_nozzle(&self, diameter: f64) {
        self.material
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .nozzle_diameter = Some(diameter);
    }
}
