// src/device/serial.rs - Marlin-family serial device speaking the line/ack protocol
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};

use super::{
    ACK_TOKEN, Device, DeviceError, MachineStatus, MaterialState, SETTLE_DELAY, StatusCell,
};

/// Per-read timeout while waiting for an acknowledgment.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive silent reads tolerated before the exchange is declared a
/// protocol timeout. Bounds the wait at roughly
/// `MAX_SILENT_READS * READ_TIMEOUT` per command.
pub const MAX_SILENT_READS: u32 = 10;

/// Static description of one serial hardware family member. The Marlin wire
/// protocol is shared across the Prusa/Ender class; the profile carries what
/// differs per model.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: String,
    pub port: String,
    pub baud: u32,
    pub hardware_id: String,
    pub pausable: bool,
}

/// Serial-attached printer speaking Marlin-style G-code with `"ok"` acks.
pub struct MarlinDevice {
    profile: DeviceProfile,
    status: StatusCell,
    port: Mutex<Option<SerialPort>>,
    // bytes received but not yet terminated by a newline
    rx_buffer: Mutex<Vec<u8>>,
    material: StdMutex<MaterialState>,
    connected: AtomicBool,
}

impl MarlinDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            status: StatusCell::default(),
            port: Mutex::new(None),
            rx_buffer: Mutex::new(Vec::new()),
            material: StdMutex::new(MaterialState::default()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn material(&self) -> MaterialState {
        self.material
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn fail(&self, error: DeviceError) -> DeviceError {
        self.status.set(MachineStatus::Error);
        error
    }

    /// Pull one complete, non-empty line out of the receive buffer.
    fn pop_line(buffer: &mut Vec<u8>) -> Option<String> {
        while let Some(at) = buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=at).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Read response lines until one carries the ack token. Non-ack lines
    /// are logged; sustained silence is a protocol timeout.
    async fn await_ack(&self, port: &SerialPort, command: &str) -> Result<(), DeviceError> {
        let mut rx = self.rx_buffer.lock().await;
        let mut silent_reads = 0u32;
        loop {
            if let Some(line) = Self::pop_line(&mut rx) {
                if line.contains(ACK_TOKEN) {
                    tracing::debug!("{}: `{}` acknowledged", self.profile.name, command);
                    return Ok(());
                }
                tracing::debug!("{}: RX {}", self.profile.name, line);
                continue;
            }
            let mut chunk = [0u8; 256];
            match timeout(READ_TIMEOUT, port.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => {
                    silent_reads += 1;
                    if silent_reads >= MAX_SILENT_READS {
                        tracing::error!(
                            "{}: no response to `{}` after {} reads",
                            self.profile.name,
                            command,
                            silent_reads
                        );
                        return Err(self.fail(DeviceError::ProtocolTimeout(silent_reads)));
                    }
                }
                Ok(Ok(n)) => {
                    silent_reads = 0;
                    rx.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => return Err(self.fail(DeviceError::Transport(e))),
            }
        }
    }
}

#[async_trait]
impl Device for MarlinDevice {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn hardware_id(&self) -> &str {
        &self.profile.hardware_id
    }

    fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        let mut guard = self.port.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let port = SerialPort::open(&self.profile.port, self.profile.baud)
            .map_err(DeviceError::Transport)?;
        tracing::info!(
            "{}: connected on {} at {} baud",
            self.profile.name,
            self.profile.port,
            self.profile.baud
        );
        *guard = Some(port);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.port.lock().await;
        if guard.take().is_some() {
            tracing::info!("{}: disconnected", self.profile.name);
        }
        self.connected.store(false, Ordering::SeqCst);
        self.rx_buffer.lock().await.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_line(&self, line: &str) -> Result<(), DeviceError> {
        let guard = self.port.lock().await;
        let port = guard.as_ref().ok_or(DeviceError::NotConnected)?;
        tracing::debug!("{}: TX {}", self.profile.name, line);
        let framed = format!("{line}\n");
        let bytes = framed.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            match port.write(&bytes[written..]).await {
                Ok(n) => written += n,
                Err(e) => return Err(self.fail(DeviceError::Transport(e))),
            }
        }
        // give the machine a moment to start processing before polling
        sleep(SETTLE_DELAY).await;
        self.await_ack(port, line).await
    }

    fn can_pause(&self) -> bool {
        self.profile.pausable
    }

    fn change_filament(&self, filament_type: &str, diameter: f64) {
        let mut material = self
            .material
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        material.filament_type = Some(filament_type.to_string());
        material.filament_diameter = Some(diameter);
        tracing::info!(
            "{}: filament set to {} ({} mm)",
            self.profile.name,
            filament_type,
            diameter
        );
    }

    fn change_nozzle(&self, diameter: f64) {
        let mut material = self
            .material
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(filament) = material.filament_diameter {
            if filament > diameter {
                tracing::warn!(
                    "{}: filament diameter {} mm exceeds nozzle {} mm",
                    self.profile.name,
                    filament,
                    diameter
                );
            }
        }
        material.nozzle_diameter = Some(diameter);
        tracing::info!("{}: nozzle set to {} mm", self.profile.name, diameter);
    }
}
