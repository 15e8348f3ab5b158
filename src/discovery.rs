// src/discovery.rs - Port enumeration and concrete device construction
use std::path::PathBuf;
use std::sync::Arc;

use serial2_tokio::SerialPort;

use crate::config::{DeviceConfig, DeviceKind};
use crate::device::emulated::EmulatedDevice;
use crate::device::serial::{DeviceProfile, MarlinDevice};
use crate::device::Device;

/// Serial ports currently visible on this host. Informational only; which
/// devices the farm drives is decided by configuration, not by what happens
/// to be plugged in.
pub fn available_ports() -> std::io::Result<Vec<PathBuf>> {
    SerialPort::available_ports()
}

/// Build the concrete device for a configured entry. The hardware family is
/// selected here, at construction time; the rest of the system only sees the
/// `Device` trait.
pub fn build_device(config: &DeviceConfig) -> Arc<dyn Device> {
    match config.kind {
        DeviceKind::Serial => Arc::new(MarlinDevice::new(DeviceProfile {
            name: config.name.clone(),
            port: config.port.clone(),
            baud: config.baud,
            hardware_id: config.hardware_id.clone(),
            pausable: config.pausable,
        })),
        DeviceKind::Emulated => {
            Arc::new(EmulatedDevice::new(config.name.clone()).with_pause(config.pausable))
        }
    }
}
