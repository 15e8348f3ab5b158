// src/lib.rs - farmhost: serial print-farm orchestration engine
pub mod config;
pub mod device;
pub mod discovery;
pub mod fabricator;
pub mod job;
pub mod queue;
pub mod reporter;

pub use config::{ConfigError, DeviceConfig, DeviceKind, FarmConfig, ProgramHeader, load_config};
pub use device::{
    ControlFlags, Device, DeviceError, MachineStatus, MaterialState, ProgramOutcome,
};
pub use fabricator::{Fabricator, FabricatorError};
pub use job::{Job, JobStatus};
pub use queue::{JobQueue, QueueError};
pub use reporter::{ChannelReporter, LogReporter, ReporterError, StatusReporter, StatusUpdate};
