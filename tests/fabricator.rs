use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use farmhost::device::emulated::EmulatedDevice;
use farmhost::device::{ENDING_SEQUENCE, HOMING_SEQUENCE};
use farmhost::{
    ChannelReporter, Device, Fabricator, FabricatorError, Job, JobStatus, MachineStatus,
    ProgramHeader, ProgramOutcome, ReporterError, StatusReporter, StatusUpdate,
};

const PROGRAM: &str = "\
; test cube
G28 ; home first
G1 X10 Y10

G1 X20 ; wipe
M104 S0
";

fn test_job(content: &str) -> Job {
    Job::new(
        content,
        "test job",
        7,
        JobStatus::Ready,
        "/tmp/test-source.gcode",
        false,
        1,
        "bench emulator",
    )
}

fn farm(
    device: Arc<EmulatedDevice>,
) -> (
    Arc<Fabricator>,
    TempDir,
    mpsc::UnboundedReceiver<StatusUpdate>,
) {
    let dir = tempfile::tempdir().unwrap();
    let (reporter, updates) = ChannelReporter::new();
    let device: Arc<dyn Device> = device;
    let fabricator = Arc::new(Fabricator::new(7, device, Arc::new(reporter), dir.path()));
    (fabricator, dir, updates)
}

async fn wait_for(fabricator: &Fabricator, status: MachineStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while fabricator.status() != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status}"));
}

fn drain(updates: &mut mpsc::UnboundedReceiver<StatusUpdate>) -> Vec<JobStatus> {
    let mut statuses = Vec::new();
    while let Ok(update) = updates.try_recv() {
        statuses.push(update.status);
    }
    statuses
}

#[tokio::test]
async fn begin_on_empty_queue_fails_without_touching_the_device() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let (fabricator, _dir, _updates) = farm(device.clone());
    assert!(matches!(
        fabricator.begin().await,
        Err(FabricatorError::EmptyQueue)
    ));
    assert_eq!(device.status(), MachineStatus::Idle);
    assert!(!device.is_connected());
}

#[tokio::test]
async fn begin_without_a_connection_fails_and_keeps_the_job_queued() {
    let device = Arc::new(EmulatedDevice::new("emu").unplugged());
    let (fabricator, _dir, _updates) = farm(device.clone());
    fabricator.queue().enqueue(test_job(PROGRAM)).await.unwrap();
    assert!(matches!(
        fabricator.begin().await,
        Err(FabricatorError::ConnectionUnavailable(_))
    ));
    assert_eq!(fabricator.queue().len().await, 1);
    assert_eq!(fabricator.status(), MachineStatus::Idle);
}

#[tokio::test]
async fn completed_job_reports_status_and_removes_the_working_file() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let (fabricator, dir, mut updates) = farm(device.clone());
    fabricator.queue().enqueue(test_job(PROGRAM)).await.unwrap();

    let outcome = fabricator.begin().await.unwrap();
    assert_eq!(outcome, ProgramOutcome::Complete);
    assert_eq!(fabricator.status(), MachineStatus::Complete);
    assert_eq!(fabricator.status(), device.status());
    assert!(fabricator.current_job().await.is_none());
    assert!(!device.is_connected());

    // homing first, then the program with comments and blanks stripped
    let mut expected: Vec<String> = HOMING_SEQUENCE.iter().map(|s| s.to_string()).collect();
    expected.extend(["G28", "G1 X10 Y10", "G1 X20", "M104 S0"].map(String::from));
    assert_eq!(device.sent_lines(), expected);

    assert_eq!(drain(&mut updates), [JobStatus::Printing, JobStatus::Complete]);

    // the materialized working copy is gone
    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn comments_only_program_completes_without_machine_commands() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let (fabricator, _dir, _updates) = farm(device.clone());
    fabricator
        .queue()
        .enqueue(test_job("; header\n\n   \n; nothing to do\n"))
        .await
        .unwrap();

    assert_eq!(fabricator.begin().await.unwrap(), ProgramOutcome::Complete);
    // only the homing sequence reached the device, no program commands
    let homing: Vec<String> = HOMING_SEQUENCE.iter().map(|s| s.to_string()).collect();
    assert_eq!(device.sent_lines(), homing);
}

fn long_program(lines: usize) -> String {
    let mut program = String::from("; long running part\n");
    for i in 0..lines {
        program.push_str(&format!("G1 X{i} Y{i}\n"));
    }
    program
}

#[tokio::test]
async fn pause_resume_cancel_reset_cycle() {
    let device = Arc::new(
        EmulatedDevice::new("emu").with_line_delay(Duration::from_millis(15)),
    );
    let (fabricator, _dir, mut updates) = farm(device.clone());
    fabricator
        .queue()
        .enqueue(test_job(&long_program(500)))
        .await
        .unwrap();

    let worker = {
        let fabricator = fabricator.clone();
        tokio::spawn(async move { fabricator.begin().await })
    };

    wait_for(&fabricator, MachineStatus::Printing).await;
    fabricator.pause().await.unwrap();
    assert_eq!(fabricator.status(), MachineStatus::Paused);
    assert_eq!(device.status(), MachineStatus::Paused);

    // after the in-flight line lands, a paused device receives nothing
    tokio::time::sleep(Duration::from_millis(100)).await;
    let parked_at = device.sent_lines().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.sent_lines().len(), parked_at);

    fabricator.resume().await.unwrap();
    assert_eq!(fabricator.status(), MachineStatus::Printing);

    fabricator.cancel().await.unwrap();
    assert_eq!(fabricator.status(), MachineStatus::Cancelled);

    assert_eq!(worker.await.unwrap().unwrap(), ProgramOutcome::Cancelled);
    assert_eq!(device.status(), MachineStatus::Cancelled);

    // safety shutdown went out before the job was finalized
    let sent = device.sent_lines();
    assert!(sent.len() >= ENDING_SEQUENCE.len());
    assert_eq!(&sent[sent.len() - ENDING_SEQUENCE.len()..], ENDING_SEQUENCE);

    fabricator.reset_to_idle().await.unwrap();
    assert_eq!(fabricator.status(), MachineStatus::Idle);
    assert!(fabricator.current_job().await.is_none());

    assert_eq!(
        drain(&mut updates),
        [
            JobStatus::Printing,
            JobStatus::Paused,
            JobStatus::Printing,
            JobStatus::Cancelled,
        ]
    );
}

#[tokio::test]
async fn reset_is_refused_while_cancellation_unwinds() {
    let device = Arc::new(
        EmulatedDevice::new("emu").with_line_delay(Duration::from_millis(15)),
    );
    let (fabricator, _dir, mut updates) = farm(device.clone());
    fabricator
        .queue()
        .enqueue(test_job(&long_program(200)))
        .await
        .unwrap();

    let worker = {
        let fabricator = fabricator.clone();
        tokio::spawn(async move { fabricator.begin().await })
    };
    wait_for(&fabricator, MachineStatus::Printing).await;

    fabricator.cancel().await.unwrap();
    assert_eq!(fabricator.status(), MachineStatus::Cancelled);

    // the worker still owns the machine; resetting now must not clear the
    // cancel signal and let the stream run to completion
    assert!(matches!(
        fabricator.reset_to_idle().await,
        Err(FabricatorError::Busy)
    ));

    assert_eq!(worker.await.unwrap().unwrap(), ProgramOutcome::Cancelled);

    // the stream stopped early and parked the machine safely
    let sent = device.sent_lines();
    assert!(sent.len() < 200);
    assert_eq!(&sent[sent.len() - ENDING_SEQUENCE.len()..], ENDING_SEQUENCE);

    // the cancelled notification went out only after the safety shutdown
    assert_eq!(drain(&mut updates), [JobStatus::Printing, JobStatus::Cancelled]);

    fabricator.reset_to_idle().await.unwrap();
    assert_eq!(fabricator.status(), MachineStatus::Idle);
    assert!(fabricator.current_job().await.is_none());
}

#[tokio::test]
async fn control_calls_after_completion_are_rejected() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let (fabricator, _dir, _updates) = farm(device.clone());
    fabricator.queue().enqueue(test_job(PROGRAM)).await.unwrap();
    assert_eq!(fabricator.begin().await.unwrap(), ProgramOutcome::Complete);

    // a control call racing job finalization must not drag a finished
    // machine back into a paused or printing state
    assert!(matches!(
        fabricator.pause().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert!(matches!(
        fabricator.resume().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert!(matches!(
        fabricator.cancel().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert_eq!(fabricator.status(), MachineStatus::Complete);
}

#[tokio::test]
async fn missing_working_file_parks_the_machine() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let (fabricator, dir, mut updates) = farm(device.clone());

    // materialize up front, then pull the file out from under the job
    let mut job = test_job(PROGRAM);
    let path = job.materialize(dir.path()).await.unwrap();
    tokio::fs::remove_file(&path).await.unwrap();
    fabricator.queue().enqueue(job).await.unwrap();

    match fabricator.begin().await {
        Err(FabricatorError::SourceMissing(missing)) => assert_eq!(missing, path),
        other => panic!("expected SourceMissing, got {other:?}"),
    }
    assert_eq!(fabricator.status(), MachineStatus::Error);
    assert_eq!(device.status(), MachineStatus::Error);
    assert!(!device.is_connected());

    // the safety shutdown ran instead of homing or streaming
    let ending: Vec<String> = ENDING_SEQUENCE.iter().map(|s| s.to_string()).collect();
    assert_eq!(device.sent_lines(), ending);
    assert_eq!(drain(&mut updates), [JobStatus::Printing, JobStatus::Error]);
}

#[tokio::test]
async fn pause_is_rejected_on_a_non_pausable_device() {
    let device = Arc::new(
        EmulatedDevice::new("emu")
            .with_pause(false)
            .with_line_delay(Duration::from_millis(10)),
    );
    let (fabricator, _dir, _updates) = farm(device.clone());
    fabricator
        .queue()
        .enqueue(test_job(&long_program(300)))
        .await
        .unwrap();

    let worker = {
        let fabricator = fabricator.clone();
        tokio::spawn(async move { fabricator.begin().await })
    };

    wait_for(&fabricator, MachineStatus::Printing).await;
    assert!(matches!(
        fabricator.pause().await,
        Err(FabricatorError::Unsupported("pause"))
    ));
    assert_eq!(fabricator.status(), MachineStatus::Printing);

    fabricator.cancel().await.unwrap();
    assert_eq!(worker.await.unwrap().unwrap(), ProgramOutcome::Cancelled);
}

#[tokio::test]
async fn concurrent_begin_is_refused() {
    let device = Arc::new(
        EmulatedDevice::new("emu").with_line_delay(Duration::from_millis(10)),
    );
    let (fabricator, _dir, _updates) = farm(device.clone());
    fabricator
        .queue()
        .enqueue(test_job(&long_program(300)))
        .await
        .unwrap();

    let worker = {
        let fabricator = fabricator.clone();
        tokio::spawn(async move { fabricator.begin().await })
    };
    wait_for(&fabricator, MachineStatus::Printing).await;

    assert!(matches!(
        fabricator.begin().await,
        Err(FabricatorError::Busy)
    ));

    fabricator.cancel().await.unwrap();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn transport_fault_ends_in_error_with_the_connection_released() {
    let device = Arc::new(EmulatedDevice::new("emu").fail_after(0));
    let (fabricator, _dir, mut updates) = farm(device.clone());
    fabricator.queue().enqueue(test_job(PROGRAM)).await.unwrap();

    assert!(matches!(
        fabricator.begin().await,
        Err(FabricatorError::Device(_))
    ));
    assert_eq!(fabricator.status(), MachineStatus::Error);
    assert_eq!(device.status(), MachineStatus::Error);
    assert!(!device.is_connected());
    assert_eq!(drain(&mut updates), [JobStatus::Printing, JobStatus::Error]);
}

#[tokio::test]
async fn invalid_control_calls_do_not_mutate_state() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let (fabricator, _dir, _updates) = farm(device.clone());

    assert!(matches!(
        fabricator.pause().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert!(matches!(
        fabricator.resume().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert!(matches!(
        fabricator.cancel().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert!(matches!(
        fabricator.reset_to_idle().await,
        Err(FabricatorError::InvalidTransition(_))
    ));
    assert_eq!(fabricator.status(), MachineStatus::Idle);
}

struct DeadReporter;

#[async_trait]
impl StatusReporter for DeadReporter {
    async fn job_status_changed(&self, _update: StatusUpdate) -> Result<(), ReporterError> {
        Err(ReporterError::Delivery("status service unreachable".into()))
    }
}

#[tokio::test]
async fn reporter_failures_never_block_a_job() {
    let device = Arc::new(EmulatedDevice::new("emu"));
    let dir = tempfile::tempdir().unwrap();
    let streaming_device: Arc<dyn Device> = device.clone();
    let fabricator = Fabricator::new(7, streaming_device, Arc::new(DeadReporter), dir.path());
    fabricator.queue().enqueue(test_job(PROGRAM)).await.unwrap();
    assert_eq!(fabricator.begin().await.unwrap(), ProgramOutcome::Complete);
    assert_eq!(fabricator.status(), MachineStatus::Complete);
}

#[tokio::test]
async fn header_settings_reach_the_device() {
    let device = EmulatedDevice::new("emu");
    let header = ProgramHeader::extract(
        "; filament_type = PETG\n; filament_diameter = 1.75\n; nozzle_diameter = 0.6\nG28\n",
    );
    header.apply_to(&device);
    let material = device.material();
    assert_eq!(material.filament_type.as_deref(), Some("PETG"));
    assert_eq!(material.filament_diameter, Some(1.75));
    assert_eq!(material.nozzle_diameter, Some(0.6));
}
