use super::*;

use std::fs;
use std::thread;
use std::time::Instant;

use crate::app::models::ProgressSample;
use crate::app::test_support::FakeTransport;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);
const SERIAL: &str = "ABC123";

fn engine_with(fake: FakeTransport, max_workers: usize) -> (TempDir, Engine, Receiver<EngineEvent>) {
    let (dir, transport) = fake.install();
    let sdcard = dir.path().join("sdcard");
    fs::create_dir(&sdcard).expect("mkdir sdcard");

    let mut config = EngineConfig::default();
    config.transfer.poll_interval_ms = 50;
    config.session.interrupt_grace_ms = 2000;
    config.scheduler.max_workers = max_workers;
    config.capture.artifact_root = dir.path().join("artifacts").to_string_lossy().to_string();
    config.capture.remote_dir = sdcard.to_string_lossy().to_string();
    let (engine, events) = Engine::with_transport(config, transport);
    (dir, engine, events)
}

fn one_device() -> FakeTransport {
    FakeTransport::new()
        .device(SERIAL, "device")
        .prop("ro.product.model", "Pixel 7")
}

fn wait_until_running(engine: &Engine, job_id: &str) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if engine.job(job_id).map(|job| job.state) == Some(JobState::Running) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("job {job_id} never started");
}

fn progress_for(events: &Receiver<EngineEvent>, job_id: &str) -> Vec<ProgressSample> {
    events
        .try_iter()
        .filter_map(|event| match event {
            EngineEvent::Progress { job_id: id, sample } if id == job_id => Some(sample),
            _ => None,
        })
        .collect()
}

#[test]
fn first_ordinal_resolves_to_the_only_listed_device() {
    let (_dir, engine, _events) = engine_with(FakeTransport::new().device(SERIAL, "device"), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    assert_eq!(device.serial, SERIAL);

    let err = engine.resolve(2usize, "t").unwrap_err();
    assert_eq!(err.kind, ErrorKind::DeviceNotFound);
}

#[test]
fn zero_remote_size_fails_pull_before_any_transfer() {
    let (dir, engine, _events) = engine_with(
        one_device().pull_body(r#"touch "$(dirname "$0")/pull-attempted"; exit 0"#),
        2,
    );
    let device = engine.resolve(SERIAL, "t").expect("resolve");
    let missing = dir.path().join("sdcard").join("missing.bin");

    let err = engine
        .pull(&device, &missing.to_string_lossy(), &dir.path().join("out.bin"), "t")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SizeUnavailable);
    assert!(engine.jobs().is_empty());
    assert!(!dir.path().join("pull-attempted").exists());
}

#[test]
fn push_exit_code_one_fails_the_job_with_command_failed() {
    let (dir, engine, _events) = engine_with(
        one_device().push_body("echo 'remote: Permission denied' >&2; exit 1"),
        2,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let local = dir.path().join("payload.bin");
    fs::write(&local, vec![7u8; 8192]).expect("write");

    let job_id = engine
        .push(&device, &local, "/data/local/tmp/", "t")
        .expect("push queued");
    let job = engine.wait_for(&job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code, Some(1));
    let error = job.error.expect("error");
    assert_eq!(error.kind, ErrorKind::CommandFailed { exit_code: 1 });
    assert!(error.cause.contains("Permission denied"));
}

#[test]
fn interrupted_session_ends_interrupted_not_completed() {
    let (_dir, engine, _events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let shell = engine
        .start_shell_session(&device, "exec sleep 30", "t")
        .expect("start");
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let state = engine.interrupt_session(&shell.job_id, "t").expect("interrupt");
    assert_eq!(state, SessionState::Interrupted);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(shell.session.exit_code(), None);

    let job = engine.wait_for(&shell.job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.kind, JobKind::Session);
}

#[test]
fn session_streams_lines_and_completes() {
    let (_dir, engine, _events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let shell = engine
        .start_shell_session(&device, "echo first; echo second", "t")
        .expect("start");
    let lines: Vec<String> = shell.lines.collect();
    assert_eq!(lines, vec!["first", "second"]);

    let job = engine.wait_for(&shell.job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(
        engine.interrupt_session(&shell.job_id, "t").expect("no-op"),
        SessionState::Completed
    );
}

#[test]
fn second_start_on_running_session_is_busy_and_leaves_it_running() {
    let (_dir, engine, _events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let shell = engine
        .start_shell_session(&device, "exec sleep 30", "t")
        .expect("start");

    let err = shell
        .session
        .start("sh", &["-c".to_string(), "true".to_string()], "t")
        .err()
        .expect("busy");
    assert_eq!(err.kind, ErrorKind::SessionBusy);
    assert_eq!(shell.session.state(), SessionState::Running);

    assert_eq!(engine.cancel(&shell.job_id, "t").expect("cancel"), JobState::Cancelled);
}

#[test]
fn pull_progress_is_monotonic_and_ends_at_one_hundred() {
    let (dir, engine, events) = engine_with(
        one_device().pull_body(r#"head -c 131072 "$1" > "$2"; sleep 0.4; exec cp "$1" "$2""#),
        2,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let remote = dir.path().join("sdcard").join("video.bin");
    fs::write(&remote, vec![3u8; 256 * 1024]).expect("write");
    let local = dir.path().join("video.bin");

    let job_id = engine
        .pull(&device, &remote.to_string_lossy(), &local, "t")
        .expect("pull queued");
    let job = engine.wait_for(&job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Succeeded, "{:?}", job.error);
    assert_eq!(fs::read(&local).expect("read").len(), 256 * 1024);

    let samples = progress_for(&events, &job_id);
    assert!(!samples.is_empty());
    for pair in samples.windows(2) {
        assert!(pair[0].percent <= pair[1].percent);
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    assert_eq!(samples.last().map(|sample| sample.percent), Some(100));
    let last = job.progress.expect("final sample");
    assert_eq!(last.percent, 100);
    assert_eq!(last.bytes_done, 256 * 1024);
}

#[test]
fn job_state_events_arrive_in_order() {
    let (_dir, engine, events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let ticket = engine
        .run_command(&device, "echo hi", None, "t")
        .expect("queued");
    ticket.wait_timeout(WAIT).expect("output");
    engine.wait_for(ticket.job_id(), WAIT).expect("job");

    let states: Vec<JobState> = events
        .try_iter()
        .filter_map(|event| match event {
            EngineEvent::JobState { job_id, state, .. } if job_id == ticket.job_id() => {
                Some(state)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![JobState::Queued, JobState::Running, JobState::Succeeded]
    );
}

#[test]
fn concurrent_transfers_to_one_destination_are_rejected() {
    let (dir, engine, _events) = engine_with(
        one_device().pull_body(r#"sleep 1; exec cp "$1" "$2""#),
        4,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let remote = dir.path().join("sdcard").join("log.txt");
    fs::write(&remote, vec![b'a'; 16 * 1024]).expect("write");
    let local = dir.path().join("log.txt");
    let remote = remote.to_string_lossy().to_string();

    let first = engine.pull(&device, &remote, &local, "t").expect("first");
    let err = engine.pull(&device, &remote, &local, "t").unwrap_err();
    assert_eq!(err.kind, ErrorKind::DestinationBusy);

    let job = engine.wait_for(&first, WAIT).expect("job");
    assert_eq!(job.state, JobState::Succeeded, "{:?}", job.error);

    // Terminal state and reservation release are one step.
    let second = engine
        .pull(&device, &remote, &local, "t")
        .expect("destination free once the first job is terminal");
    assert_eq!(
        engine.wait_for(&second, WAIT).map(|job| job.state),
        Some(JobState::Succeeded)
    );
}

#[test]
fn cancelled_queued_pull_frees_its_destination_while_the_pool_is_busy() {
    let (dir, engine, _events) = engine_with(one_device(), 1);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let busy = engine
        .run_command(&device, "exec sleep 30", None, "t")
        .expect("busy");
    wait_until_running(&engine, busy.job_id());

    let remote = dir.path().join("sdcard").join("p.bin");
    fs::write(&remote, vec![7u8; 8192]).expect("write");
    let remote = remote.to_string_lossy().to_string();
    let local = dir.path().join("p.bin");

    let queued = engine.pull(&device, &remote, &local, "t").expect("queued");
    assert_eq!(
        engine.cancel(&queued, "t").expect("cancel"),
        JobState::Cancelled
    );
    let retry = engine
        .pull(&device, &remote, &local, "t")
        .expect("retry is not DestinationBusy");
    assert_eq!(
        engine.job(&retry).map(|job| job.state),
        Some(JobState::Queued)
    );

    engine.cancel(&retry, "t").expect("cancel retry");
    engine.cancel(busy.job_id(), "t").expect("cancel busy");
    assert_eq!(
        engine.wait_for(busy.job_id(), WAIT).map(|job| job.state),
        Some(JobState::Cancelled)
    );
}

#[test]
fn short_destination_after_clean_exit_is_transfer_incomplete() {
    let (dir, engine, _events) =
        engine_with(one_device().pull_body(r#"printf 'x' > "$2"; exit 0"#), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let remote = dir.path().join("sdcard").join("big.bin");
    fs::write(&remote, vec![0u8; 512 * 1024]).expect("write");

    let job_id = engine
        .pull(
            &device,
            &remote.to_string_lossy(),
            &dir.path().join("big.bin"),
            "t",
        )
        .expect("queued");
    let job = engine.wait_for(&job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.error.map(|error| error.kind),
        Some(ErrorKind::TransferIncomplete)
    );
    // The measured size is kept, not replaced by the source size.
    let last = job.progress.expect("final sample");
    assert_eq!(last.bytes_done, 4096);
    assert!(last.percent < 100);
}

#[test]
fn cancelling_a_running_pull_kills_the_transfer() {
    let (dir, engine, _events) = engine_with(one_device().pull_body("exec sleep 30"), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let remote = dir.path().join("sdcard").join("slow.bin");
    fs::write(&remote, vec![1u8; 8192]).expect("write");

    let job_id = engine
        .pull(
            &device,
            &remote.to_string_lossy(),
            &dir.path().join("slow.bin"),
            "t",
        )
        .expect("queued");
    wait_until_running(&engine, &job_id);

    let started = Instant::now();
    engine.cancel(&job_id, "t").expect("cancel");
    let job = engine.wait_for(&job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn queued_jobs_wait_for_a_free_worker_and_cancel_immediately() {
    let (_dir, engine, _events) = engine_with(one_device(), 1);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let busy = engine
        .run_command(&device, "exec sleep 30", None, "t")
        .expect("first");
    wait_until_running(&engine, busy.job_id());

    let queued = engine
        .run_command(&device, "echo never", None, "t")
        .expect("second");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        engine.job(queued.job_id()).map(|job| job.state),
        Some(JobState::Queued)
    );

    assert_eq!(
        engine.cancel(queued.job_id(), "t").expect("cancel"),
        JobState::Cancelled
    );
    engine.cancel(busy.job_id(), "t").expect("cancel");
    assert_eq!(
        engine.wait_for(busy.job_id(), WAIT).map(|job| job.state),
        Some(JobState::Cancelled)
    );
    assert!(queued.wait_timeout(Duration::from_secs(1)).is_none());
}

#[test]
fn run_command_returns_output_and_records_failures() {
    let (_dir, engine, _events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");

    let ok = engine
        .run_command(&device, "echo hello", None, "t")
        .expect("queued");
    let output = ok.wait_timeout(WAIT).expect("output");
    assert_eq!(output.stdout.trim(), "hello");

    let failing = engine
        .run_command(&device, "echo broken >&2; exit 3", None, "t")
        .expect("queued");
    let output = failing.wait_timeout(WAIT).expect("output");
    assert_eq!(output.exit_code, Some(3));
    let job = engine.wait_for(failing.job_id(), WAIT).expect("job");
    assert_eq!(job.state, JobState::Failed);
    let error = job.error.expect("error");
    assert_eq!(error.kind, ErrorKind::CommandFailed { exit_code: 3 });
    assert!(error.cause.contains("broken"));
}

#[test]
fn command_timeout_is_recorded_on_the_job() {
    let (_dir, engine, _events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let ticket = engine
        .run_command(&device, "exec sleep 30", Some(Duration::from_millis(200)), "t")
        .expect("queued");
    let job = engine.wait_for(ticket.job_id(), WAIT).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.map(|error| error.kind), Some(ErrorKind::Timeout));
}

#[test]
fn missing_transport_is_command_not_found() {
    let (engine, _events) = Engine::with_transport(
        EngineConfig::default(),
        Transport::new("/definitely/not/a/transport"),
    );
    let err = engine.list_devices("t").unwrap_err();
    assert_eq!(err.kind, ErrorKind::CommandNotFound);

    let device = Device {
        serial: SERIAL.to_string(),
        model: String::new(),
    };
    let ticket = engine
        .run_command(&device, "ls", None, "t")
        .expect("queued");
    let job = engine.wait_for(ticket.job_id(), WAIT).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.error.map(|error| error.kind),
        Some(ErrorKind::CommandNotFound)
    );
}

#[test]
fn pull_to_artifacts_uses_model_and_serial_directory() {
    let (dir, engine, _events) = engine_with(
        FakeTransport::new()
            .device("192.168.1.5:5555", "device")
            .prop("ro.product.model", "SM-G991B"),
        2,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let remote = dir.path().join("sdcard").join("trace.txt");
    fs::write(&remote, vec![b'z'; 10_000]).expect("write");

    let job_id = engine
        .pull_to_artifacts(&device, &remote.to_string_lossy(), "t")
        .expect("queued");
    let job = engine.wait_for(&job_id, WAIT).expect("job");
    assert_eq!(job.state, JobState::Succeeded, "{:?}", job.error);

    let expected = dir
        .path()
        .join("artifacts")
        .join("SM-G991B-192_168_1_5_5555")
        .join("trace.txt");
    assert!(expected.is_file());
}

#[test]
fn screenshot_runs_as_a_command_job() {
    let (dir, engine, _events) = engine_with(
        one_device().shell_case(
            "\"screencap -p \"*",
            r#"eval "set -- $1"; printf 'PNG' > "$3"; exit 0"#,
        ),
        2,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let ticket = engine.capture_screenshot(&device, "t").expect("queued");
    let path = ticket.wait_timeout(WAIT).expect("path");
    assert!(path.starts_with(
        dir.path()
            .join("artifacts")
            .join("Pixel 7-ABC123")
            .join("screenshot")
    ));
    assert_eq!(
        engine.wait_for(ticket.job_id(), WAIT).map(|job| job.state),
        Some(JobState::Succeeded)
    );
}

#[test]
fn cancelling_a_running_screenshot_ends_it_cancelled() {
    let (_dir, engine, _events) = engine_with(
        one_device().shell_case("\"screencap -p \"*", "exec sleep 30"),
        2,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let ticket = engine.capture_screenshot(&device, "t").expect("queued");
    wait_until_running(&engine, ticket.job_id());
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    engine.cancel(ticket.job_id(), "t").expect("cancel");
    let job = engine.wait_for(ticket.job_id(), WAIT).expect("job");
    assert_eq!(job.state, JobState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(ticket.wait_timeout(Duration::from_secs(1)).is_none());
}

#[test]
fn recordings_on_two_devices_do_not_share_state() {
    let (dir, engine, _events) = engine_with(
        FakeTransport::new()
            .device("ONE", "device")
            .device("TWO", "device")
            .shell_case(
                "\"screenrecord \"*",
                r#"eval "set -- $1"; printf 'MP4' > "$2"; exec sleep 30"#,
            )
            .shell_case("\"pkill \"*", "exit 0"),
        2,
    );
    let one = engine.resolve(1usize, "t").expect("one");
    let two = engine.resolve(2usize, "t").expect("two");
    let first = engine.start_recording(&one, "t").expect("first");
    let second = engine.start_recording(&two, "t").expect("second");
    thread::sleep(Duration::from_millis(200));

    let path = first.stop("t").expect("stop first");
    assert!(path.starts_with(dir.path().join("artifacts").join("-ONE")));
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(
        first.stop("t").unwrap_err().kind,
        ErrorKind::Validation
    );

    second.stop("t").expect("stop second");
    assert_eq!(
        engine.wait_for(second.job_id(), WAIT).map(|job| job.state),
        Some(JobState::Cancelled)
    );
}

#[test]
fn device_info_survives_individual_property_failures() {
    let (_dir, engine, _events) = engine_with(
        one_device()
            .failing_prop("ro.build.version.release")
            .prop("ro.product.cpu.abi", "arm64-v8a"),
        2,
    );
    let device = engine.resolve(1usize, "t").expect("resolve");
    let info = engine.device_info(&device, "t");
    assert_eq!(info.model, "Pixel 7");
    assert_eq!(info.android_version, "");
    assert_eq!(info.abi, "arm64-v8a");

    let props = engine.query_properties(&device, &["ro.product.model", "ro.build.version.release"], "t");
    assert_eq!(props[0].value, "Pixel 7");
    assert_eq!(props[1].value, "");
}

#[test]
fn acknowledge_drops_only_terminal_jobs() {
    let (_dir, engine, _events) = engine_with(one_device(), 2);
    let device = engine.resolve(1usize, "t").expect("resolve");
    let ticket = engine
        .run_command(&device, "exec sleep 30", None, "t")
        .expect("queued");
    wait_until_running(&engine, ticket.job_id());
    assert_eq!(
        engine.acknowledge(ticket.job_id(), "t").unwrap_err().kind,
        ErrorKind::Validation
    );

    engine.cancel(ticket.job_id(), "t").expect("cancel");
    engine.wait_for(ticket.job_id(), WAIT).expect("job");
    let job = engine.acknowledge(ticket.job_id(), "t").expect("ack");
    assert_eq!(job.state, JobState::Cancelled);
    assert!(engine.job(ticket.job_id()).is_none());
}
