use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use adb_job_engine::app::config::load_config;
use adb_job_engine::app::engine::{resolve_trace_id, Engine};
use adb_job_engine::app::logging::init_logging;
use adb_job_engine::app::models::{Device, DeviceRef, JobState};
use serde::Serialize;

const JOB_WAIT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct Args {
    device: Option<DeviceRef>,
    out_dir: Option<PathBuf>,
    json: bool,
    remote: Option<String>,
    with_session: bool,
    with_screenshot: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    model: Option<String>,
    out_dir: String,
    artifacts: HashMap<String, String>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|skip
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut device = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(DeviceRef::from);
    let mut out_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut remote: Option<String> = None;
    let mut with_session = false;
    let mut with_screenshot = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                let value = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| "--serial requires a value".to_string())?;
                device = Some(DeviceRef::from(value));
            }
            "--device" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--device requires a value".to_string())?;
                let ordinal = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("--device expects a 1-based number, got {value}"))?;
                device = Some(DeviceRef::Ordinal(ordinal));
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--remote" => {
                remote = Some(
                    it.next()
                        .ok_or_else(|| "--remote requires a value".to_string())?,
                );
            }
            "--json" => {
                json = true;
            }
            "--with-session" => {
                with_session = true;
            }
            "--with-screenshot" => {
                with_screenshot = true;
            }
            "--help" | "-h" => {
                return Err(
                    "usage: smoke [--serial S | --device N] [--out DIR] [--remote PATH] \
                     [--with-session] [--with-screenshot] [--json]"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown argument: {other}")),
        }
    }

    Ok(Args {
        device,
        out_dir,
        json,
        remote,
        with_session,
        with_screenshot,
    })
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> bool
where
    F: FnOnce() -> Result<(), (String, String)>,
{
    let start = Instant::now();
    let (status, error_code, error) = match f() {
        Ok(()) => ("pass", None, None),
        Err((code, message)) => ("fail", Some(code), Some(message)),
    };
    checks.push(SmokeCheck {
        name,
        status,
        duration_ms: start.elapsed().as_millis(),
        error_code,
        error,
    });
    status == "pass"
}

fn skip(checks: &mut Vec<SmokeCheck>, name: &'static str) {
    checks.push(SmokeCheck {
        name,
        status: "skip",
        duration_ms: 0,
        error_code: None,
        error: None,
    });
}

fn finished_job(engine: &Engine, job_id: &str) -> Result<(), (String, String)> {
    let job = engine
        .wait_for(job_id, JOB_WAIT)
        .ok_or_else(|| ("ERR_JOB".to_string(), format!("Job {job_id} disappeared")))?;
    match job.state {
        JobState::Succeeded => Ok(()),
        state => {
            let (code, cause) = job
                .error
                .map(|error| (error.kind.code().to_string(), error.cause))
                .unwrap_or_else(|| ("ERR_JOB".to_string(), format!("Job ended {state:?}")));
            Err((code, cause))
        }
    }
}

fn emit(summary: &SmokeSummary, json: bool) {
    let output = if json {
        serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut text = format!(
            "status: {}\ntrace_id: {}\nout: {}\n",
            summary.status, summary.trace_id, summary.out_dir
        );
        for check in &summary.checks {
            text.push_str(&format!(
                "  {:<12} {:<4} {}ms {}\n",
                check.name,
                check.status,
                check.duration_ms,
                check.error.as_deref().unwrap_or("")
            ));
        }
        text
    };
    println!("{output}");
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = resolve_trace_id(None);
    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("adb_job_engine_smoke_{trace_id}"));
        p
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let mut summary = SmokeSummary {
        tool: "adb_job_engine_smoke",
        status: "pass",
        trace_id: trace_id.clone(),
        serial: None,
        model: None,
        out_dir: out_dir.to_string_lossy().to_string(),
        artifacts: HashMap::new(),
        checks: Vec::new(),
    };

    let mut config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            summary.status = "fail";
            summary.checks.push(SmokeCheck {
                name: "load_config",
                status: "fail",
                duration_ms: 0,
                error_code: Some(err.code.clone()),
                error: Some(err.error),
            });
            emit(&summary, args.json);
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.level);
    config.capture.artifact_root = out_dir.to_string_lossy().to_string();

    let engine = match Engine::new(config) {
        Ok((engine, _events)) => engine,
        Err(err) => {
            summary.status = "fail";
            summary.checks.push(SmokeCheck {
                name: "transport",
                status: "fail",
                duration_ms: 0,
                error_code: Some(err.code.clone()),
                error: Some(err.error),
            });
            emit(&summary, args.json);
            std::process::exit(1);
        }
    };

    let mut device: Option<Device> = None;
    let reference = args.device.clone().unwrap_or(DeviceRef::Ordinal(1));
    if !run_check(&mut summary.checks, "resolve", || {
        let resolved = engine
            .resolve(reference, &trace_id)
            .map_err(|err| (err.code.clone(), err.error))?;
        device = Some(resolved);
        Ok(())
    }) {
        summary.status = "fail";
        emit(&summary, args.json);
        std::process::exit(1);
    }
    let Some(device) = device else {
        std::process::exit(1);
    };
    summary.serial = Some(device.serial.clone());
    summary.model = Some(device.model.clone());

    let mut artifacts: HashMap<String, String> = HashMap::new();
    let mut checks: Vec<SmokeCheck> = std::mem::take(&mut summary.checks);
    let mut ok = true;

    ok &= run_check(&mut checks, "device_info", || {
        let info = engine.device_info(&device, &trace_id);
        let path = out_dir.join("device_info.json");
        let body = serde_json::to_string_pretty(&info)
            .map_err(|err| ("ERR_IO".to_string(), format!("Failed to serialize: {err}")))?;
        fs::write(&path, body)
            .map_err(|err| ("ERR_IO".to_string(), format!("Failed to write: {err}")))?;
        artifacts.insert("device_info".to_string(), path.to_string_lossy().to_string());
        Ok(())
    });

    ok &= run_check(&mut checks, "shell", || {
        let ticket = engine
            .run_command(&device, "echo smoke", None, &trace_id)
            .map_err(|err| (err.code.clone(), err.error))?;
        finished_job(&engine, ticket.job_id())?;
        match ticket.wait() {
            Some(output) if output.stdout.trim() == "smoke" => Ok(()),
            Some(output) => Err((
                "ERR_OUTPUT".to_string(),
                format!("Unexpected output: {}", output.stdout.trim()),
            )),
            None => Err(("ERR_OUTPUT".to_string(), "No output".to_string())),
        }
    });

    match &args.remote {
        Some(remote) => {
            ok &= run_check(&mut checks, "pull", || {
                let job_id = engine
                    .pull_to_artifacts(&device, remote, &trace_id)
                    .map_err(|err| (err.code.clone(), err.error))?;
                finished_job(&engine, &job_id)?;
                artifacts.insert(
                    "pull".to_string(),
                    engine.artifact_dir(&device).to_string_lossy().to_string(),
                );
                Ok(())
            });
        }
        None => skip(&mut checks, "pull"),
    }

    if args.with_session {
        ok &= run_check(&mut checks, "session", || {
            let shell = engine
                .start_shell_session(&device, "echo ready; sleep 30", &trace_id)
                .map_err(|err| (err.code.clone(), err.error))?;
            let first = shell.lines.recv_timeout(Duration::from_secs(10)).ok();
            let state = engine
                .cancel(&shell.job_id, &trace_id)
                .map_err(|err| (err.code.clone(), err.error))?;
            if first.as_deref() != Some("ready") {
                return Err(("ERR_OUTPUT".to_string(), "Session printed nothing".to_string()));
            }
            if state != JobState::Cancelled {
                return Err((
                    "ERR_SESSION".to_string(),
                    format!("Session ended {state:?} instead of Cancelled"),
                ));
            }
            Ok(())
        });
    } else {
        skip(&mut checks, "session");
    }

    if args.with_screenshot {
        ok &= run_check(&mut checks, "screenshot", || {
            let ticket = engine
                .capture_screenshot(&device, &trace_id)
                .map_err(|err| (err.code.clone(), err.error))?;
            finished_job(&engine, ticket.job_id())?;
            let path = ticket
                .wait()
                .ok_or_else(|| ("ERR_OUTPUT".to_string(), "No screenshot path".to_string()))?;
            artifacts.insert("screenshot".to_string(), path.to_string_lossy().to_string());
            Ok(())
        });
    } else {
        skip(&mut checks, "screenshot");
    }

    summary.checks.extend(checks);
    summary.artifacts = artifacts;
    if !ok {
        summary.status = "fail";
    }
    emit(&summary, args.json);
    if summary.status != "pass" {
        std::process::exit(1);
    }
}
