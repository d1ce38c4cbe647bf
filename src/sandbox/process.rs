//! Runs submitted Python in a child interpreter.
//!
//! The child runs a small harness that reads a JSON payload from stdin,
//! applies rlimits, executes the code with its stdout/stderr captured, and
//! writes a single JSON envelope to the real stdout. Rust enforces the
//! wall-clock budget and kills the whole process group when it lapses.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceLimits;
use crate::execution::{ExecutionResult, MISSING_RESULT_EXIT_CODE};

/// Exit code reported for runs aborted through the cancellation token.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Name under which the `result` variable is returned in `output_files`.
pub const RESULT_FILE: &str = "result.json";

const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const HARNESS: &str = r#"
import contextlib, io, json, sys, traceback

def _apply_limits(limits):
    try:
        import resource
    except ImportError:
        return
    def cap(kind, value):
        try:
            soft, hard = resource.getrlimit(kind)
            if hard != resource.RLIM_INFINITY:
                value = min(value, hard)
            resource.setrlimit(kind, (value, hard))
        except (ValueError, OSError):
            pass
    cap(resource.RLIMIT_AS, limits["memory_mb"] * 1024 * 1024)
    cap(resource.RLIMIT_FSIZE, limits["max_file_size_kb"] * 1024)
    if hasattr(resource, "RLIMIT_NPROC"):
        cap(resource.RLIMIT_NPROC, limits["max_processes"])

def _max_rss_kb():
    try:
        import resource
    except ImportError:
        return 0
    rss = resource.getrusage(resource.RUSAGE_SELF).ru_maxrss
    return rss // 1024 if sys.platform == "darwin" else rss

def main():
    payload = json.loads(sys.stdin.read())
    _apply_limits(payload["limits"])
    out, err = io.StringIO(), io.StringIO()
    namespace = {"__name__": "__main__", "input_data": payload.get("input_data")}
    exit_code = 0
    with contextlib.redirect_stdout(out), contextlib.redirect_stderr(err):
        try:
            exec(compile(payload["code"], "<submitted>", "exec"), namespace)
        except SystemExit as exc:
            code = exc.code
            exit_code = code if isinstance(code, int) else (0 if code is None else 1)
        except BaseException:
            traceback.print_exc()
            exit_code = 1
    has_result = "result" in namespace
    result = None
    if has_result:
        try:
            result = json.loads(json.dumps(namespace["result"], default=str))
        except (TypeError, ValueError):
            result = repr(namespace["result"])
    if payload.get("require_result") and exit_code == 0 and not has_result:
        err.write("submitted code did not assign a top-level `result` variable\n")
        exit_code = MISSING_RESULT
    envelope = {
        "stdout": out.getvalue(),
        "stderr": err.getvalue(),
        "exit_code": exit_code,
        "memory_usage_kb": _max_rss_kb(),
        "has_result": has_result,
        "result": result,
    }
    sys.__stdout__.write(json.dumps(envelope))
    sys.__stdout__.flush()

main()
"#;

#[derive(Serialize)]
struct HarnessPayload<'a> {
    code: &'a str,
    input_data: Option<&'a Value>,
    limits: &'a ResourceLimits,
    require_result: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    stdout: String,
    stderr: String,
    exit_code: i32,
    #[serde(default)]
    memory_usage_kb: u64,
    #[serde(default)]
    has_result: bool,
    #[serde(default)]
    result: Option<Value>,
}

/// How a child run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    Finished,
    TimedOut,
    Cancelled,
    /// The interpreter could not be started or fed its payload
    SpawnFailed,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub result: ExecutionResult,
    pub end: ProcessEnd,
}

/// Spawns the harness under an interpreter.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    interpreter: String,
}

impl ProcessRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Run `code` in a fresh working directory. Files the code leaves in
    /// that directory are returned in `output_files`.
    pub async fn run(
        &self,
        code: &str,
        input_data: Option<&Value>,
        limits: &ResourceLimits,
        require_result: bool,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        let start = Instant::now();
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return spawn_failed(format!("failed to create working directory: {}", e), start),
        };

        let payload = HarnessPayload {
            code,
            input_data,
            limits,
            require_result,
        };
        let payload = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => return spawn_failed(format!("failed to encode payload: {}", e), start),
        };

        let harness = HARNESS.replace("MISSING_RESULT", &MISSING_RESULT_EXIT_CODE.to_string());
        let mut command = Command::new(&self.interpreter);
        command
            .arg("-c")
            .arg(harness)
            .current_dir(workdir.path())
            .env_clear()
            .env("HOME", workdir.path())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("OPENBLAS_NUM_THREADS", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return spawn_failed(
                    format!("failed to start interpreter `{}`: {}", self.interpreter, e),
                    start,
                )
            }
        };
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                let _ = child.start_kill();
                return spawn_failed(format!("failed to send payload: {}", e), start);
            }
            // Dropping closes the pipe so the harness sees EOF.
        }
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(capture(s)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(capture(s)));

        let end = tokio::select! {
            status = child.wait() => match status {
                Ok(_) => ProcessEnd::Finished,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed waiting for interpreter");
                    ProcessEnd::SpawnFailed
                }
            },
            _ = tokio::time::sleep(limits.timeout()) => ProcessEnd::TimedOut,
            _ = cancel.cancelled() => ProcessEnd::Cancelled,
        };
        if end != ProcessEnd::Finished {
            kill_process_group(pid, &mut child).await;
        }
        let status = child.try_wait().ok().flatten();

        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let mut result = match end {
            ProcessEnd::TimedOut => {
                ExecutionResult::timed_out(limits.timeout_seconds, elapsed_ms, String::new())
            }
            ProcessEnd::Cancelled => ExecutionResult {
                stderr: "Execution cancelled".to_string(),
                exit_code: CANCELLED_EXIT_CODE,
                execution_time_ms: elapsed_ms,
                ..Default::default()
            },
            ProcessEnd::SpawnFailed => {
                ExecutionResult::backend_failure("interpreter exited abnormally", elapsed_ms)
            }
            ProcessEnd::Finished => {
                let exit = status.and_then(|s| s.code());
                parse_envelope(&stdout, &stderr, exit, elapsed_ms)
            }
        };

        if end == ProcessEnd::Finished {
            collect_output_files(workdir.path(), limits, &mut result).await;
        }
        ProcessOutcome { result, end }
    }
}

fn spawn_failed(message: String, start: Instant) -> ProcessOutcome {
    tracing::error!(error = %message, "Sandbox process could not be started");
    ProcessOutcome {
        result: ExecutionResult::backend_failure(message, start.elapsed().as_millis() as u64),
        end: ProcessEnd::SpawnFailed,
    }
}

async fn capture<R: AsyncRead + Unpin>(reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.take(MAX_CAPTURE_BYTES).read_to_end(&mut buf).await;
    buf
}

async fn drain(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => bytes,
        _ => Vec::new(),
    }
}

async fn kill_process_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    if let (true, Some(pid)) = (cfg!(unix), pid) {
        // The child leads its own group, so this also reaches anything it spawned.
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg(format!("-{}", pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Turn the harness envelope into a result. Anything that is not a valid
/// envelope is reported as a parse failure of the sandbox output.
fn parse_envelope(
    stdout: &[u8],
    stderr: &[u8],
    process_exit: Option<i32>,
    elapsed_ms: u64,
) -> ExecutionResult {
    match serde_json::from_slice::<Envelope>(stdout) {
        Ok(envelope) => {
            let mut output_files = BTreeMap::new();
            if envelope.has_result {
                let value = envelope.result.unwrap_or(Value::Null);
                output_files.insert(RESULT_FILE.to_string(), value.to_string());
            }
            let mut stderr_text = envelope.stderr;
            let interpreter_stderr = String::from_utf8_lossy(stderr);
            if !interpreter_stderr.trim().is_empty() {
                stderr_text.push_str(&interpreter_stderr);
            }
            ExecutionResult {
                stdout: envelope.stdout,
                stderr: stderr_text,
                exit_code: envelope.exit_code,
                execution_time_ms: elapsed_ms,
                memory_usage_kb: envelope.memory_usage_kb,
                output_files,
            }
        }
        Err(e) => {
            let exit_code = match process_exit {
                Some(code) if code != 0 => code,
                _ => 1,
            };
            ExecutionResult {
                stdout: String::from_utf8_lossy(stdout).to_string(),
                stderr: format!(
                    "failed to parse sandbox output: {}\n{}",
                    e,
                    String::from_utf8_lossy(stderr)
                ),
                exit_code,
                execution_time_ms: elapsed_ms,
                ..Default::default()
            }
        }
    }
}

/// Read files the code left behind, skipping anything over the per-file
/// or total quota and anything that is not UTF-8 text.
async fn collect_output_files(dir: &Path, limits: &ResourceLimits, result: &mut ExecutionResult) {
    let max_file = limits.max_file_size_kb * 1024;
    let quota = limits.disk_quota_mb * 1024 * 1024;
    let mut used = 0u64;
    let mut skipped = Vec::new();

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let name = match path.strip_prefix(dir) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if name == RESULT_FILE && result.output_files.contains_key(RESULT_FILE) {
                continue;
            }
            if meta.len() > max_file || used + meta.len() > quota {
                skipped.push(format!("{} (too large)", name));
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        used += meta.len();
                        result.output_files.insert(name, text);
                    }
                    Err(_) => skipped.push(format!("{} (not UTF-8)", name)),
                },
                Err(_) => skipped.push(format!("{} (unreadable)", name)),
            }
        }
    }

    if !skipped.is_empty() {
        tracing::warn!(files = ?skipped, "Output files skipped");
        result
            .stderr
            .push_str(&format!("output files skipped: {}\n", skipped.join(", ")));
    }
}
