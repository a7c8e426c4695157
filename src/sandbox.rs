//! Sandbox executor: run one candidate in an isolated, bounded child process.
//!
//! Isolation here bounds resources and time, not malicious syscalls: the
//! candidate runs under `python -I` (ignores the environment and user
//! site-packages) in a scratch directory, with piped streams and a hard
//! wall-clock deadline. On deadline or cancellation the child is killed and
//! reaped; the scratch file is removed on every exit path.

use crate::config::SandboxConfig;
use crate::error::SessionError;
use crate::util::{tail_chars, CancelToken};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const SANDBOX_ROOT_DIR: &str = "codefix-sandbox";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Resource bounds for one execution.
#[derive(Debug, Clone)]
pub struct Limits {
    pub timeout: Duration,
    pub output_tail_chars: usize,
}

impl From<&SandboxConfig> for Limits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            output_tail_chars: config.output_tail_chars,
        }
    }
}

/// Outcome of exactly one sandbox run. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// None when the child was killed (timeout/cancel) before exiting.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Raised-exception text, verbatim, extracted before the stderr tail
    /// cap so the synthesizer can re-feed it as failure context.
    pub exception: Option<String>,
    pub wall_time: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ExecutionResult {
    /// A run the loop can build on: exited zero, raised nothing, and was
    /// not cut short.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exception.is_none() && self.exit_code == Some(0)
    }
}

/// Removes the scratch file (and its directory, when empty) on every exit
/// path, including panics in the caller.
struct Scratch {
    path: PathBuf,
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Kills and reaps the child if it is still running when dropped, so no
/// exit path can leave an orphaned process.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Execute candidate source in a child interpreter.
///
/// Blocking; the verification controller wraps this in a blocking task.
/// The only errors are fatal host-level ones (cannot write scratch, cannot
/// spawn); a timed out, crashed, or cancelled candidate is a normal
/// `ExecutionResult`.
pub fn execute(
    source: &str,
    program: &str,
    session: &str,
    label: &str,
    limits: &Limits,
    cancel: &CancelToken,
) -> Result<ExecutionResult, SessionError> {
    let dir = std::env::temp_dir()
        .join(SANDBOX_ROOT_DIR)
        .join(sanitize_component(session));
    std::fs::create_dir_all(&dir).map_err(|e| SessionError::Scratch {
        path: dir.clone(),
        source: e,
    })?;

    let path = dir.join(format!("{}.py", sanitize_component(label)));
    std::fs::write(&path, source).map_err(|e| SessionError::Scratch {
        path: path.clone(),
        source: e,
    })?;
    let _scratch = Scratch { path: path.clone() };

    let mut command = Command::new(program);
    command
        .arg("-I")
        .arg(&path)
        .current_dir(&dir)
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let child = command.spawn().map_err(|e| SessionError::Spawn {
        program: program.to_string(),
        source: e,
    })?;
    let mut guard = ChildGuard::new(child);

    // Drain both streams on their own threads so a chatty child can never
    // deadlock against a full pipe while we poll for exit.
    let stdout_handle = guard.child.stdout.take().map(|stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = BufReader::new(stream).read_to_end(&mut buf);
            buf
        })
    });
    let stderr_handle = guard.child.stderr.take().map(|stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = BufReader::new(stream).read_to_end(&mut buf);
            buf
        })
    });

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        match guard.child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if cancel.is_cancelled() {
                    cancelled = true;
                } else if start.elapsed() >= limits.timeout {
                    timed_out = true;
                }
                if cancelled || timed_out {
                    let _ = guard.child.kill();
                    break guard.child.wait().ok();
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(_) => break None,
        }
    };
    guard.reaped = true;
    let wall_time = start.elapsed();

    let stdout_bytes = stdout_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr_bytes = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
    let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();

    // Extract the traceback before capping the tail.
    let exception = if timed_out || cancelled {
        None
    } else {
        extract_exception(&stderr)
    };

    Ok(ExecutionResult {
        exit_code: status.and_then(|s| s.code()),
        stdout: tail_chars(&stdout, limits.output_tail_chars),
        stderr: tail_chars(&stderr, limits.output_tail_chars),
        exception,
        wall_time,
        timed_out,
        cancelled,
    })
}

/// Pull the raised-exception text out of captured stderr, verbatim.
///
/// Covers both shapes CPython emits: a `Traceback (most recent call last):`
/// block for runtime errors, and the header-less `File ... / SyntaxError:`
/// block for compile-time ones.
pub fn extract_exception(stderr: &str) -> Option<String> {
    if let Some(idx) = stderr.rfind("Traceback (most recent call last):") {
        let text = stderr[idx..].trim_end();
        return Some(text.to_string());
    }

    let error_line = regex::Regex::new(
        r"(?m)^[A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Warning|StopIteration)\b.*$",
    )
    .ok()?;
    let last = error_line.find_iter(stderr).last()?;

    // Include the preceding `File "...", line N` context when present.
    let head = &stderr[..last.start()];
    let start = head.rfind("  File \"").unwrap_or(last.start());
    Some(stderr[start..last.end()].trim_end().to_string())
}

fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect::<String>();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(secs: u64) -> Limits {
        Limits {
            timeout: Duration::from_secs(secs),
            output_tail_chars: 8_000,
        }
    }

    fn run(source: &str, label: &str, limits: &Limits) -> ExecutionResult {
        execute(
            source,
            "python3",
            "sandbox-tests",
            label,
            limits,
            &CancelToken::new(),
        )
        .expect("sandbox run")
    }

    #[test]
    fn test_stdout_and_exit_code_captured() {
        let result = run("print('hello')\n", "stdout", &limits(5));
        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("hello"));
        assert!(result.exception.is_none());
    }

    #[test]
    fn test_runtime_exception_extracted_verbatim() {
        let result = run("x = 1/0\n", "zerodiv", &limits(5));
        assert!(!result.succeeded());
        assert_ne!(result.exit_code, Some(0));
        let exception = result.exception.expect("exception text");
        assert!(exception.starts_with("Traceback"));
        assert!(exception.contains("ZeroDivisionError"));
    }

    #[test]
    fn test_syntax_error_extracted_without_traceback_header() {
        let result = run("for i in range(10): print(i\n", "synerr", &limits(5));
        assert!(!result.succeeded());
        let exception = result.exception.expect("exception text");
        assert!(exception.contains("SyntaxError"));
    }

    #[test]
    fn test_timeout_kills_child_within_bound() {
        let start = Instant::now();
        let result = run("while True:\n    pass\n", "spin", &limits(1));
        assert!(result.timed_out);
        assert!(!result.succeeded());
        // timeout plus small bounded overhead, never the loop's own pace
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_cancel_interrupts_execution() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = execute(
            "while True:\n    pass\n",
            "python3",
            "sandbox-tests",
            "cancelled",
            &limits(30),
            &cancel,
        )
        .expect("sandbox run");
        assert!(result.cancelled);
        assert!(result.wall_time < Duration::from_secs(5));
    }

    #[test]
    fn test_scratch_file_removed_after_run() {
        let result = run("print('cleanup')\n", "cleanup-check", &limits(5));
        assert!(result.succeeded());
        let path = std::env::temp_dir()
            .join(SANDBOX_ROOT_DIR)
            .join("sandbox-tests")
            .join("cleanup-check.py");
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_interpreter_is_fatal() {
        let err = execute(
            "print('x')\n",
            "definitely-not-a-python",
            "sandbox-tests",
            "nospawn",
            &limits(5),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Spawn { .. }));
    }

    #[test]
    fn test_extract_exception_from_canned_traceback() {
        let stderr = "Traceback (most recent call last):\n  File \"snippet.py\", line 2, in <module>\n    main()\nNameError: name 'main' is not defined\n";
        let exception = extract_exception(stderr).unwrap();
        assert!(exception.starts_with("Traceback"));
        assert!(exception.ends_with("NameError: name 'main' is not defined"));
    }

    #[test]
    fn test_extract_exception_absent_on_clean_stderr() {
        assert!(extract_exception("").is_none());
        assert!(extract_exception("some harmless warning text\n").is_none());
    }
}
