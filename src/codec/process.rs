//! # Codec Subprocess Lifecycle
//!
//! Reference codecs are long-running blocking subprocesses. Each invocation:
//!
//! 1. spawns the binary with stdout/stderr piped and drained on helper threads
//!    (a chatty encoder must never block on a full pipe),
//! 2. polls for exit, the caller's timeout and the sweep's [`CancelToken`],
//! 3. on timeout or cancellation kills the child and reaps it before returning,
//!    so no orphan keeps writing into a temporary directory that is about to be
//!    removed.
//!
//! A non-zero exit status is reported as a codec error carrying the tail of the
//! captured stderr. Nothing is retried: a failing invocation fails its sample.

// Standard library imports
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// External crate imports
use log::{debug, warn};

// Internal module imports
use crate::core::CancelToken;
use crate::error::{EvalError, EvalResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL_BYTES: usize = 4096;

/// One subprocess invocation.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Codec identity for diagnostics
    pub codec: &'a str,
    /// `encode` or `decode`
    pub stage: &'a str,
    pub program: &'a Path,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub timeout: Duration,
}

/// Captured result of a successful invocation.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn tail(text: &str) -> String {
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Run one codec subprocess to completion.
///
/// Time complexity: bounded by `invocation.timeout` plus one poll interval.
///
/// Missing functionality: the child is killed, not its process group; codecs
/// that fork helpers of their own may leave those running after a timeout.
pub fn run(invocation: &Invocation<'_>, cancel: &CancelToken) -> EvalResult<ProcessOutput> {
    cancel.check(invocation.stage)?;
    debug!(
        "{} {}: {} {}",
        invocation.codec,
        invocation.stage,
        invocation.program.display(),
        invocation.args.join(" ")
    );

    let started = Instant::now();
    let mut child = Command::new(invocation.program)
        .args(invocation.args)
        .current_dir(invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            EvalError::codec(
                invocation.codec,
                invocation.stage,
                format!("failed to start {}: {}", invocation.program.display(), e),
            )
            .with_recovery_suggestion("check that the codec binary exists and is executable")
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                terminate(&mut child);
                return Err(EvalError::io(format!("waiting for {}", invocation.stage), e));
            }
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            // Drain threads are detached: a grandchild may still hold the pipes.
            drop((stdout, stderr));
            return Err(EvalError::cancelled(format!(
                "{} {}",
                invocation.codec, invocation.stage
            )));
        }
        if started.elapsed() >= invocation.timeout {
            terminate(&mut child);
            drop((stdout, stderr));
            warn!(
                "{} {} killed after {:?}",
                invocation.codec, invocation.stage, invocation.timeout
            );
            return Err(EvalError::codec_timeout(
                invocation.codec,
                invocation.stage,
                invocation.timeout.as_millis() as u64,
            ));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = ProcessOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
        elapsed: started.elapsed(),
    };
    if !output.status.success() {
        return Err(EvalError::codec_exit(
            invocation.codec,
            invocation.stage,
            output.status.code(),
            tail(&output.stderr),
        ));
    }
    debug!(
        "{} {} finished in {:?}",
        invocation.codec, invocation.stage, output.elapsed
    );
    Ok(output)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolve a codec binary to an absolute path.
///
/// Paths with more than one component are taken as given (relative to the
/// current directory); bare names are searched on `PATH`. The result is
/// absolute because codecs run with their temporary directory as cwd.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return is_executable(binary)
            .then(|| std::fs::canonicalize(binary).ok())
            .flatten();
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}
