//! Launching, probing, and stopping the lab's server processes.
//!
//! A server is spawned detached (own process group, output appended to its
//! log file) and its pid is recorded before readiness is confirmed, so a
//! half-started process can still be found by `stop`. Readiness means an
//! HTTP 200 from the probe URL; a listening socket alone is not enough.
//!
//! Stopping walks [`StopStrategy`] in order: the recorded pid, then any
//! process whose command line matches the server's, then any listener on
//! its port. Each step is best-effort and finding nothing is fine.

use std::fs::OpenOptions;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client;
use crate::error::ProcessError;
use crate::procfs;
use crate::state::{self, ServerHandle};

/// Lines of server log attached to a readiness timeout.
const LOG_TAIL_LINES: usize = 20;
/// How often a terminating process is re-checked.
const EXIT_POLL: Duration = Duration::from_millis(200);
/// Wait after SIGKILL before giving up on a pid.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Everything needed to start one server and find it again later.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Listen port; `0` disables the port stop strategy.
    pub port: u16,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
    /// Substrings that must all appear in a process's command line for the
    /// pattern strategy to treat it as this server.
    pub patterns: Vec<String>,
}

impl ServerSpec {
    /// Spec for `<program> <args...>` whose pattern is the program path
    /// plus `config` (the config file is what makes the process ours).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        program: &Path,
        args: Vec<String>,
        config: &Path,
        port: u16,
        log_path: PathBuf,
        pid_path: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.to_path_buf(),
            args,
            port,
            log_path,
            pid_path,
            patterns: vec![
                program.display().to_string(),
                config.display().to_string(),
            ],
        }
    }
}

// ── Start ────────────────────────────────────────────────────────────

/// Spawn the server detached and record its pid immediately.
///
/// # Errors
///
/// Returns [`ProcessError::Spawn`] if the program cannot be started, or
/// [`ProcessError::Io`] if the log or PID file cannot be written.
pub fn launch(spec: &ServerSpec) -> Result<ServerHandle, ProcessError> {
    if let Some(parent) = spec.log_path.parent() {
        std::fs::create_dir_all(parent).map_err(ProcessError::io(parent))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .map_err(ProcessError::io(&spec.log_path))?;
    let log_err = log.try_clone().map_err(ProcessError::io(&spec.log_path))?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Keep the server out of the terminal's process group so Ctrl-C on
        // the controller does not take it down.
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    // Dropping the handle neither waits for nor kills the child.
    drop(child);

    state::write_pid(&spec.pid_path, pid).map_err(ProcessError::io(&spec.pid_path))?;
    info!(server = %spec.name, pid, port = spec.port, log = %spec.log_path.display(), "launched");

    Ok(ServerHandle {
        name: spec.name.clone(),
        pid,
        listen_port: spec.port,
        log_path: spec.log_path.clone(),
        pid_path: spec.pid_path.clone(),
    })
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
#[must_use]
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok()
}

// ── Readiness ────────────────────────────────────────────────────────

/// Call `check` every `interval` until it returns `true` or `timeout`
/// elapses. Returns whether the condition was met.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for `url` to answer HTTP 200.
///
/// # Errors
///
/// Returns [`ProcessError::ReadinessTimeout`] carrying the log tail. The
/// process is left running for inspection.
pub async fn wait_ready(
    http: &reqwest::Client,
    name: &str,
    url: &str,
    log_path: &Path,
    timeout: Duration,
    interval: Duration,
) -> Result<(), ProcessError> {
    debug!(server = name, url, timeout_secs = timeout.as_secs(), "waiting for readiness");
    let ready = poll_until(timeout, interval, || async {
        match client::probe(http, url).await {
            Ok(status) if status == StatusCode::OK => true,
            Ok(status) => {
                debug!(server = name, %status, "not ready yet");
                false
            }
            Err(_) => false,
        }
    })
    .await;

    if ready {
        info!(server = name, url, "ready");
        Ok(())
    } else {
        Err(ProcessError::ReadinessTimeout {
            name: name.to_owned(),
            url: url.to_owned(),
            timeout_secs: timeout.as_secs(),
            log_path: log_path.to_path_buf(),
            log_tail: log_tail(log_path, LOG_TAIL_LINES),
        })
    }
}

/// Last `lines` lines of a log file, or an empty string.
#[must_use]
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

// ── Stop ─────────────────────────────────────────────────────────────

/// The ordered fallbacks used to find a server to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    PidFile,
    Pattern,
    Port,
}

impl StopStrategy {
    pub const ORDER: [Self; 3] = [Self::PidFile, Self::Pattern, Self::Port];
}

/// What a stop sweep found and terminated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<(StopStrategy, u32)>,
}

impl StopReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty()
    }
}

/// The pid recorded for `spec`, if that process is alive and its command
/// line still carries the spec's patterns. A recycled pid belonging to an
/// unrelated process yields `None`.
#[must_use]
pub fn tracked_pid(spec: &ServerSpec) -> Option<u32> {
    let pid = state::read_pid(&spec.pid_path)?;
    if !pid_alive(pid) {
        debug!(server = %spec.name, pid, "pid file is stale");
        return None;
    }
    let needles: Vec<&str> = spec.patterns.iter().map(String::as_str).collect();
    if procfs::cmdline_matches(pid, &needles) {
        Some(pid)
    } else {
        warn!(server = %spec.name, pid, "pid file names an unrelated process, ignoring it");
        None
    }
}

/// Stop a server by every strategy in turn. Never fails.
pub async fn stop(spec: &ServerSpec, grace: Duration) -> StopReport {
    let mut report = StopReport::default();
    for strategy in StopStrategy::ORDER {
        let pids = match strategy {
            StopStrategy::PidFile => tracked_pid(spec).into_iter().collect(),
            StopStrategy::Pattern => {
                let needles: Vec<&str> = spec.patterns.iter().map(String::as_str).collect();
                if needles.is_empty() {
                    Vec::new()
                } else {
                    procfs::find_by_pattern(&needles)
                }
            }
            StopStrategy::Port if spec.port == 0 => Vec::new(),
            StopStrategy::Port => procfs::listeners_on_port(spec.port),
        };
        for pid in pids {
            if strategy != StopStrategy::PidFile {
                warn!(server = %spec.name, pid, ?strategy, "stopping untracked process");
            }
            if terminate(pid, grace).await {
                report.stopped.push((strategy, pid));
            }
        }
    }
    if spec.pid_path.exists() {
        let _ = std::fs::remove_file(&spec.pid_path);
    }
    if report.is_empty() {
        debug!(server = %spec.name, "nothing running");
    } else {
        info!(server = %spec.name, count = report.stopped.len(), "stopped");
    }
    report
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns whether the pid is
/// gone afterwards.
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    debug!(pid, "sending SIGTERM");
    send_signal(pid, Signal::Term);
    if poll_until(grace, EXIT_POLL, || async move { !pid_alive(pid) }).await {
        return true;
    }
    warn!(pid, grace_secs = grace.as_secs(), "did not exit after SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::Kill);
    poll_until(KILL_WAIT, EXIT_POLL, || async move { !pid_alive(pid) }).await
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Whether `pid` is a live (non-zombie) process. Reaps it first if it is a
/// child of this process that has already exited.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::wait::{WaitPidFlag, waitpid};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let target = Pid::from_raw(raw);
    // ECHILD for anything that is not our child; harmless.
    let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));
    nix::sys::signal::kill(target, None).is_ok() && !is_zombie(pid)
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised comm.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after = stat.rsplit_once(')')?.1;
            after.split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
        debug!(pid, ?signal, error = %e, "signal not delivered");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "process signals are not supported on this platform");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_until_respects_timeout() {
        let start = std::time::Instant::now();
        let met = poll_until(Duration::from_millis(300), Duration::from_millis(50), || async {
            false
        })
        .await;
        assert!(!met);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn poll_until_returns_on_success() {
        let mut calls = 0;
        let met = poll_until(Duration::from_secs(5), Duration::from_millis(10), || {
            calls += 1;
            let done = calls >= 3;
            async move { done }
        })
        .await;
        assert!(met);
        assert_eq!(calls, 3);
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let content: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();
        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");
        assert_eq!(log_tail(&dir.path().join("missing.log"), 3), "");
    }

    #[test]
    fn free_port_is_not_in_use() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port));
        drop(listener);
        assert!(!port_in_use(port));
    }

    #[tokio::test]
    async fn stop_with_nothing_running_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ServerSpec::new(
            "ghost",
            &dir.path().join("bin/ghost"),
            vec![],
            &dir.path().join("ghost.hcl"),
            0,
            dir.path().join("ghost.log"),
            dir.path().join("ghost.pid"),
        );
        let report = stop(&spec, Duration::from_millis(100)).await;
        assert!(report.is_empty());
        let again = stop(&spec, Duration::from_millis(100)).await;
        assert!(again.is_empty());
    }

    /// `sleep` with a duration unique to this test run, so the pattern
    /// strategy cannot touch anyone else's sleeper.
    #[cfg(unix)]
    fn sleeper(dir: &Path, name: &str, salt: u32) -> Option<ServerSpec> {
        let sleep = which::which("sleep").ok()?;
        let duration = format!("30.{}{salt}", std::process::id());
        Some(ServerSpec {
            name: name.to_owned(),
            patterns: vec![sleep.display().to_string(), duration.clone()],
            program: sleep,
            args: vec![duration],
            port: 0,
            log_path: dir.join(format!("{name}.log")),
            pid_path: dir.join(format!("{name}.pid")),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_records_pid_and_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let Some(spec) = sleeper(dir.path(), "sleeper", 1) else {
            return;
        };

        let handle = launch(&spec).unwrap();
        assert_eq!(state::read_pid(&spec.pid_path), Some(handle.pid));
        assert!(pid_alive(handle.pid));
        assert_eq!(tracked_pid(&spec), Some(handle.pid));

        let report = stop(&spec, Duration::from_secs(5)).await;
        assert_eq!(report.stopped, vec![(StopStrategy::PidFile, handle.pid)]);
        assert!(!pid_alive(handle.pid));
        assert!(!spec.pid_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_spares_an_unrelated_process_behind_a_recycled_pid() {
        let dir = tempfile::tempdir().unwrap();
        let Some(spec) = sleeper(dir.path(), "vault", 2) else {
            return;
        };
        let Some(other) = sleeper(dir.path(), "bystander", 3) else {
            return;
        };
        let mut bystander = Command::new(&other.program)
            .args(&other.args)
            .spawn()
            .unwrap();
        state::write_pid(&spec.pid_path, bystander.id()).unwrap();

        assert_eq!(tracked_pid(&spec), None);
        let report = stop(&spec, Duration::from_millis(500)).await;
        assert!(report.is_empty(), "{report:?}");
        assert!(pid_alive(bystander.id()), "unrelated process was signalled");
        assert!(!spec.pid_path.exists(), "stale pid file should be dropped");

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }
}
