//! Job execution and supervision.
//!
//! This module contains the `Supervisor`, which spawns external commands,
//! tracks them in the registry, and drives one output pump per child. The
//! pump drains the child's merged stdout/stderr into the durable log sink
//! and finalizes the record's status exactly once when the child is gone.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{Result, SupervisorError};
use crate::job::{JobId, JobSnapshot, JobSpec, JobStatus};
use crate::registry::Registry;
use crate::sink::LogSink;

/// Name of the aggregated stream every job's lines fan out to.
pub const COMBINED_STREAM: &str = "combined";

/// Default wait between a graceful termination request and the forced kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How often a stop request re-checks whether the child has exited.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long list() tolerates a dead process with a non-terminal status
/// before reconciling the record, leaving the pump room to finalize first.
const RECONCILE_GRACE: Duration = Duration::from_secs(1);

/// Tuning knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait between SIGTERM and SIGKILL on stop.
    pub grace: Duration,
    /// Cap on the number of meaningful lines output() returns.
    pub tail_lines: usize,
    /// Whether lines also fan out to the aggregated stream.
    pub combined_log: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            tail_lines: 100,
            combined_log: true,
        }
    }
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Termination was requested; the record will reach `Stopped` shortly.
    Stopping,
    /// The job had already reached a terminal status.
    AlreadyTerminal,
}

/// Snapshot returned by [`Supervisor::output`].
#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    /// The captured tail of the job's durable log.
    pub content: String,
    /// Whether the OS process is alive right now, probed, not cached.
    pub is_running: bool,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

enum PumpEvent {
    Line(String),
    StreamError(String),
}

/// Orchestrates job launch, output capture, and termination.
///
/// All operations are safe to call concurrently from any task; the registry
/// lock is the only synchronization and is never held across an await.
pub struct Supervisor {
    registry: Arc<Registry>,
    sink: Arc<LogSink>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(log_dir: impl Into<std::path::PathBuf>, config: SupervisorConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            sink: Arc::new(LogSink::new(log_dir)),
            config,
        }
    }

    /// Truncates the aggregated stream, for a fresh start on boot.
    pub fn reset_combined_log(&self) -> Result<()> {
        self.sink.clear(COMBINED_STREAM)?;
        Ok(())
    }

    /// Registers a new job, spawns its process, and starts its output pump.
    ///
    /// Returns once the OS-level spawn has succeeded. On spawn failure no
    /// record is left behind.
    pub fn start(&self, spec: JobSpec) -> Result<JobId> {
        if spec.argv.first().map(String::is_empty).unwrap_or(true) {
            return Err(SupervisorError::EmptyCommand);
        }

        let id = self.registry.create(spec.clone());
        let Some(record) = self.registry.get(id) else {
            return Err(SupervisorError::NotFound(id));
        };
        let stream = record.log_target.clone();
        let display_name = record.display_name();
        let command_line = record.command_line.clone();

        // The job's stream starts empty; this runs strictly before the pump
        // can write to it.
        if let Err(err) = self.sink.clear(&stream) {
            self.registry.remove(id);
            return Err(err.into());
        }

        let mut command = Command::new(&spec.argv[0]);
        command.args(&spec.argv[1..]);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        if !spec.env.is_empty() {
            command.envs(&spec.env);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.registry.remove(id);
                return Err(SupervisorError::SpawnFailed {
                    command: command_line,
                    source: err,
                });
            }
        };

        let pid = child.id();
        self.registry.with_mut(id, |job| {
            job.pid = pid;
            job.mark_running();
        });
        info!(%id, pid, command = %command_line, "job started");

        // Merge stdout and stderr into one line channel; the pump drains it
        // in arrival order.
        let (line_tx, line_rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        tokio::spawn(pump(
            PumpContext {
                registry: self.registry.clone(),
                sink: self.sink.clone(),
                id,
                stream,
                display_name,
                combined: self.config.combined_log,
            },
            child,
            line_rx,
        ));

        Ok(id)
    }

    /// Requests termination of a job.
    ///
    /// Sets the job's cancel flag, asks the whole process group to
    /// terminate, and escalates to a forced kill if the child has not exited
    /// within the grace period. Safe to call repeatedly and from any task;
    /// the record transitions to `Stopped` exactly once, via the pump.
    pub async fn stop(&self, id: JobId) -> Result<StopOutcome> {
        let job = self.registry.get(id).ok_or(SupervisorError::NotFound(id))?;
        if job.status.is_terminal() {
            return Ok(StopOutcome::AlreadyTerminal);
        }
        job.cancel.set();
        let Some(pid) = job.pid else {
            // Spawn still in flight; the pump will observe the cancel flag.
            return Ok(StopOutcome::Stopping);
        };

        send_stop_signal(pid, StopSignal::Term);
        info!(%id, pid, grace = ?self.config.grace, "termination requested");

        let deadline = tokio::time::Instant::now() + self.config.grace;
        loop {
            let terminal = self
                .registry
                .get(id)
                .map(|job| job.status.is_terminal())
                .unwrap_or(true);
            if terminal {
                return Ok(StopOutcome::Stopping);
            }
            if tokio::time::Instant::now() >= deadline {
                send_stop_signal(pid, StopSignal::Kill);
                warn!(%id, pid, "grace period elapsed, killed process group");
                return Ok(StopOutcome::Stopping);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// The captured log tail plus a live view of the process state.
    pub fn output(&self, id: JobId) -> Result<OutputSnapshot> {
        let job = self.registry.get(id).ok_or(SupervisorError::NotFound(id))?;
        let lines = self
            .sink
            .read_tail(&job.log_target, self.config.tail_lines)?;
        Ok(OutputSnapshot {
            content: lines.join("\n"),
            is_running: probe_running(job.status, job.pid),
            status: job.status,
            exit_code: job.exit_code,
        })
    }

    /// Snapshot of a single record.
    pub fn get(&self, id: JobId) -> Result<JobSnapshot> {
        self.registry
            .get(id)
            .map(|job| job.snapshot())
            .ok_or(SupervisorError::NotFound(id))
    }

    /// Snapshots of every record, reconciling any whose process vanished
    /// without the pump finalizing it.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut out = Vec::new();
        for job in self.registry.list() {
            if !job.status.is_terminal() {
                if let Some(pid) = job.pid {
                    self.reconcile(job.id, pid);
                }
            }
            if let Some(job) = self.registry.get(job.id) {
                out.push(job.snapshot());
            }
        }
        out
    }

    // A dead process under a non-terminal status means the pump is either
    // about to finalize or is gone. Give it RECONCILE_GRACE before calling
    // the job failed.
    fn reconcile(&self, id: JobId, pid: u32) {
        if process_alive(pid) {
            self.registry.with_mut(id, |job| job.stale_since = None);
            return;
        }
        let reconciled = self
            .registry
            .with_mut(id, |job| {
                if job.status.is_terminal() {
                    return false;
                }
                match job.stale_since {
                    None => {
                        job.stale_since = Some(Instant::now());
                        false
                    }
                    Some(since) if since.elapsed() >= RECONCILE_GRACE => {
                        job.finalize(JobStatus::Failed, None)
                    }
                    Some(_) => false,
                }
            })
            .unwrap_or(false);
        if reconciled {
            warn!(%id, pid, "process exited without finalization, marked failed");
            if let Some(job) = self.registry.get(id) {
                let _ = self
                    .sink
                    .append(&job.log_target, "process exited without finalization");
            }
        }
    }

    /// Full durable log for one job.
    pub fn read_log(&self, id: JobId) -> Result<String> {
        let job = self.registry.get(id).ok_or(SupervisorError::NotFound(id))?;
        Ok(self.sink.read_all(&job.log_target)?)
    }

    /// Log bytes appended after `offset` for one job, with the next offset.
    pub fn read_log_from(&self, id: JobId, offset: u64) -> Result<(String, u64)> {
        let job = self.registry.get(id).ok_or(SupervisorError::NotFound(id))?;
        Ok(self.sink.read_from(&job.log_target, offset)?)
    }

    /// Full aggregated log.
    pub fn read_combined_log(&self) -> Result<String> {
        Ok(self.sink.read_all(COMBINED_STREAM)?)
    }

    /// Explicitly prunes a record. Absent ids are a no-op.
    pub fn remove(&self, id: JobId) -> bool {
        self.registry.remove(id)
    }

    /// Stops every non-terminal job, used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        for job in self.list() {
            if !job.status.is_terminal() {
                let _ = self.stop(job.id).await;
            }
        }
    }
}

struct PumpContext {
    registry: Arc<Registry>,
    sink: Arc<LogSink>,
    id: JobId,
    stream: String,
    display_name: String,
    combined: bool,
}

/// Reads one child stream line by line into the shared pump channel.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<PumpEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(PumpEvent::Line(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tx.send(PumpEvent::StreamError(err.to_string())).await;
                break;
            }
        }
    }
}

/// Drains the merged output of one child into the sink, waits for the exit
/// code, and finalizes the record.
async fn pump(ctx: PumpContext, mut child: Child, mut events: mpsc::Receiver<PumpEvent>) {
    let id = ctx.id;
    debug!(%id, "output pump running");
    let mut stream_failed = false;
    while let Some(event) = events.recv().await {
        let line = match event {
            PumpEvent::Line(line) => sanitize_line(&line),
            PumpEvent::StreamError(err) => {
                stream_failed = true;
                format!("output stream error: {err}")
            }
        };
        if line.is_empty() {
            continue;
        }
        if let Err(err) = ctx.sink.append(&ctx.stream, &line) {
            warn!(%id, error = %err, "failed to append job output");
        }
        if ctx.combined {
            let _ = ctx
                .sink
                .append(COMBINED_STREAM, &format!("[{}] {}", ctx.display_name, line));
        }
    }

    // Both stream readers are done; the child is exiting or gone.
    let (status, code) = match child.wait().await {
        Ok(exit) => {
            let code = exit.code();
            let cancelled = ctx
                .registry
                .get(id)
                .map(|job| job.cancel.is_set())
                .unwrap_or(false);
            if cancelled {
                (JobStatus::Stopped, code)
            } else if stream_failed {
                (JobStatus::Failed, code)
            } else if exit.success() {
                (JobStatus::Completed, code)
            } else {
                (JobStatus::Failed, code)
            }
        }
        Err(err) => {
            let _ = ctx.sink.append(&ctx.stream, &format!("wait failed: {err}"));
            (JobStatus::Failed, None)
        }
    };

    let finalized = ctx
        .registry
        .with_mut(id, |job| job.finalize(status, code))
        .unwrap_or(false);
    if finalized {
        info!(%id, ?status, ?code, "job finished");
    } else {
        debug!(%id, "record already finalized or pruned");
    }
}

/// Strips ANSI escapes and surrounding whitespace; the sink stores plain
/// text even when the child paints progress bars.
fn sanitize_line(line: &str) -> String {
    let stripped = strip_ansi_escapes::strip(line.as_bytes());
    String::from_utf8_lossy(&stripped).trim().to_string()
}

fn probe_running(status: JobStatus, pid: Option<u32>) -> bool {
    if status.is_terminal() {
        return false;
    }
    pid.map(process_alive).unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_stop_signal(pid: u32, signal: StopSignal) {
    let sig = match signal {
        StopSignal::Term => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        let pid = pid as i32;
        // Signal the group first so children of a shell wrapper go too.
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_stop_signal(pid: u32, signal: StopSignal) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        match signal {
            StopSignal::Term => {
                // Windows has no SIGTERM; CTRL_BREAK is the closest console
                // signal we can emit to the process group.
                let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
            }
            StopSignal::Kill => {
                let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
                if handle != 0 {
                    let _ = TerminateProcess(handle, 1);
                    CloseHandle(handle);
                }
            }
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_ansi_and_whitespace() {
        assert_eq!(sanitize_line("\u{1b}[32mdone\u{1b}[0m  "), "done");
        assert_eq!(sanitize_line("   "), "");
        assert_eq!(sanitize_line("plain"), "plain");
    }

    #[test]
    fn probe_running_trusts_terminal_status() {
        // A recycled pid must not resurrect a finished job.
        assert!(!probe_running(JobStatus::Completed, Some(std::process::id())));
        assert!(!probe_running(JobStatus::Running, None));
    }

    #[cfg(unix)]
    #[test]
    fn process_alive_detects_own_process() {
        assert!(process_alive(std::process::id()));
    }
}
