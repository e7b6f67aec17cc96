//! Data structures for tracking supervised jobs.
//!
//! This module defines the specification for a job (`JobSpec`), its lifecycle
//! status (`JobStatus`), and the full record (`JobRecord`) the registry keeps
//! for every spawned command.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Identifier for one supervised job, unique for the daemon's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Specification for a job to be launched.
///
/// The command is always a resolved argument vector. Shell interpretation is
/// an opt-in at the API boundary (wrapping the string in `sh -c`), never the
/// default here.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Optional friendly name, used in the aggregated log prefix.
    pub name: Option<String>,
    /// The command executable followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

/// The lifecycle status of a job.
///
/// Transitions are forward-only: `Starting -> Running -> {Completed, Failed,
/// Stopped}`. A terminal status is reached exactly once and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The record exists but the child has not been observed alive yet.
    Starting,
    /// The child process is running.
    Running,
    /// The child exited on its own with code 0.
    Completed,
    /// The child exited nonzero, failed to stream, or was lost.
    Failed,
    /// The child was terminated because of a stop request.
    Stopped,
}

impl JobStatus {
    /// Whether this status is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped)
    }
}

/// One-shot cancellation flag shared between the supervisor and the pump.
///
/// Setting it more than once has no additional effect.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The tracked state of one spawned job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Unique identity, stable for the record's lifetime.
    pub id: JobId,
    /// The specification this job was launched from.
    pub spec: JobSpec,
    /// The fully-resolved command line, for display. Immutable after start.
    pub command_line: String,
    /// OS process id, set once after a successful spawn.
    pub pid: Option<u32>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Exit code, populated only once a terminal status is reached.
    pub exit_code: Option<i32>,
    /// Name of the durable log stream this job writes to. Fixed at creation.
    pub log_target: String,
    /// Cancellation flag for this job only.
    pub cancel: CancelFlag,
    /// When list() first observed the process gone while the status was
    /// still non-terminal. Used to give the pump a moment to finalize
    /// before reconciliation declares the job failed.
    pub stale_since: Option<Instant>,
}

impl JobRecord {
    /// Creates a fresh record in `Starting` state.
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        let command_line = shell_words::join(spec.argv.iter().map(String::as_str));
        Self {
            id,
            command_line,
            pid: None,
            status: JobStatus::Starting,
            exit_code: None,
            log_target: format!("job-{}", id.0),
            cancel: CancelFlag::default(),
            stale_since: None,
            spec,
        }
    }

    /// The name shown in the aggregated log prefix.
    pub fn display_name(&self) -> String {
        self.spec
            .name
            .clone()
            .unwrap_or_else(|| format!("job-{}", self.id.0))
    }

    /// Moves the record from `Starting` to `Running`.
    ///
    /// Returns false (and changes nothing) if the record already advanced
    /// past `Starting`.
    pub fn mark_running(&mut self) -> bool {
        if self.status != JobStatus::Starting {
            return false;
        }
        self.status = JobStatus::Running;
        true
    }

    /// Applies a terminal status and exit code.
    ///
    /// The first call wins; later calls return false and change nothing, so
    /// the pump and the reconciler can never double-transition a record.
    pub fn finalize(&mut self, status: JobStatus, exit_code: Option<i32>) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        true
    }

    /// A point-in-time copy of the externally visible fields.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.spec.name.clone(),
            command_line: self.command_line.clone(),
            pid: self.pid,
            status: self.status,
            exit_code: self.exit_code,
        }
    }
}

/// Serializable view of a record, as returned by list and status calls.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: Option<String>,
    pub command_line: String,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}
