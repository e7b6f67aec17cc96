//! Lifecycle tests that exercise the supervisor against real processes.

#![cfg(unix)]

use std::collections::HashMap;
use std::time::Duration;

use syncdeck::errors::SupervisorError;
use syncdeck::job::{JobId, JobSpec, JobStatus};
use syncdeck::runner::{StopOutcome, Supervisor, SupervisorConfig};

fn supervisor(dir: &tempfile::TempDir) -> Supervisor {
    Supervisor::new(
        dir.path().join("logs"),
        SupervisorConfig {
            grace: Duration::from_secs(5),
            tail_lines: 100,
            combined_log: true,
        },
    )
}

fn sh(script: &str) -> JobSpec {
    JobSpec {
        name: None,
        argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        cwd: None,
        env: HashMap::new(),
    }
}

async fn wait_terminal(supervisor: &Supervisor, id: JobId, timeout: Duration) -> JobStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = supervisor.get(id).unwrap().status;
        if status.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not reach a terminal status in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn three_lines_complete_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor
        .start(sh("echo one; echo two; echo three"))
        .unwrap();

    let status = wait_terminal(&supervisor, id, Duration::from_secs(5)).await;
    assert_eq!(status, JobStatus::Completed);

    let job = supervisor.get(id).unwrap();
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(supervisor.read_log(id).unwrap(), "one\ntwo\nthree\n");

    let output = supervisor.output(id).unwrap();
    assert_eq!(output.content, "one\ntwo\nthree");
    assert!(!output.is_running);
}

#[tokio::test]
async fn nonzero_exit_is_failed_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor.start(sh("echo boom >&2; exit 3")).unwrap();

    let status = wait_terminal(&supervisor, id, Duration::from_secs(5)).await;
    assert_eq!(status, JobStatus::Failed);
    let job = supervisor.get(id).unwrap();
    assert_eq!(job.exit_code, Some(3));
    // stderr lines land in the same log as stdout.
    assert_eq!(supervisor.read_log(id).unwrap(), "boom\n");
}

#[tokio::test]
async fn stop_interrupts_a_sleeping_job() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor.start(sh("sleep 10")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    let outcome = supervisor.stop(id).await.unwrap();
    assert_eq!(outcome, StopOutcome::Stopping);

    let status = wait_terminal(&supervisor, id, Duration::from_secs(7)).await;
    assert_eq!(status, JobStatus::Stopped);
    // Well under the child's own 10s runtime: grace period plus slack.
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn stop_after_exit_reports_already_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor.start(sh("true")).unwrap();
    wait_terminal(&supervisor, id, Duration::from_secs(5)).await;

    let outcome = supervisor.stop(id).await.unwrap();
    assert_eq!(outcome, StopOutcome::AlreadyTerminal);
}

#[tokio::test]
async fn double_stop_yields_one_stopped_transition() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor.start(sh("sleep 10")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (first, second) = tokio::join!(supervisor.stop(id), supervisor.stop(id));
    assert!(first.is_ok());
    assert!(second.is_ok());

    let status = wait_terminal(&supervisor, id, Duration::from_secs(7)).await;
    assert_eq!(status, JobStatus::Stopped);
    // The record stays Stopped; a late stop is a terminal no-op.
    assert_eq!(
        supervisor.stop(id).await.unwrap(),
        StopOutcome::AlreadyTerminal
    );
}

#[tokio::test]
async fn spawn_failure_leaves_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let spec = JobSpec {
        name: None,
        argv: vec!["syncdeck-no-such-binary".to_string()],
        cwd: None,
        env: HashMap::new(),
    };
    let err = supervisor.start(spec).unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    assert!(supervisor.list().is_empty());
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let spec = JobSpec {
        name: None,
        argv: Vec::new(),
        cwd: None,
        env: HashMap::new(),
    };
    assert!(matches!(
        supervisor.start(spec),
        Err(SupervisorError::EmptyCommand)
    ));
}

#[tokio::test]
async fn ids_are_unique_across_starts() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..5 {
        let id = supervisor.start(sh("true")).unwrap();
        assert!(seen.insert(id));
    }
}

#[tokio::test]
async fn five_concurrent_jobs_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let ids: Vec<JobId> = (0..5)
        .map(|_| supervisor.start(sh("sleep 5")).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let listed = supervisor.list();
    assert_eq!(listed.len(), 5);
    for job in &listed {
        assert_eq!(job.status, JobStatus::Running);
    }

    // Stopping one job leaves the other four untouched.
    supervisor.stop(ids[2]).await.unwrap();
    let status = wait_terminal(&supervisor, ids[2], Duration::from_secs(7)).await;
    assert_eq!(status, JobStatus::Stopped);
    for (idx, id) in ids.iter().enumerate() {
        if idx != 2 {
            let job = supervisor.get(*id).unwrap();
            assert_eq!(job.status, JobStatus::Running, "job {id} was disturbed");
        }
    }

    supervisor.shutdown_all().await;
    for id in ids {
        wait_terminal(&supervisor, id, Duration::from_secs(7)).await;
    }
}

#[tokio::test]
async fn output_is_prefix_stable_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor
        .start(sh("for i in 1 2 3 4 5; do echo line $i; sleep 0.05; done"))
        .unwrap();

    let mut previous = String::new();
    loop {
        let snapshot = supervisor.output(id).unwrap();
        assert!(
            snapshot.content.starts_with(&previous),
            "later poll lost content: {previous:?} -> {:?}",
            snapshot.content
        );
        previous = snapshot.content;
        if snapshot.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        previous,
        "line 1\nline 2\nline 3\nline 4\nline 5"
    );
}

#[tokio::test]
async fn combined_log_aggregates_named_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let mut spec_a = sh("echo from-a");
    spec_a.name = Some("alpha".to_string());
    let mut spec_b = sh("echo from-b");
    spec_b.name = Some("beta".to_string());

    let a = supervisor.start(spec_a).unwrap();
    let b = supervisor.start(spec_b).unwrap();
    wait_terminal(&supervisor, a, Duration::from_secs(5)).await;
    wait_terminal(&supervisor, b, Duration::from_secs(5)).await;

    let combined = supervisor.read_combined_log().unwrap();
    assert!(combined.contains("[alpha] from-a"));
    assert!(combined.contains("[beta] from-b"));
}

#[tokio::test]
async fn remove_prunes_a_finished_record() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&dir);
    let id = supervisor.start(sh("true")).unwrap();
    wait_terminal(&supervisor, id, Duration::from_secs(5)).await;

    assert!(supervisor.remove(id));
    assert!(!supervisor.remove(id));
    assert!(matches!(
        supervisor.get(id),
        Err(SupervisorError::NotFound(_))
    ));
}
