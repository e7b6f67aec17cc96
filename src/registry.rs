//! Concurrent-safe store of job records.
//!
//! The registry owns the only lock in the system. It guards nothing but the
//! in-memory map; callers never hold it across blocking I/O or an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::job::{JobId, JobRecord, JobSpec};

/// Mapping from job id to record, shared by every supervisor operation and
/// every output pump.
#[derive(Debug)]
pub struct Registry {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        // A poisoned lock only means another thread panicked mid-mutation of
        // one record; the map itself stays usable.
        self.jobs.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Allocates a fresh unique id and inserts a record in `Starting` state.
    pub fn create(&self, spec: JobSpec) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = JobRecord::new(id, spec);
        self.lock().insert(id, record);
        id
    }

    /// Returns a point-in-time copy of the record, if present.
    ///
    /// The copy shares the record's cancel flag, so `cancel.set()` on the
    /// copy is visible to the pump.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.lock().get(&id).cloned()
    }

    /// Runs `f` against the live record under the lock.
    ///
    /// This is the single mutation point for status transitions; `f` must
    /// not block.
    pub fn with_mut<T>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> T) -> Option<T> {
        self.lock().get_mut(&id).map(f)
    }

    /// Point-in-time copies of every record, in id order.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.lock().values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Deletes the record. Removing an absent id is a no-op.
    pub fn remove(&self, id: JobId) -> bool {
        self.lock().remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::job::JobStatus;

    fn spec() -> JobSpec {
        JobSpec {
            name: None,
            argv: vec!["true".to_string()],
            cwd: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn create_never_reuses_ids_across_threads() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| registry.create(spec())).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn list_returns_snapshots_not_live_records() {
        let registry = Registry::new();
        let id = registry.create(spec());
        let snapshot = registry.list();
        registry.with_mut(id, |job| {
            job.mark_running();
            job.finalize(JobStatus::Failed, Some(1));
        });
        assert_eq!(snapshot[0].status, JobStatus::Starting);
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.create(spec());
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn cloned_cancel_flag_reaches_the_live_record() {
        let registry = Registry::new();
        let id = registry.create(spec());
        registry.get(id).unwrap().cancel.set();
        assert!(registry.get(id).unwrap().cancel.is_set());
    }
}
