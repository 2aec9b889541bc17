//! Process-wide job tracking.
//!
//! Ids come from an atomic counter starting at 1 and are unique for the
//! lifetime of this process, not across restarts or hosts. The map is
//! the only mutable state shared between unrelated RPC calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use super::Job;

/// Concurrent map from job id to job handle.
pub struct JobRegistry {
    jobs: RwLock<HashMap<u64, Arc<Job>>>,
    next_id: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve the next job id.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn insert(&self, job: Arc<Job>) {
        self.jobs.write().await.insert(job.id(), job);
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Job>> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<Job>> {
        self.jobs.write().await.remove(&id)
    }

    /// Consistent point-in-time view of `(id, is_done)` for every
    /// tracked job. Holds the read lock for the duration of the copy so
    /// the snapshot is never torn.
    pub async fn snapshot(&self) -> Vec<(u64, bool)> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(id, job)| (*id, job.is_done()))
            .collect()
    }

    /// Stop a running job and drop it from the registry.
    ///
    /// A job that already finished is put back so its buffered output
    /// stays retrievable, and the call reports the conflict.
    pub async fn stop(&self, id: u64) -> Result<(), dutr_common::AgentError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .remove(&id)
            .ok_or(dutr_common::AgentError::InvalidJobId(id))?;
        if job.is_done() {
            jobs.insert(id, job);
            return Err(dutr_common::AgentError::JobAlreadyFinished(id));
        }
        job.kill();
        Ok(())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use dutr_common::AgentError;

    fn echo_spec() -> JobSpec {
        JobSpec {
            program: "echo".to_string(),
            args: Some("x".to_string()),
            completion: None,
            progress: None,
        }
    }

    async fn spawn_into(registry: &JobRegistry, spec: JobSpec) -> u64 {
        let id = registry.allocate_id();
        let job = Job::spawn(id, spec).await.unwrap();
        registry.insert(job).await;
        id
    }

    #[test]
    fn ids_are_positive_and_distinct() {
        let registry = JobRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let c = registry.allocate_id();
        assert!(a >= 1);
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn snapshot_contains_every_inserted_job() {
        let registry = JobRegistry::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(spawn_into(&registry, echo_spec()).await);
        }
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 5);
        for id in ids {
            assert!(snapshot.iter().any(|(sid, _)| *sid == id));
        }
    }

    #[tokio::test]
    async fn stop_unknown_id_is_invalid() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.stop(999).await,
            Err(AgentError::InvalidJobId(999))
        ));
    }

    #[tokio::test]
    async fn stop_running_job_removes_it() {
        let registry = JobRegistry::new();
        let id = spawn_into(
            &registry,
            JobSpec {
                program: "sleep".to_string(),
                args: Some("30".to_string()),
                completion: None,
                progress: None,
            },
        )
        .await;

        registry.stop(id).await.unwrap();
        assert!(registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn stop_finished_job_is_reinserted() {
        let registry = JobRegistry::new();
        let id = spawn_into(&registry, echo_spec()).await;
        let job = registry.get(id).await.unwrap();
        job.wait_drained().await;
        for _ in 0..200 {
            if job.is_done() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(matches!(
            registry.stop(id).await,
            Err(AgentError::JobAlreadyFinished(_))
        ));
        // Still retrievable afterwards.
        let job = registry.get(id).await.unwrap();
        assert_eq!(job.result().await.unwrap(), "x\n");
    }
}
