//! Queue coordination: the operation surface workers and producers use,
//! plus the background loops that keep the queue healthy.

mod recovery;
mod stalled;

pub use self::recovery::RecoveryTask;
pub use self::stalled::{StalledDetectorConfig, StalledDetectorTask};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::queue::{Job, LeasedJob, QueueBackend, QueueResult};

/// Lease parameters the coordinator applies on behalf of callers.
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    pub lock_duration: Duration,
    pub max_stalled_count: u32,
}

impl From<&QueueConfig> for CoordinatorSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            lock_duration: config.lock_duration,
            max_stalled_count: config.max_stalled_count,
        }
    }
}

#[derive(Debug, Default)]
struct HealthInner {
    backend_unreachable: bool,
    last_success: Option<DateTime<Utc>>,
}

/// Shared coordinator health, fed by every backend round-trip and queried
/// by the health endpoint.
#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<Mutex<HealthInner>>,
}

/// Point-in-time view of coordinator health.
#[derive(Clone, Copy, Debug)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ok(&self) {
        let mut inner = self.inner.lock().expect("health poisoned");
        inner.backend_unreachable = false;
        inner.last_success = Some(Utc::now());
    }

    pub fn mark_unreachable(&self) {
        let mut inner = self.inner.lock().expect("health poisoned");
        inner.backend_unreachable = true;
    }

    pub fn is_healthy(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("health poisoned")
            .backend_unreachable
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().expect("health poisoned");
        HealthSnapshot {
            healthy: !inner.backend_unreachable,
            last_success: inner.last_success,
        }
    }
}

/// Operation surface over the shared queue backend.
///
/// Producers call [`QueueCoordinator::enqueue`]; workers drive
/// lease/renew/ack/fail. Every round-trip feeds the shared health state.
#[derive(Clone)]
pub struct QueueCoordinator {
    backend: Arc<dyn QueueBackend>,
    settings: CoordinatorSettings,
    health: HealthState,
}

impl QueueCoordinator {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: CoordinatorSettings) -> Self {
        Self {
            backend,
            settings,
            health: HealthState::new(),
        }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    fn track<T>(&self, result: QueueResult<T>) -> QueueResult<T> {
        match &result {
            Err(err) if err.is_retryable() => self.health.mark_unreachable(),
            // A definitive answer (including a lost lease) means the
            // backend answered.
            _ => self.health.mark_ok(),
        }
        result
    }

    pub async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.track(self.backend.enqueue(job).await)
    }

    /// Claim one pending job FIFO by enqueue order, or None when idle.
    pub async fn lease(&self, worker_id: &str) -> QueueResult<Option<LeasedJob>> {
        self.track(
            self.backend
                .claim_one(worker_id, self.settings.lock_duration)
                .await,
        )
    }

    /// Extend an owned lease. On [`crate::queue::QueueError::LeaseLost`] the
    /// caller must abort work immediately.
    pub async fn renew(&self, execution_id: Uuid, token: Uuid) -> QueueResult<DateTime<Utc>> {
        self.track(
            self.backend
                .renew_if_owner(execution_id, token, self.settings.lock_duration)
                .await,
        )
    }

    pub async fn ack(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()> {
        self.track(self.backend.ack_if_owner(execution_id, token).await)
    }

    pub async fn fail(&self, execution_id: Uuid, token: Uuid, error: &str) -> QueueResult<()> {
        self.track(self.backend.fail_if_owner(execution_id, token, error).await)
    }

    /// Abandon an owned lease for stalled-detection to reclaim.
    pub async fn release(&self, execution_id: Uuid, token: Uuid) -> QueueResult<()> {
        self.track(self.backend.release_if_owner(execution_id, token).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn concurrent_lease_of_one_job_has_one_winner() {
        let backend = Arc::new(MemoryQueue::new());
        let coordinator = QueueCoordinator::new(
            backend,
            CoordinatorSettings {
                lock_duration: Duration::from_secs(30),
                max_stalled_count: 1,
            },
        );
        let job = Job::new(Uuid::new_v4(), Uuid::new_v4());
        coordinator.enqueue(&job).await.expect("enqueue");

        let left = coordinator.clone();
        let right = coordinator.clone();
        let (a, b) = tokio::join!(left.lease("worker-a"), right.lease("worker-b"));
        let claims = [a.expect("lease"), b.expect("lease")];
        assert_eq!(claims.iter().filter(|claim| claim.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn round_trips_refresh_health() {
        let backend = Arc::new(MemoryQueue::new());
        let coordinator = QueueCoordinator::new(
            backend,
            CoordinatorSettings {
                lock_duration: Duration::from_secs(30),
                max_stalled_count: 1,
            },
        );
        let health = coordinator.health();
        assert!(health.snapshot().last_success.is_none());

        coordinator.lease("worker-a").await.expect("lease");
        let snapshot = health.snapshot();
        assert!(snapshot.healthy);
        assert!(snapshot.last_success.is_some());
    }
}
