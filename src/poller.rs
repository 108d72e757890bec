use crate::models::{JobProgress, JobStatus};
use crate::store::JobStore;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub fn poll_interval_from_env() -> Duration {
    std::env::var("POLL_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_INTERVAL)
}

/// Snapshot of one tracked job at fetch time.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub progress: JobProgress,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PollEvent {
    Progress {
        id: Uuid,
        status: JobStatus,
        progress: JobProgress,
    },
    Completed {
        id: Uuid,
    },
    Failed {
        id: Uuid,
        error: String,
    },
}

/// Read side of the persisted job record. The poller only ever reads.
pub trait StatusSource: Send + Sync + 'static {
    fn fetch(&self, id: Uuid) -> impl Future<Output = Option<StatusSnapshot>> + Send;
}

impl StatusSource for JobStore {
    async fn fetch(&self, id: Uuid) -> Option<StatusSnapshot> {
        self.get(id).await.map(|job| StatusSnapshot {
            status: job.status,
            progress: job.progress,
            error_message: job.error_message,
        })
    }
}

/// Observes long-running jobs by re-fetching their persisted status on a
/// fixed interval. Terminal jobs are dropped from the tracked set in the
/// same cycle that notifies them, so each id gets exactly one terminal
/// event. When the tracked set is empty no requests are issued. Dropping
/// the poller cancels observation only; the underlying jobs keep running.
pub struct Poller {
    tracked: Arc<Mutex<HashSet<Uuid>>>,
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn<S: StatusSource>(
        source: S,
        poll_interval: Duration,
    ) -> (Self, mpsc::Receiver<PollEvent>) {
        let tracked: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
        let (events_tx, events_rx) = mpsc::channel(64);
        let tracked_bg = tracked.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let ids: Vec<Uuid> = {
                    let guard = tracked_bg.lock().await;
                    guard.iter().copied().collect()
                };
                if ids.is_empty() {
                    continue;
                }
                for id in ids {
                    let Some(snapshot) = source.fetch(id).await else {
                        warn!(target = "listforge.poller", job_id = %id, "tracked job vanished");
                        tracked_bg.lock().await.remove(&id);
                        continue;
                    };
                    let event = match snapshot.status {
                        JobStatus::Completed => {
                            tracked_bg.lock().await.remove(&id);
                            PollEvent::Completed { id }
                        }
                        JobStatus::Failed => {
                            tracked_bg.lock().await.remove(&id);
                            PollEvent::Failed {
                                id,
                                error: snapshot
                                    .error_message
                                    .unwrap_or_else(|| "job failed".into()),
                            }
                        }
                        status => PollEvent::Progress {
                            id,
                            status,
                            progress: snapshot.progress,
                        },
                    };
                    if events_tx.send(event).await.is_err() {
                        debug!(target = "listforge.poller", "event receiver dropped, stopping");
                        return;
                    }
                }
            }
        });

        (Self { tracked, handle }, events_rx)
    }

    /// Starts observing a job. Safe to call for an id already tracked.
    pub async fn track(&self, id: Uuid) {
        self.tracked.lock().await.insert(id);
    }

    /// Re-attaches jobs after a restart without re-issuing their original
    /// requests. Callers pass only ids whose last known status is
    /// non-terminal (`JobStore::non_terminal_ids`).
    pub async fn resume(&self, ids: &[Uuid]) {
        let mut guard = self.tracked.lock().await;
        for id in ids {
            guard.insert(*id);
        }
    }

    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackgroundJob, JobKind, Marketplace};
    use std::collections::VecDeque;
    use tokio::time::sleep;

    const TICK: Duration = Duration::from_millis(10);

    /// Scripted source: each fetch pops the next status; the last status
    /// repeats. Counts fetches so tests can assert polling stopped.
    #[derive(Clone)]
    struct Script {
        steps: Arc<Mutex<VecDeque<JobStatus>>>,
        fetches: Arc<Mutex<usize>>,
    }

    impl Script {
        fn new(steps: &[JobStatus]) -> Self {
            Self {
                steps: Arc::new(Mutex::new(steps.iter().copied().collect())),
                fetches: Arc::new(Mutex::new(0)),
            }
        }

        async fn fetch_count(&self) -> usize {
            *self.fetches.lock().await
        }
    }

    impl StatusSource for Script {
        async fn fetch(&self, _id: Uuid) -> Option<StatusSnapshot> {
            *self.fetches.lock().await += 1;
            let mut steps = self.steps.lock().await;
            let status = if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                *steps.front()?
            };
            Some(StatusSnapshot {
                status,
                progress: JobProgress::default(),
                error_message: matches!(status, JobStatus::Failed)
                    .then(|| "collection failed".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn polls_until_terminal_and_notifies_exactly_once() {
        let script = Script::new(&[
            JobStatus::Pending,
            JobStatus::Collecting,
            JobStatus::Analyzing,
            JobStatus::Completed,
        ]);
        let (poller, mut events) = Poller::spawn(script.clone(), TICK);
        let id = Uuid::new_v4();
        poller.track(id).await;

        let mut progress_events = 0;
        let mut completed_events = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        {
            match event {
                PollEvent::Progress { .. } => progress_events += 1,
                PollEvent::Completed { id: done } => {
                    assert_eq!(done, id);
                    completed_events += 1;
                    break;
                }
                PollEvent::Failed { .. } => panic!("unexpected failure"),
            }
        }
        assert_eq!(progress_events, 3);
        assert_eq!(completed_events, 1);
        assert_eq!(poller.tracked_count().await, 0);

        // No further requests once the tracked set is empty.
        let after_terminal = script.fetch_count().await;
        sleep(TICK * 3).await;
        assert_eq!(script.fetch_count().await, after_terminal);
    }

    #[tokio::test]
    async fn failed_job_carries_error_message() {
        let script = Script::new(&[JobStatus::Collecting, JobStatus::Failed]);
        let (poller, mut events) = Poller::spawn(script, TICK);
        poller.track(Uuid::new_v4()).await;

        loop {
            let event = tokio::time::timeout(Duration::from_millis(500), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let PollEvent::Failed { error, .. } = event {
                assert_eq!(error, "collection failed");
                break;
            }
        }
        assert_eq!(poller.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn empty_tracked_set_issues_no_requests() {
        let script = Script::new(&[JobStatus::Pending]);
        let (_poller, _events) = Poller::spawn(script.clone(), TICK);
        sleep(TICK * 4).await;
        assert_eq!(script.fetch_count().await, 0);
    }

    #[tokio::test]
    async fn resume_reattaches_non_terminal_jobs_from_store() {
        let store = JobStore::default();
        let mut analyzing = BackgroundJob::new(JobKind::MarketIntel, Marketplace::AmazonUs);
        analyzing.status = JobStatus::Analyzing;
        let analyzing_id = analyzing.id;
        let mut done = BackgroundJob::new(JobKind::Reviews, Marketplace::AmazonUs);
        done.status = JobStatus::Completed;
        store.insert(analyzing).await;
        store.insert(done).await;

        let resumable = store.non_terminal_ids().await;
        assert_eq!(resumable, vec![analyzing_id]);

        let (poller, mut events) = Poller::spawn(store.clone(), TICK);
        poller.resume(&resumable).await;
        assert_eq!(poller.tracked_count().await, 1);

        // The resumed job keeps being observed until the worker finishes it.
        let event = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("progress in time")
            .expect("channel open");
        assert!(matches!(
            event,
            PollEvent::Progress {
                status: JobStatus::Analyzing,
                ..
            }
        ));

        store
            .with_job(analyzing_id, |job| job.status = JobStatus::Completed)
            .await
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_millis(500), events.recv())
                .await
                .expect("terminal in time")
                .expect("channel open");
            if let PollEvent::Completed { id } = event {
                assert_eq!(id, analyzing_id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn vanished_job_is_dropped_without_notification() {
        let store = JobStore::default();
        let (poller, mut events) = Poller::spawn(store, TICK);
        poller.track(Uuid::new_v4()).await;
        sleep(TICK * 3).await;
        assert_eq!(poller.tracked_count().await, 0);
        assert!(events.try_recv().is_err());
    }
}
