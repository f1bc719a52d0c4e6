//! Process-wide job registry.
//!
//! Maps a [`JobId`] to its current state, per-page progress, and, once
//! terminal, its immutable [`JobOutcome`].
//!
//! ## Locking
//!
//! The map is sharded (`DashMap`) and every entry carries its own mutex, so
//! updates to one job never wait on another. Shard guards are dropped before
//! an entry's mutex is taken. When a job goes terminal its final snapshot is
//! written once into a `OnceLock`; reads of finished jobs never lock.
//!
//! ## Retention
//!
//! A finished job stays queryable for the retention window, then
//! [`JobRegistry::evict_expired`] (or the reaper task) drops it. Active jobs
//! have no deadline and are never evicted, nor are finished jobs whose
//! deadline overflows the clock.

use crate::error::JobError;
use crate::output::{JobId, JobOutcome, JobSnapshot};
use crate::pipeline::document::Document;
use crate::state::{JobState, PageState};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Extra data carried by a state update.
#[derive(Debug)]
pub enum StatePayload {
    None,
    /// Page count declared by the rasteriser.
    PageCount(usize),
    /// Terminal outcome; required for `Completed` / `Failed`.
    Outcome(JobOutcome),
}

/// Mutable part of an entry, guarded by the entry's own mutex.
#[derive(Debug)]
struct Progress {
    state: JobState,
    page_count: Option<usize>,
    pages: Vec<PageState>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct JobSlot {
    id: JobId,
    created_at: DateTime<Utc>,
    progress: Mutex<Progress>,
    terminal: OnceLock<JobSnapshot>,
    updates: watch::Sender<JobSnapshot>,
}

impl JobSlot {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, p: &Progress) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: p.state,
            created_at: self.created_at,
            completed_at: p.completed_at,
            page_count: p.page_count,
            pages: p.pages.clone(),
            outcome: self.terminal.get().and_then(|s| s.outcome.clone()),
        }
    }

    fn publish(&self, p: &Progress) {
        self.updates.send_replace(self.snapshot(p));
    }

    fn expired(&self, now: Instant) -> bool {
        self.lock().expires_at.is_some_and(|t| t <= now)
    }
}

/// Shared job registry. Create once per process and share via `Arc`.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobSlot>>,
    retention: Duration,
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Entries currently retained (active and finished).
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Create an entry in `Received`.
    pub fn register(&self, id: JobId, document: &Document) -> Result<(), JobError> {
        match self.jobs.entry(id) {
            Entry::Occupied(_) => Err(JobError::DuplicateJobId(id)),
            Entry::Vacant(v) => {
                let progress = Progress {
                    state: JobState::Received,
                    page_count: document.page_count,
                    pages: Vec::new(),
                    completed_at: None,
                    expires_at: None,
                };
                let initial = JobSnapshot {
                    id,
                    state: JobState::Received,
                    created_at: document.created_at,
                    completed_at: None,
                    page_count: document.page_count,
                    pages: Vec::new(),
                    outcome: None,
                };
                let (updates, _) = watch::channel(initial);
                v.insert(Arc::new(JobSlot {
                    id,
                    created_at: document.created_at,
                    progress: Mutex::new(progress),
                    terminal: OnceLock::new(),
                    updates,
                }));
                debug!(job_id = %id, "Job registered");
                Ok(())
            }
        }
    }

    fn slot(&self, id: JobId) -> Option<Arc<JobSlot>> {
        self.jobs.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Advance a job. Called only by the document pipeline.
    ///
    /// Terminal states require [`StatePayload::Outcome`] whose variant
    /// matches `next`; the outcome is frozen from then on.
    pub fn update_state(
        &self,
        id: JobId,
        next: JobState,
        payload: StatePayload,
    ) -> Result<(), JobError> {
        let slot = self.slot(id).ok_or(JobError::UnknownJob(id))?;
        let mut p = slot.lock();

        if !p.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id,
                from: p.state,
                to: next,
            });
        }

        match payload {
            StatePayload::Outcome(outcome) => {
                if outcome.state() != next {
                    return Err(JobError::MissingOutcome { id, to: next });
                }
                // A retention too large to represent keeps the entry until
                // it is removed explicitly.
                let expires_at = Instant::now().checked_add(self.retention);
                p.state = next;
                p.completed_at = Some(Utc::now());
                p.expires_at = expires_at;
                let mut snapshot = slot.snapshot(&p);
                snapshot.outcome = Some(Arc::new(outcome));
                // Only this branch sets it, and only once: the transition
                // check above rejects every edge out of a terminal state.
                let _ = slot.terminal.set(snapshot);
            }
            _ if next.is_terminal() => {
                return Err(JobError::MissingOutcome { id, to: next });
            }
            StatePayload::PageCount(n) => {
                p.state = next;
                p.page_count = Some(n);
            }
            StatePayload::None => {
                p.state = next;
            }
        }

        debug!(job_id = %id, state = ?next, "Job state updated");
        slot.publish(&p);
        Ok(())
    }

    /// Record a page transition. Pages appear as the rasteriser yields them.
    ///
    /// Rejected once the job is terminal, so a cancelled job's in-flight
    /// pages cannot change what callers already saw.
    pub fn update_page(&self, id: JobId, page: usize, next: PageState) -> Result<(), JobError> {
        let slot = self.slot(id).ok_or(JobError::UnknownJob(id))?;
        let mut p = slot.lock();

        if p.state.is_terminal() {
            return Err(JobError::JobFinished { id, state: p.state });
        }
        if p.pages.len() <= page {
            p.pages.resize(page + 1, PageState::Pending);
        }
        let from = p.pages[page];
        if from != next && !from.can_transition_to(next) {
            return Err(JobError::InvalidPageTransition {
                id,
                page,
                from,
                to: next,
            });
        }
        p.pages[page] = next;
        slot.publish(&p);
        Ok(())
    }

    /// Current state and, if terminal, the immutable result.
    pub fn get_result(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        let slot = self.slot(id).ok_or(JobError::JobNotFound(id))?;
        if let Some(done) = slot.terminal.get() {
            if slot.expired(Instant::now()) {
                self.jobs.remove(&id);
                return Err(JobError::JobNotFound(id));
            }
            return Ok(done.clone());
        }
        let p = slot.lock();
        Ok(slot.snapshot(&p))
    }

    /// Current state only.
    pub fn state(&self, id: JobId) -> Result<JobState, JobError> {
        self.get_result(id).map(|s| s.state)
    }

    /// Subscribe to snapshots of one job. The first value is the current one.
    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<JobSnapshot>, JobError> {
        self.slot(id)
            .map(|s| s.updates.subscribe())
            .ok_or(JobError::JobNotFound(id))
    }

    /// Wait until the job is terminal and return its final snapshot.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        let mut rx = self.subscribe(id)?;
        let snapshot = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| JobError::JobNotFound(id))?
            .clone();
        Ok(snapshot)
    }

    /// Drop a finished job.
    pub fn remove(&self, id: JobId) -> Result<(), JobError> {
        let slot = self.slot(id).ok_or(JobError::JobNotFound(id))?;
        let state = slot.lock().state;
        if !state.is_terminal() {
            return Err(JobError::JobActive { id, state });
        }
        self.jobs.remove(&id);
        debug!(job_id = %id, "Job removed");
        Ok(())
    }

    /// Retrieve a finished job's final snapshot and drop it.
    pub fn take(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        let snapshot = self.get_result(id)?;
        if !snapshot.is_terminal() {
            return Err(JobError::JobActive {
                id,
                state: snapshot.state,
            });
        }
        self.jobs.remove(&id);
        Ok(snapshot)
    }

    /// Drop every finished job whose deadline is at or before `now`.
    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, slot| !slot.expired(now));
        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            info!(evicted, "Evicted expired jobs");
        }
        evicted
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    /// Periodically evict expired jobs until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        registry.evict_expired();
                    }
                }
            }
            debug!("Registry reaper stopped");
        })
    }

    /// Drop every entry. Used on shutdown.
    pub fn clear(&self) {
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DocumentError;
    use crate::output::{DocumentResult, DocumentStats};

    fn registry() -> JobRegistry {
        JobRegistry::new(Duration::from_secs(60))
    }

    fn doc() -> Document {
        Document::new(JobId::new(), b"%PDF-1.7".to_vec(), 300)
    }

    fn completed() -> JobOutcome {
        JobOutcome::Completed(DocumentResult {
            pages: vec![],
            stats: DocumentStats::default(),
        })
    }

    fn drive_to_aggregating(r: &JobRegistry, id: JobId) {
        r.update_state(id, JobState::Rasterizing, StatePayload::None)
            .unwrap();
        r.update_state(id, JobState::Processing, StatePayload::PageCount(0))
            .unwrap();
        r.update_state(id, JobState::Aggregating, StatePayload::None)
            .unwrap();
    }

    #[test]
    fn register_starts_in_received() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        assert_eq!(r.state(d.id).unwrap(), JobState::Received);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        assert_eq!(r.register(d.id, &d), Err(JobError::DuplicateJobId(d.id)));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn unknown_job_update_fails() {
        let r = registry();
        let id = JobId::new();
        assert_eq!(
            r.update_state(id, JobState::Rasterizing, StatePayload::None),
            Err(JobError::UnknownJob(id))
        );
        assert_eq!(r.get_result(id).unwrap_err(), JobError::JobNotFound(id));
    }

    #[test]
    fn backwards_transition_is_rejected() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        r.update_state(d.id, JobState::Rasterizing, StatePayload::None)
            .unwrap();
        let err = r
            .update_state(d.id, JobState::Received, StatePayload::None)
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(r.state(d.id).unwrap(), JobState::Rasterizing);
    }

    #[test]
    fn terminal_transition_requires_matching_outcome() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        drive_to_aggregating(&r, d.id);
        assert!(matches!(
            r.update_state(d.id, JobState::Completed, StatePayload::None),
            Err(JobError::MissingOutcome { .. })
        ));
        assert!(matches!(
            r.update_state(
                d.id,
                JobState::Completed,
                StatePayload::Outcome(JobOutcome::Failed(DocumentError::Cancelled))
            ),
            Err(JobError::MissingOutcome { .. })
        ));
        r.update_state(d.id, JobState::Completed, StatePayload::Outcome(completed()))
            .unwrap();
    }

    #[test]
    fn terminal_result_is_frozen() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        drive_to_aggregating(&r, d.id);
        r.update_state(d.id, JobState::Completed, StatePayload::Outcome(completed()))
            .unwrap();

        let err = r
            .update_state(
                d.id,
                JobState::Failed,
                StatePayload::Outcome(JobOutcome::Failed(DocumentError::Cancelled)),
            )
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert!(matches!(
            r.update_page(d.id, 0, PageState::Processing),
            Err(JobError::JobFinished { .. })
        ));

        let a = serde_json::to_vec(&r.get_result(d.id).unwrap()).unwrap();
        let b = serde_json::to_vec(&r.get_result(d.id).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn page_progress_is_tracked() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        r.update_state(d.id, JobState::Rasterizing, StatePayload::None)
            .unwrap();
        r.update_page(d.id, 1, PageState::Processing).unwrap();
        let snap = r.get_result(d.id).unwrap();
        assert_eq!(snap.pages, vec![PageState::Pending, PageState::Processing]);

        assert!(matches!(
            r.update_page(d.id, 0, PageState::Completed),
            Err(JobError::InvalidPageTransition { .. })
        ));
    }

    #[test]
    fn active_jobs_cannot_be_removed_or_evicted() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        assert!(matches!(r.remove(d.id), Err(JobError::JobActive { .. })));
        let far_future = Instant::now() + Duration::from_secs(1_000_000);
        assert_eq!(r.evict_expired_at(far_future), 0);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn finished_jobs_expire_after_retention() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        drive_to_aggregating(&r, d.id);
        r.update_state(d.id, JobState::Completed, StatePayload::Outcome(completed()))
            .unwrap();

        assert_eq!(r.evict_expired_at(Instant::now()), 0);
        assert_eq!(
            r.evict_expired_at(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert_eq!(r.get_result(d.id).unwrap_err(), JobError::JobNotFound(d.id));
    }

    #[test]
    fn unbounded_retention_keeps_outcome_and_entry() {
        let r = JobRegistry::new(Duration::from_secs(u64::MAX));
        let d = doc();
        r.register(d.id, &d).unwrap();
        r.update_state(
            d.id,
            JobState::Failed,
            StatePayload::Outcome(JobOutcome::Failed(DocumentError::Cancelled)),
        )
        .unwrap();

        let snap = r.get_result(d.id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(
            snap.outcome.as_deref().and_then(JobOutcome::error),
            Some(&DocumentError::Cancelled)
        );
        let far_future = Instant::now() + Duration::from_secs(1_000_000);
        assert_eq!(r.evict_expired_at(far_future), 0);
        r.remove(d.id).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn take_returns_then_forgets() {
        let r = registry();
        let d = doc();
        r.register(d.id, &d).unwrap();
        drive_to_aggregating(&r, d.id);
        r.update_state(d.id, JobState::Completed, StatePayload::Outcome(completed()))
            .unwrap();
        let snap = r.take(d.id).unwrap();
        assert_eq!(snap.state, JobState::Completed);
        assert!(snap.outcome.is_some());
        assert!(r.is_empty());
        assert_eq!(r.take(d.id).unwrap_err(), JobError::JobNotFound(d.id));
    }

    #[tokio::test]
    async fn wait_resolves_on_terminal_state() {
        let r = Arc::new(registry());
        let d = doc();
        r.register(d.id, &d).unwrap();

        let waiter = {
            let r = Arc::clone(&r);
            let id = d.id;
            tokio::spawn(async move { r.wait(id).await })
        };

        r.update_state(
            d.id,
            JobState::Failed,
            StatePayload::Outcome(JobOutcome::Failed(DocumentError::Cancelled)),
        )
        .unwrap();

        let snap = waiter.await.unwrap().unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(
            snap.outcome.as_deref().and_then(JobOutcome::error),
            Some(&DocumentError::Cancelled)
        );
    }
}
