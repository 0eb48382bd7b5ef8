//! Job orchestration
//!
//! Owns the live-job registry and everything that happens between an HTTP
//! submission and a terminal progress record: duplicate suppression,
//! collection fan-out, the worker-slot cap, cancellation cascade, and
//! collection supervision.
//!
//! Registry membership tracks non-terminal jobs only. The dedup check and
//! registration happen under one lock acquisition, so two concurrent
//! submissions of the same target cannot both create a job; entries leave
//! the registry only after the progress record is terminal. Completion is
//! signalled per job over a watch channel, which is how collection
//! supervisors wait on children (including adopted ones) without polling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use selah_common::events::{EventBus, SelahEvent};

use crate::config::RuntimeSettings;
use crate::db;
use crate::db::tracks::Track;
use crate::models::{AnalysisTarget, JobHandle, JobStatus, ProgressRecord, ProgressSnapshot};
use crate::services::job_runner::{ItemJob, JobRunner};
use crate::services::judgment_client::JudgmentService;
use crate::services::lyrics_provider::LyricsProvider;
use crate::services::progress_store::ProgressStore;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("track {0} not found")]
    TrackNotFound(Uuid),
    #[error("playlist {0} not found")]
    PlaylistNotFound(Uuid),
    #[error("playlist {0} has no tracks")]
    EmptyCollection(Uuid),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error(transparent)]
    Database(#[from] selah_common::Error),
}

/// Registry entry for a non-terminal job.
struct ActiveJob {
    target: AnalysisTarget,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    /// Child job ids for collections, empty for items
    children: Vec<Uuid>,
}

#[derive(Default)]
struct JobRegistry {
    by_target: HashMap<AnalysisTarget, Uuid>,
    jobs: HashMap<Uuid, ActiveJob>,
}

/// A collection supervisor's handle on one member job.
struct ChildWaiter {
    job_id: Uuid,
    label: String,
    /// True when the member was already in flight at submission and this
    /// collection linked to it instead of creating a duplicate. Adopted
    /// members report no parent themselves, so the supervisor counts them.
    adopted: bool,
    done: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: SqlitePool,
    store: ProgressStore,
    event_bus: EventBus,
    runner: JobRunner,
    registry: Arc<Mutex<JobRegistry>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        store: ProgressStore,
        event_bus: EventBus,
        lyrics: Arc<dyn LyricsProvider>,
        judgment: Arc<dyn JudgmentService>,
        settings: &RuntimeSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs));
        let runner = JobRunner::new(
            db.clone(),
            store.clone(),
            event_bus.clone(),
            lyrics,
            judgment,
            slots,
            settings.judgment_retry_policy(),
        );
        Self {
            db,
            store,
            event_bus,
            runner,
            registry: Arc::new(Mutex::new(JobRegistry::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.store
    }

    /// Parent token for every job this orchestrator spawns.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Submits a single-track analysis. Returns the existing handle when a
    /// job for the track is already in flight.
    pub async fn submit_track(&self, track_id: Uuid) -> Result<JobHandle, SubmitError> {
        let track = db::tracks::get_track(&self.db, track_id)
            .await?
            .ok_or(SubmitError::TrackNotFound(track_id))?;
        let target = AnalysisTarget::Track(track_id);

        let mut registry = self.registry.lock().await;
        if let Some(existing) = self.claim_target(&mut registry, target).await {
            debug!(job_id = %existing, %target, "submission deduplicated to in-flight job");
            return Ok(JobHandle {
                job_id: existing,
                target,
                created: false,
            });
        }

        let job_id = Uuid::new_v4();
        self.spawn_item(&mut registry, job_id, track, None, self.shutdown.child_token())
            .await;
        info!(job_id = %job_id, %target, "track analysis queued");
        Ok(JobHandle {
            job_id,
            target,
            created: true,
        })
    }

    /// Submits a playlist analysis: one collection job plus one child per
    /// member from the current membership snapshot. Empty playlists are
    /// rejected before any job is created.
    pub async fn submit_playlist(&self, playlist_id: Uuid) -> Result<JobHandle, SubmitError> {
        let playlist = db::playlists::get_playlist(&self.db, playlist_id)
            .await?
            .ok_or(SubmitError::PlaylistNotFound(playlist_id))?;
        let members = db::playlists::playlist_members(&self.db, playlist_id).await?;
        if members.is_empty() {
            return Err(SubmitError::EmptyCollection(playlist_id));
        }
        let target = AnalysisTarget::Playlist(playlist_id);

        let mut registry = self.registry.lock().await;
        if let Some(existing) = self.claim_target(&mut registry, target).await {
            debug!(job_id = %existing, %target, "submission deduplicated to in-flight job");
            return Ok(JobHandle {
                job_id: existing,
                target,
                created: false,
            });
        }

        let collection_id = Uuid::new_v4();
        let collection_cancel = self.shutdown.child_token();
        self.store
            .insert(ProgressRecord::new_collection(
                collection_id,
                target,
                members.len() as u32,
            ))
            .await;

        let mut children = Vec::with_capacity(members.len());
        let mut waiters = Vec::with_capacity(members.len());
        for track in members {
            let child_target = AnalysisTarget::Track(track.guid);
            let label = track.display_label();

            // per-item dedup: adopt a member already in flight
            if let Some(existing_child) = self.claim_target(&mut registry, child_target).await {
                if let Some(active) = registry.jobs.get(&existing_child) {
                    debug!(
                        collection_id = %collection_id,
                        child_id = %existing_child,
                        track = %label,
                        "adopting in-flight job as collection member"
                    );
                    children.push(existing_child);
                    waiters.push(ChildWaiter {
                        job_id: existing_child,
                        label,
                        adopted: true,
                        done: active.done.clone(),
                    });
                    continue;
                }
                // registry maps disagree; fall through and start fresh
                registry.by_target.remove(&child_target);
            }

            let child_id = Uuid::new_v4();
            let done = self
                .spawn_item(
                    &mut registry,
                    child_id,
                    track,
                    Some(collection_id),
                    collection_cancel.child_token(),
                )
                .await;
            children.push(child_id);
            waiters.push(ChildWaiter {
                job_id: child_id,
                label,
                adopted: false,
                done,
            });
        }

        let (done_tx, done_rx) = watch::channel(false);
        registry.by_target.insert(target, collection_id);
        registry.jobs.insert(
            collection_id,
            ActiveJob {
                target,
                cancel: collection_cancel.clone(),
                done: done_rx,
                children,
            },
        );
        drop(registry);

        self.event_bus.emit_lossy(SelahEvent::AnalysisJobQueued {
            job_id: collection_id,
            target_kind: target.kind_str().to_string(),
            target_id: playlist_id,
            timestamp: Utc::now(),
        });
        info!(
            job_id = %collection_id,
            playlist = %playlist.name,
            members = waiters.len(),
            "playlist analysis queued"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.supervise_collection(collection_id, collection_cancel, waiters)
                .await;
            this.finalize(collection_id, target).await;
            let _ = done_tx.send(true);
        });

        Ok(JobHandle {
            job_id: collection_id,
            target,
            created: true,
        })
    }

    /// Requests cancellation. Non-terminal state is written through before
    /// returning; in-flight workers observe the token at their next
    /// checkpoint. Cancelling a collection cancels all non-terminal
    /// children, adopted ones included. Terminal jobs acknowledge as-is.
    pub async fn cancel(&self, job_id: Uuid) -> Result<ProgressSnapshot, SubmitError> {
        let entry = {
            let registry = self.registry.lock().await;
            registry
                .jobs
                .get(&job_id)
                .map(|job| (job.cancel.clone(), job.children.clone()))
        };

        let Some((token, children)) = entry else {
            // unknown, or already terminal and deregistered
            return self
                .store
                .snapshot(job_id)
                .await
                .ok_or(SubmitError::JobNotFound(job_id));
        };

        token.cancel();
        if self.store.mark_cancelled(job_id).await {
            info!(job_id = %job_id, "job cancelled");
            self.event_bus.emit_lossy(SelahEvent::AnalysisJobCancelled {
                job_id,
                timestamp: Utc::now(),
            });
        }

        for child_id in children {
            let child_token = {
                let registry = self.registry.lock().await;
                registry.jobs.get(&child_id).map(|job| job.cancel.clone())
            };
            // adopted children are not on the collection's token tree
            if let Some(child_token) = child_token {
                child_token.cancel();
            }
            if self.store.mark_cancelled(child_id).await {
                self.event_bus.emit_lossy(SelahEvent::AnalysisJobCancelled {
                    job_id: child_id,
                    timestamp: Utc::now(),
                });
            }
        }

        self.store
            .snapshot(job_id)
            .await
            .ok_or(SubmitError::JobNotFound(job_id))
    }

    /// Current snapshot for a job; never blocks on in-flight work.
    pub async fn status(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.store.snapshot(job_id).await
    }

    pub async fn active_jobs(&self) -> Vec<ProgressSnapshot> {
        self.store.active_snapshots().await
    }

    /// Returns the in-flight job id for a target, cleaning up a stale
    /// registry entry whose record already went terminal (the window
    /// between the terminal write and deregistration).
    async fn claim_target(
        &self,
        registry: &mut JobRegistry,
        target: AnalysisTarget,
    ) -> Option<Uuid> {
        let existing = *registry.by_target.get(&target)?;
        let terminal = self
            .store
            .snapshot(existing)
            .await
            .map_or(true, |snap| snap.status.is_terminal());
        if !terminal {
            return Some(existing);
        }
        registry.by_target.remove(&target);
        registry.jobs.remove(&existing);
        None
    }

    /// Creates the record and registry entries for one item job and spawns
    /// its worker. Caller holds the registry lock. Returns the completion
    /// receiver.
    async fn spawn_item(
        &self,
        registry: &mut JobRegistry,
        job_id: Uuid,
        track: Track,
        parent: Option<Uuid>,
        cancel: CancellationToken,
    ) -> watch::Receiver<bool> {
        let target = AnalysisTarget::Track(track.guid);
        self.store
            .insert(ProgressRecord::new_item(job_id, target, parent))
            .await;

        let (done_tx, done_rx) = watch::channel(false);
        registry.by_target.insert(target, job_id);
        registry.jobs.insert(
            job_id,
            ActiveJob {
                target,
                cancel: cancel.clone(),
                done: done_rx.clone(),
                children: Vec::new(),
            },
        );

        self.event_bus.emit_lossy(SelahEvent::AnalysisJobQueued {
            job_id,
            target_kind: target.kind_str().to_string(),
            target_id: track.guid,
            timestamp: Utc::now(),
        });

        let runner = self.runner.clone();
        let this = self.clone();
        tokio::spawn(async move {
            runner
                .run_item(ItemJob {
                    job_id,
                    track,
                    parent,
                    cancel,
                })
                .await;
            this.finalize(job_id, target).await;
            let _ = done_tx.send(true);
        });

        done_rx
    }

    /// Removes a terminal job from the registry. Runs after the terminal
    /// store write, so a status query racing deregistration still observes
    /// the terminal record.
    async fn finalize(&self, job_id: Uuid, target: AnalysisTarget) {
        let mut registry = self.registry.lock().await;
        registry.jobs.remove(&job_id);
        if registry.by_target.get(&target) == Some(&job_id) {
            registry.by_target.remove(&target);
        }
    }

    /// Waits for every member to settle, counts adopted settles, then
    /// derives the aggregate's terminal state.
    async fn supervise_collection(
        &self,
        collection_id: Uuid,
        cancel: CancellationToken,
        waiters: Vec<ChildWaiter>,
    ) {
        let member_ids: Vec<Uuid> = waiters.iter().map(|w| w.job_id).collect();

        if self.store.mark_started(collection_id).await {
            self.event_bus.emit_lossy(SelahEvent::AnalysisJobStarted {
                job_id: collection_id,
                timestamp: Utc::now(),
            });
        }

        let mut settles = FuturesUnordered::new();
        for waiter in waiters {
            settles.push(wait_settled(waiter));
        }

        while let Some((waiter, clean)) = settles.next().await {
            if !clean {
                // the worker task died without signalling; settle its record
                let still_running = self
                    .store
                    .snapshot(waiter.job_id)
                    .await
                    .map_or(false, |snap| !snap.status.is_terminal());
                if still_running {
                    warn!(job_id = %waiter.job_id, "worker task terminated without settling, marking failed");
                    if self
                        .store
                        .mark_failed(
                            waiter.job_id,
                            "INTERNAL: worker task terminated unexpectedly".to_string(),
                        )
                        .await
                    {
                        self.event_bus.emit_lossy(SelahEvent::AnalysisJobFailed {
                            job_id: waiter.job_id,
                            code: "INTERNAL".to_string(),
                            message: "worker task terminated unexpectedly".to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }

            // owned children report their own settles; the supervisor covers
            // adopted members and dead workers
            if waiter.adopted || !clean {
                let settled = matches!(
                    self.store.snapshot(waiter.job_id).await.map(|s| s.status),
                    Some(JobStatus::Finished) | Some(JobStatus::Failed)
                );
                if settled {
                    if let Some((completed, total)) = self
                        .store
                        .increment_completed(collection_id, Some(waiter.label.clone()))
                        .await
                    {
                        self.event_bus.emit_lossy(SelahEvent::AnalysisJobProgress {
                            job_id: collection_id,
                            completed,
                            total,
                            current_item: Some(waiter.label.clone()),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        }

        self.finalize_collection(collection_id, &cancel, &member_ids)
            .await;
    }

    async fn finalize_collection(
        &self,
        collection_id: Uuid,
        cancel: &CancellationToken,
        member_ids: &[Uuid],
    ) {
        if cancel.is_cancelled() {
            if self.store.mark_cancelled(collection_id).await {
                self.event_bus.emit_lossy(SelahEvent::AnalysisJobCancelled {
                    job_id: collection_id,
                    timestamp: Utc::now(),
                });
            }
            return;
        }

        let mut any_finished = false;
        let mut any_failed = false;
        for member_id in member_ids {
            match self.store.snapshot(*member_id).await.map(|s| s.status) {
                Some(JobStatus::Finished) => any_finished = true,
                Some(JobStatus::Failed) => any_failed = true,
                _ => {}
            }
        }

        if any_finished {
            // partial failure still finishes the collection
            if self.store.finish_collection(collection_id).await {
                info!(job_id = %collection_id, "collection analysis finished");
                self.event_bus.emit_lossy(SelahEvent::AnalysisJobFinished {
                    job_id: collection_id,
                    track_id: None,
                    score: None,
                    verdict: None,
                    timestamp: Utc::now(),
                });
            }
        } else if any_failed {
            let message = "ALL_ITEMS_FAILED: no playlist member completed successfully";
            if self
                .store
                .mark_failed(collection_id, message.to_string())
                .await
            {
                warn!(job_id = %collection_id, "collection analysis failed");
                self.event_bus.emit_lossy(SelahEvent::AnalysisJobFailed {
                    job_id: collection_id,
                    code: "ALL_ITEMS_FAILED".to_string(),
                    message: "no playlist member completed successfully".to_string(),
                    timestamp: Utc::now(),
                });
            }
        } else {
            // every member was individually cancelled
            if self.store.mark_cancelled(collection_id).await {
                self.event_bus.emit_lossy(SelahEvent::AnalysisJobCancelled {
                    job_id: collection_id,
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

/// Resolves when the job's completion channel reports done. `false` means
/// the sender dropped without signalling, i.e. the worker task died.
async fn wait_settled(mut waiter: ChildWaiter) -> (ChildWaiter, bool) {
    let clean = loop {
        if *waiter.done.borrow_and_update() {
            break true;
        }
        if waiter.done.changed().await.is_err() {
            break false;
        }
    };
    (waiter, clean)
}
