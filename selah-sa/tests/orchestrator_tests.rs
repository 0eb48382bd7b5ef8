//! Integration tests for analysis job orchestration
//!
//! Exercises submission dedup, collection fan-out, the worker-slot bound,
//! retry behavior, cancellation, and progress retention against scripted
//! lyrics and judgment stubs over a real temp-file database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use uuid::Uuid;

use selah_common::events::{EventBus, SelahEvent};
use selah_sa::config::RuntimeSettings;
use selah_sa::db::playlists::{set_playlist_tracks, upsert_playlist, Playlist};
use selah_sa::db::results::{history_for_track, latest_for_track};
use selah_sa::db::tracks::{upsert_track, Track};
use selah_sa::models::{
    Citation, DistressPosture, JobStatus, NarrativeVoice, ProgressSnapshot, RawAssessment,
    SpiritualFraming, Verdict,
};
use selah_sa::services::judgment_client::{JudgmentError, JudgmentService};
use selah_sa::services::lyrics_provider::{LyricsDocument, LyricsError, LyricsProvider};
use selah_sa::services::orchestrator::{Orchestrator, SubmitError};
use selah_sa::services::progress_store::ProgressStore;

// ============================================================================
// Scripted stubs
// ============================================================================

/// Scripted lyrics provider: canned lyrics for every track except the ones
/// listed as missing. Counts calls so cache behavior is observable.
struct StubLyrics {
    delay: Duration,
    missing: HashSet<Uuid>,
    calls: AtomicUsize,
}

impl StubLyrics {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            missing: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_missing(mut self, track_id: Uuid) -> Self {
        self.missing.insert(track_id);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LyricsProvider for StubLyrics {
    async fn fetch(&self, track: &Track) -> Result<Option<LyricsDocument>, LyricsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.missing.contains(&track.guid) {
            return Ok(None);
        }
        Ok(Some(LyricsDocument {
            source: "stub".to_string(),
            body: format!("stub lyrics for {}", track.title),
            synced: false,
        }))
    }
}

enum JudgmentScript {
    Succeed,
    /// Transient timeouts for the first n calls, success afterwards
    TimeoutFirst(usize),
    AlwaysTimeout,
    AlwaysMalformed,
}

/// Scripted judgment service. Counts calls and tracks how many assessments
/// ran at the same time, which is how the worker-slot bound is observed.
struct StubJudgment {
    script: JudgmentScript,
    template: RawAssessment,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl StubJudgment {
    fn new(script: JudgmentScript) -> Self {
        Self {
            script,
            template: assessment_template(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_template(mut self, template: RawAssessment) -> Self {
        self.template = template;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgmentService for StubJudgment {
    async fn assess(&self, _lyrics: &str, _rubric: &str) -> Result<RawAssessment, JudgmentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        match self.script {
            JudgmentScript::Succeed => Ok(self.template.clone()),
            JudgmentScript::TimeoutFirst(n) if call < n => Err(JudgmentError::Timeout),
            JudgmentScript::TimeoutFirst(_) => Ok(self.template.clone()),
            JudgmentScript::AlwaysTimeout => Err(JudgmentError::Timeout),
            JudgmentScript::AlwaysMalformed => Err(JudgmentError::Malformed(
                "no parsable JSON object in reply".to_string(),
            )),
        }
    }
}

/// Assessment that normalizes cleanly: base 75, no rule fires, one citation.
fn assessment_template() -> RawAssessment {
    RawAssessment {
        base_score: 75.0,
        voice: NarrativeVoice::Direct,
        distress: DistressPosture::None,
        framing: SpiritualFraming::Explicit,
        themes: vec![],
        citations: vec![Citation {
            reference: "chorus".to_string(),
            quote: "a quoted stub line".to_string(),
        }],
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: tempfile::TempDir,
    pool: SqlitePool,
    orchestrator: Orchestrator,
    event_bus: EventBus,
    lyrics: Arc<StubLyrics>,
    judgment: Arc<StubJudgment>,
}

async fn harness(settings: RuntimeSettings, lyrics: StubLyrics, judgment: StubJudgment) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = selah_common::db::init_database(&dir.path().join("selah.db"))
        .await
        .unwrap();
    let event_bus = EventBus::new(100);
    let lyrics = Arc::new(lyrics);
    let judgment = Arc::new(judgment);
    let orchestrator = Orchestrator::new(
        pool.clone(),
        ProgressStore::new(),
        event_bus.clone(),
        Arc::clone(&lyrics) as Arc<dyn LyricsProvider>,
        Arc::clone(&judgment) as Arc<dyn JudgmentService>,
        &settings,
    );
    Harness {
        _dir: dir,
        pool,
        orchestrator,
        event_bus,
        lyrics,
        judgment,
    }
}

/// Settings with retry delays short enough to exercise in a test.
fn fast_settings(max_concurrent_jobs: usize) -> RuntimeSettings {
    RuntimeSettings {
        max_concurrent_jobs,
        judgment_retry_base: Duration::from_millis(10),
        judgment_retry_cap: Duration::from_millis(40),
        ..RuntimeSettings::default()
    }
}

async fn seed_track(pool: &SqlitePool, n: u32) -> Track {
    let track = Track {
        guid: Uuid::new_v4(),
        spotify_id: format!("sp:track:{}", Uuid::new_v4()),
        title: format!("Song {n}"),
        artist: "Test Artist".to_string(),
        album: None,
        duration_ms: Some(210_000),
    };
    upsert_track(pool, &track).await.unwrap();
    track
}

async fn seed_playlist(pool: &SqlitePool, tracks: &[Track]) -> Uuid {
    let playlist = Playlist {
        guid: Uuid::new_v4(),
        spotify_id: format!("sp:playlist:{}", Uuid::new_v4()),
        name: "Test Playlist".to_string(),
        owner: None,
        snapshot_id: None,
    };
    upsert_playlist(pool, &playlist).await.unwrap();
    let ids: Vec<Uuid> = tracks.iter().map(|t| t.guid).collect();
    set_playlist_tracks(pool, playlist.guid, &ids).await.unwrap();
    playlist.guid
}

async fn wait_terminal(orchestrator: &Orchestrator, job_id: Uuid) -> ProgressSnapshot {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Some(snap) = orchestrator.status(job_id).await {
                if snap.status.is_terminal() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state in time")
}

// ============================================================================
// Single-track jobs
// ============================================================================

#[tokio::test]
async fn test_track_job_runs_to_finished_and_persists_result() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    assert!(handle.created);

    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;
    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.progress.completed, 1);
    assert_eq!(snap.progress.total, 1);
    assert_eq!(snap.progress.percentage, 100.0);
    assert!(snap.error.is_none());

    let summary = snap.result.expect("finished item job carries a summary");
    assert_eq!(summary.score, 75);
    assert_eq!(summary.verdict, Verdict::Acceptable);

    let stored = latest_for_track(&h.pool, track.guid).await.unwrap().unwrap();
    assert_eq!(stored.score, 75);
    assert_eq!(stored.verdict, Verdict::Acceptable);
    assert_eq!(h.lyrics.calls(), 1);
    assert_eq!(h.judgment.calls(), 1);
}

#[tokio::test]
async fn test_unknown_targets_are_rejected() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;

    let err = h.orchestrator.submit_track(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SubmitError::TrackNotFound(_)));

    let err = h
        .orchestrator
        .submit_playlist(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::PlaylistNotFound(_)));

    assert!(h.orchestrator.status(Uuid::new_v4()).await.is_none());
    assert!(h.orchestrator.active_jobs().await.is_empty());
}

#[tokio::test]
async fn test_resubmission_while_in_flight_returns_existing_handle() {
    // Slow lyrics keep the first job in flight across the second submit
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::from_millis(300)),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let first = h.orchestrator.submit_track(track.guid).await.unwrap();
    assert!(first.created);

    let second = h.orchestrator.submit_track(track.guid).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.job_id, first.job_id);

    // After the job settles a new submission creates a fresh job
    wait_terminal(&h.orchestrator, first.job_id).await;
    let third = h.orchestrator.submit_track(track.guid).await.unwrap();
    assert!(third.created);
    assert_ne!(third.job_id, first.job_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_create_exactly_one_job() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::from_millis(200)),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    // Step 1: race eight submissions of the same track
    let mut join_set = JoinSet::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        let track_id = track.guid;
        join_set.spawn(async move { orchestrator.submit_track(track_id).await.unwrap() });
    }

    let mut handles = Vec::new();
    while let Some(result) = join_set.join_next().await {
        handles.push(result.expect("submission task panicked"));
    }

    // Step 2: exactly one creation, everyone agrees on the job id
    let created = handles.iter().filter(|handle| handle.created).count();
    assert_eq!(created, 1);
    let job_id = handles[0].job_id;
    assert!(handles.iter().all(|handle| handle.job_id == job_id));

    // Step 3: the track was analyzed once
    wait_terminal(&h.orchestrator, job_id).await;
    assert_eq!(h.judgment.calls(), 1);
    assert_eq!(history_for_track(&h.pool, track.guid).await.unwrap().len(), 1);
}

// ============================================================================
// Failure classification
// ============================================================================

#[tokio::test]
async fn test_missing_lyrics_fail_without_judgment_call() {
    let _dir = tempfile::tempdir().unwrap();
    let pool = selah_common::db::init_database(&_dir.path().join("selah.db"))
        .await
        .unwrap();
    let track = seed_track(&pool, 1).await;

    let lyrics = Arc::new(StubLyrics::new(Duration::ZERO).with_missing(track.guid));
    let judgment = Arc::new(StubJudgment::new(JudgmentScript::Succeed));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        ProgressStore::new(),
        EventBus::new(100),
        Arc::clone(&lyrics) as Arc<dyn LyricsProvider>,
        Arc::clone(&judgment) as Arc<dyn JudgmentService>,
        &fast_settings(4),
    );

    let handle = orchestrator.submit_track(track.guid).await.unwrap();
    let snap = wait_terminal(&orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Failed);
    let error = snap.error.expect("failed job carries an error");
    assert!(error.starts_with("CONTENT_UNAVAILABLE"), "got: {error}");
    assert_eq!(judgment.calls(), 0);
    assert!(latest_for_track(&pool, track.guid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_transient_judgment_errors_are_retried_to_success() {
    // three timeouts burn every retry; the fourth and final attempt lands
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::TimeoutFirst(3)),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.result.expect("retried job still carries a summary").score, 75);
    assert_eq!(h.judgment.calls(), 4);
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_judgment_unavailable() {
    let settings = RuntimeSettings {
        judgment_max_attempts: 2,
        ..fast_settings(4)
    };
    let h = harness(
        settings,
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::AlwaysTimeout),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Failed);
    let error = snap.error.unwrap();
    assert!(error.starts_with("JUDGMENT_UNAVAILABLE"), "got: {error}");
    assert!(error.contains("after 2 attempts"), "got: {error}");
    assert_eq!(h.judgment.calls(), 2);
}

#[tokio::test]
async fn test_malformed_judgment_output_fails_without_retry() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::AlwaysMalformed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.error.unwrap().starts_with("MALFORMED_OUTPUT"));
    // malformed output is terminal, not retried
    assert_eq!(h.judgment.calls(), 1);
}

#[tokio::test]
async fn test_uncited_assessment_fails_closed() {
    let mut template = assessment_template();
    template.citations.clear();
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed).with_template(template),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.error.unwrap().starts_with("MISSING_CITATION"));
    assert!(latest_for_track(&h.pool, track.guid).await.unwrap().is_none());
}

// ============================================================================
// Collections
// ============================================================================

#[tokio::test]
async fn test_playlist_fan_out_analyzes_every_member() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let mut tracks = Vec::new();
    for n in 0..3 {
        tracks.push(seed_track(&h.pool, n).await);
    }
    let playlist_id = seed_playlist(&h.pool, &tracks).await;

    let handle = h.orchestrator.submit_playlist(playlist_id).await.unwrap();
    assert!(handle.created);

    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;
    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.progress.completed, 3);
    assert_eq!(snap.progress.total, 3);
    assert_eq!(snap.progress.percentage, 100.0);
    // collections carry no aggregate score
    assert!(snap.result.is_none());

    for track in &tracks {
        assert!(latest_for_track(&h.pool, track.guid).await.unwrap().is_some());
    }
    assert_eq!(h.judgment.calls(), 3);
}

#[tokio::test]
async fn test_empty_playlist_is_rejected_before_any_job_exists() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let playlist_id = seed_playlist(&h.pool, &[]).await;

    let err = h.orchestrator.submit_playlist(playlist_id).await.unwrap_err();
    assert!(matches!(err, SubmitError::EmptyCollection(id) if id == playlist_id));
    assert!(h.orchestrator.active_jobs().await.is_empty());
}

#[tokio::test]
async fn test_one_failed_member_still_finishes_the_collection() {
    let dir = tempfile::tempdir().unwrap();
    let pool = selah_common::db::init_database(&dir.path().join("selah.db"))
        .await
        .unwrap();
    let mut tracks = Vec::new();
    for n in 0..5 {
        tracks.push(seed_track(&pool, n).await);
    }
    let broken = tracks[2].guid;

    // slow lyrics hold the children non-terminal long enough to list them
    let lyrics = Arc::new(StubLyrics::new(Duration::from_millis(100)).with_missing(broken));
    let judgment = Arc::new(StubJudgment::new(JudgmentScript::Succeed));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        ProgressStore::new(),
        EventBus::new(100),
        Arc::clone(&lyrics) as Arc<dyn LyricsProvider>,
        Arc::clone(&judgment) as Arc<dyn JudgmentService>,
        &fast_settings(4),
    );
    let playlist_id = seed_playlist(&pool, &tracks).await;

    let handle = orchestrator.submit_playlist(playlist_id).await.unwrap();
    let children: Vec<ProgressSnapshot> = orchestrator
        .active_jobs()
        .await
        .into_iter()
        .filter(|snap| !snap.target.is_collection())
        .collect();
    assert_eq!(children.len(), 5);

    let snap = wait_terminal(&orchestrator, handle.job_id).await;

    // a failed member settles and counts; the collection still finishes
    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.progress.completed, 5);
    assert_eq!(snap.progress.total, 5);

    // the failure stays visible on the child's own record
    for child in &children {
        let child_snap = orchestrator.status(child.job_id).await.unwrap();
        if child.target.id() == broken {
            assert_eq!(child_snap.status, JobStatus::Failed);
            let error = child_snap.error.expect("failed child carries an error");
            assert!(error.starts_with("CONTENT_UNAVAILABLE"), "got: {error}");
        } else {
            assert_eq!(child_snap.status, JobStatus::Finished);
            assert!(child_snap.result.is_some());
        }
    }

    assert!(latest_for_track(&pool, broken).await.unwrap().is_none());
    for track in tracks.iter().filter(|t| t.guid != broken) {
        assert!(latest_for_track(&pool, track.guid).await.unwrap().is_some());
    }
    assert_eq!(judgment.calls(), 4);
}

#[tokio::test]
async fn test_all_members_failing_fails_the_collection() {
    let dir = tempfile::tempdir().unwrap();
    let pool = selah_common::db::init_database(&dir.path().join("selah.db"))
        .await
        .unwrap();
    let first = seed_track(&pool, 0).await;
    let second = seed_track(&pool, 1).await;

    let lyrics = Arc::new(
        StubLyrics::new(Duration::ZERO)
            .with_missing(first.guid)
            .with_missing(second.guid),
    );
    let judgment = Arc::new(StubJudgment::new(JudgmentScript::Succeed));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        ProgressStore::new(),
        EventBus::new(100),
        Arc::clone(&lyrics) as Arc<dyn LyricsProvider>,
        Arc::clone(&judgment) as Arc<dyn JudgmentService>,
        &fast_settings(4),
    );
    let playlist_id = seed_playlist(&pool, &[first, second]).await;

    let handle = orchestrator.submit_playlist(playlist_id).await.unwrap();
    let snap = wait_terminal(&orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Failed);
    let error = snap.error.unwrap();
    assert!(error.starts_with("ALL_ITEMS_FAILED"), "got: {error}");
    assert_eq!(snap.progress.completed, 2);
    assert_eq!(judgment.calls(), 0);
}

#[tokio::test]
async fn test_in_flight_member_is_adopted_not_duplicated() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::from_millis(300)),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let shared = seed_track(&h.pool, 0).await;
    let other = seed_track(&h.pool, 1).await;
    let playlist_id = seed_playlist(&h.pool, &[shared.clone(), other]).await;

    // Step 1: the shared track is already being analyzed
    let direct = h.orchestrator.submit_track(shared.guid).await.unwrap();
    assert!(direct.created);

    // Step 2: the playlist adopts the in-flight job instead of duplicating it
    let collection = h.orchestrator.submit_playlist(playlist_id).await.unwrap();
    assert!(collection.created);

    let resubmit = h.orchestrator.submit_track(shared.guid).await.unwrap();
    assert!(!resubmit.created);
    assert_eq!(resubmit.job_id, direct.job_id);

    // Step 3: both members settle into the collection, each analyzed once
    let snap = wait_terminal(&h.orchestrator, collection.job_id).await;
    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.progress.completed, 2);
    assert_eq!(h.judgment.calls(), 2);
    assert_eq!(history_for_track(&h.pool, shared.guid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_slots_bound_concurrent_analysis() {
    let settings = fast_settings(2);
    let h = harness(
        settings,
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed).with_delay(Duration::from_millis(100)),
    )
    .await;
    let mut tracks = Vec::new();
    for n in 0..6 {
        tracks.push(seed_track(&h.pool, n).await);
    }
    let playlist_id = seed_playlist(&h.pool, &tracks).await;

    let handle = h.orchestrator.submit_playlist(playlist_id).await.unwrap();
    let snap = wait_terminal(&h.orchestrator, handle.job_id).await;

    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.progress.completed, 6);
    assert_eq!(h.judgment.calls(), 6);
    let peak = h.judgment.peak_concurrency();
    assert!(peak <= 2, "observed {peak} concurrent assessments");
    assert!(peak >= 1);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_settles_an_in_flight_job() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::from_secs(2)),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = h.orchestrator.cancel(handle.job_id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Cancelled);

    // cancelling again acknowledges the terminal record as-is
    let again = h.orchestrator.cancel(handle.job_id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);

    assert!(latest_for_track(&h.pool, track.guid).await.unwrap().is_none());
    assert_eq!(h.judgment.calls(), 0);
}

#[tokio::test]
async fn test_cancel_collection_cascades_to_members() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::from_secs(2)),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let mut tracks = Vec::new();
    for n in 0..3 {
        tracks.push(seed_track(&h.pool, n).await);
    }
    let playlist_id = seed_playlist(&h.pool, &tracks).await;

    let handle = h.orchestrator.submit_playlist(playlist_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = h.orchestrator.cancel(handle.job_id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Cancelled);

    // every member was cancelled before producing a result
    tokio::time::timeout(Duration::from_secs(15), async {
        while !h.orchestrator.active_jobs().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not settle after cancellation");

    for track in &tracks {
        assert!(latest_for_track(&h.pool, track.guid).await.unwrap().is_none());
    }
    assert_eq!(h.judgment.calls(), 0);
}

#[tokio::test]
async fn test_cancel_after_partial_completion_keeps_finished_children() {
    // one worker slot serializes the members; the lyrics delay leaves a
    // wide window to cancel while the second member is still fetching
    let h = harness(
        fast_settings(1),
        StubLyrics::new(Duration::from_millis(500)),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let mut tracks = Vec::new();
    for n in 0..3 {
        tracks.push(seed_track(&h.pool, n).await);
    }
    let playlist_id = seed_playlist(&h.pool, &tracks).await;

    let handle = h.orchestrator.submit_playlist(playlist_id).await.unwrap();
    let children: Vec<ProgressSnapshot> = h
        .orchestrator
        .active_jobs()
        .await
        .into_iter()
        .filter(|snap| !snap.target.is_collection())
        .collect();
    assert_eq!(children.len(), 3);

    // wait for the first member to settle, then cancel the collection
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let snap = h.orchestrator.status(handle.job_id).await.unwrap();
            if snap.progress.completed >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no member settled in time");

    let snap = h.orchestrator.cancel(handle.job_id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Cancelled);

    // the finished child keeps its status and result; the rest are cancelled
    let mut finished = 0;
    let mut cancelled = 0;
    for child in &children {
        let child_snap = h.orchestrator.status(child.job_id).await.unwrap();
        match child_snap.status {
            JobStatus::Finished => {
                assert!(child_snap.result.is_some());
                finished += 1;
            }
            JobStatus::Cancelled => cancelled += 1,
            other => panic!("unexpected child status {other:?}"),
        }
    }
    assert_eq!(finished, 1);
    assert_eq!(cancelled, 2);
    assert_eq!(h.judgment.calls(), 1);
}

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;

    let err = h.orchestrator.cancel(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SubmitError::JobNotFound(_)));
}

// ============================================================================
// Progress retention and caching
// ============================================================================

#[tokio::test]
async fn test_terminal_records_are_swept_after_retention() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();
    wait_terminal(&h.orchestrator, handle.job_id).await;

    let removed = h
        .orchestrator
        .progress_store()
        .sweep_terminal(Duration::ZERO)
        .await;
    assert!(removed >= 1);

    assert!(h.orchestrator.status(handle.job_id).await.is_none());
    let err = h.orchestrator.cancel(handle.job_id).await.unwrap_err();
    assert!(matches!(err, SubmitError::JobNotFound(_)));

    // the persisted result outlives the progress record
    assert!(latest_for_track(&h.pool, track.guid).await.unwrap().is_some());
}

#[tokio::test]
async fn test_cached_lyrics_are_not_refetched_on_reanalysis() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let first = h.orchestrator.submit_track(track.guid).await.unwrap();
    wait_terminal(&h.orchestrator, first.job_id).await;
    assert_eq!(h.lyrics.calls(), 1);

    let second = h.orchestrator.submit_track(track.guid).await.unwrap();
    assert!(second.created);
    wait_terminal(&h.orchestrator, second.job_id).await;

    // second run hits the lyrics cache, judgment runs again
    assert_eq!(h.lyrics.calls(), 1);
    assert_eq!(h.judgment.calls(), 2);
    assert_eq!(history_for_track(&h.pool, track.guid).await.unwrap().len(), 2);
}

// ============================================================================
// Event stream
// ============================================================================

#[tokio::test]
async fn test_job_lifecycle_events_reach_subscribers() {
    let h = harness(
        fast_settings(4),
        StubLyrics::new(Duration::ZERO),
        StubJudgment::new(JudgmentScript::Succeed),
    )
    .await;
    let track = seed_track(&h.pool, 1).await;

    let mut rx = h.event_bus.subscribe();
    let handle = h.orchestrator.submit_track(track.guid).await.unwrap();

    let mut seen = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if event_job_id(&event) != handle.job_id {
                continue;
            }
            seen.push(event.event_type().to_string());
            if let SelahEvent::AnalysisJobFinished { score, verdict, .. } = &event {
                return (*score, verdict.clone());
            }
        }
    })
    .await
    .expect("no finished event arrived");

    assert_eq!(
        seen,
        vec!["AnalysisJobQueued", "AnalysisJobStarted", "AnalysisJobFinished"]
    );
    assert_eq!(finished.0, Some(75));
    assert_eq!(finished.1.as_deref(), Some("acceptable"));
}

fn event_job_id(event: &SelahEvent) -> Uuid {
    match event {
        SelahEvent::AnalysisJobQueued { job_id, .. }
        | SelahEvent::AnalysisJobStarted { job_id, .. }
        | SelahEvent::AnalysisJobProgress { job_id, .. }
        | SelahEvent::AnalysisJobFinished { job_id, .. }
        | SelahEvent::AnalysisJobFailed { job_id, .. }
        | SelahEvent::AnalysisJobCancelled { job_id, .. } => *job_id,
    }
}
