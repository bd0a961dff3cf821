//! One check-in attempt, end to end.
//!
//! ```text
//! STARTED ──▶ CAPTURING ──▶ EVALUATING ──▶ DONE
//! ```
//!
//! STARTED fetches the enrollment, opens the liveness session and starts the
//! frame source. CAPTURING runs landmark inference on every frame, feeds the
//! liveness session and keeps the best probe frame. EVALUATING embeds the
//! probe and matches it. DONE builds the outcome and hands it to the
//! attendance sink without waiting for it.
//!
//! The frame source is stopped on every exit path. Expected verification
//! failures are reported in the outcome; only infrastructure faults become
//! [`CheckInError`].

use crate::adapters::{
    AttendanceSink, EmbeddingExtractor, EnrollmentStore, FrameSource, FrameSourceError,
    InferenceError, LandmarkDetection, LandmarkExtractor, StoreFault,
};
use crate::liveness::{LivenessConfig, LivenessDetector, LivenessError};
use crate::matcher::{CosineMatchEngine, MatchEngine, MatchError};
use crate::outcome::{FailureReason, OutcomeBuilder, VerificationOutcome};
use crate::probe::{crop_face, ProbeSelector, DEFAULT_MIN_FRONTALITY};
use crate::types::{EnrollmentRecord, FaceCrop, FaceEmbedding, Frame, DEFAULT_REQUIRED_BLINKS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Infrastructure faults. Rejections are never reported through this type.
#[derive(Error, Debug)]
pub enum CheckInError {
    #[error("{stage} inference timed out after {timeout:?}")]
    InferenceTimeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error(transparent)]
    StoreUnavailable(#[from] StoreFault),
    #[error(transparent)]
    FrameSource(#[from] FrameSourceError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error("invalid check-in configuration: {0}")]
    InvalidConfig(String),
    #[error("worker task failed: {0}")]
    Join(String),
}

/// Per-attempt parameters.
#[derive(Debug, Clone)]
pub struct CheckInConfig {
    pub similarity_threshold: f32,
    pub liveness: LivenessConfig,
    /// Used when the user has no enrollment; otherwise the enrollment's policy wins.
    pub required_blinks: u32,
    /// Capture budget in media time, measured from the first frame.
    pub time_budget: Duration,
    /// Hard limit in wall-clock time, covers stalled sources.
    pub wall_clock_limit: Duration,
    pub inference_timeout: Duration,
    pub frame_queue_depth: usize,
    pub min_frontality: f32,
    /// How long to wait for the capture worker to release the source.
    pub release_grace: Duration,
}

impl Default for CheckInConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            liveness: LivenessConfig::default(),
            required_blinks: DEFAULT_REQUIRED_BLINKS,
            time_budget: Duration::from_secs(5),
            wall_clock_limit: Duration::from_secs(15),
            inference_timeout: Duration::from_secs(2),
            frame_queue_depth: 4,
            min_frontality: DEFAULT_MIN_FRONTALITY,
            release_grace: Duration::from_secs(1),
        }
    }
}

impl CheckInConfig {
    pub fn validate(&self) -> Result<(), CheckInError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(CheckInError::InvalidConfig(format!(
                "similarity threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.frame_queue_depth == 0 {
            return Err(CheckInError::InvalidConfig(
                "frame queue depth must be at least 1".into(),
            ));
        }
        if self.time_budget.is_zero() || self.wall_clock_limit.is_zero() {
            return Err(CheckInError::InvalidConfig(
                "capture budgets must be non-zero".into(),
            ));
        }
        if self.inference_timeout.is_zero() {
            return Err(CheckInError::InvalidConfig(
                "inference timeout must be non-zero".into(),
            ));
        }
        self.liveness.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CheckInPhase {
    Started,
    Capturing,
    Evaluating,
    Done,
}

/// Forward-only phase tracker.
#[derive(Debug)]
struct PhaseTracker {
    attempt: u64,
    phase: CheckInPhase,
}

impl PhaseTracker {
    fn new(attempt: u64) -> Self {
        Self {
            attempt,
            phase: CheckInPhase::Started,
        }
    }

    fn advance(&mut self, next: CheckInPhase) {
        if next > self.phase {
            tracing::debug!(attempt = self.attempt, from = ?self.phase, to = ?next, "check-in phase");
            self.phase = next;
        }
    }
}

/// Requests cancellation of a running check-in.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Observes cancellation requests.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Stays pending if every
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelSignal(rx))
}

/// Calls `stop` on the wrapped source when dropped, including on panic.
struct ReleaseOnDrop(Box<dyn FrameSource>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Blocking worker pumping frames from a source into a bounded channel.
struct CaptureTask {
    rx: mpsc::Receiver<Result<Frame, FrameSourceError>>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl CaptureTask {
    fn spawn(source: Box<dyn FrameSource>, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let stop_flag = Arc::clone(&stop);
        let dropped_count = Arc::clone(&dropped);
        let join = tokio::task::spawn_blocking(move || {
            let mut source = ReleaseOnDrop(source);
            if let Err(e) = source.0.start() {
                let _ = tx.blocking_send(Err(e));
                return;
            }
            let live = source.0.is_live();

            while !stop_flag.load(Ordering::Acquire) {
                match source.0.next_frame() {
                    Ok(Some(frame)) if live => match tx.try_send(Ok(frame)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dropped_count.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    Ok(Some(frame)) => {
                        if tx.blocking_send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        Self {
            rx,
            stop,
            dropped,
            join: Some(join),
        }
    }

    async fn recv(&mut self) -> Option<Result<Frame, FrameSourceError>> {
        self.rx.recv().await
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait (bounded) until the source has been released.
    async fn shutdown(&mut self, grace: Duration) {
        self.stop.store(true, Ordering::Release);
        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        if let Some(join) = self.join.take() {
            match tokio::time::timeout(grace, join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "capture worker panicked"),
                Err(_) => tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "capture worker did not exit in time, source released in background"
                ),
            }
        }
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.rx.close();
    }
}

enum CaptureEnd {
    Exhausted,
    Complete,
    TimedOut,
    Cancelled,
    Fault(CheckInError),
}

#[derive(Debug, Default)]
struct CaptureStats {
    frames_processed: usize,
    faces_seen: usize,
    multi_face_frames: usize,
    no_face_frames: usize,
    landmark_failures: usize,
}

/// Drives check-in attempts against a fixed set of collaborators.
pub struct CheckInOrchestrator {
    landmarks: Arc<dyn LandmarkExtractor>,
    embedder: Arc<dyn EmbeddingExtractor>,
    enrollments: Arc<dyn EnrollmentStore>,
    attendance: Arc<dyn AttendanceSink>,
    matcher: Arc<dyn MatchEngine>,
    attempts: AtomicU64,
}

impl CheckInOrchestrator {
    pub fn new(
        landmarks: Arc<dyn LandmarkExtractor>,
        embedder: Arc<dyn EmbeddingExtractor>,
        enrollments: Arc<dyn EnrollmentStore>,
        attendance: Arc<dyn AttendanceSink>,
    ) -> Self {
        Self {
            landmarks,
            embedder,
            enrollments,
            attendance,
            matcher: Arc::new(CosineMatchEngine),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn MatchEngine>) -> Self {
        self.matcher = matcher;
        self
    }

    pub async fn run_check_in(
        &self,
        user_id: &str,
        source: Box<dyn FrameSource>,
        config: &CheckInConfig,
    ) -> Result<VerificationOutcome, CheckInError> {
        self.run_check_in_with_cancel(user_id, source, config, CancelSignal::never())
            .await
    }

    pub async fn run_check_in_with_cancel(
        &self,
        user_id: &str,
        source: Box<dyn FrameSource>,
        config: &CheckInConfig,
        mut cancel: CancelSignal,
    ) -> Result<VerificationOutcome, CheckInError> {
        config.validate()?;
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let mut phase = PhaseTracker::new(attempt);

        // STARTED
        if !self.embedder.is_ready() {
            return Err(CheckInError::InferenceUnavailable(
                "embedding model not loaded".into(),
            ));
        }
        let enrollment = self.enrollments.get_enrollment(user_id).await?;
        let required_blinks = enrollment
            .as_ref()
            .map(|r| r.liveness.required_blinks)
            .unwrap_or(config.required_blinks);
        tracing::info!(
            attempt,
            user = user_id,
            enrolled = enrollment.is_some(),
            required_blinks,
            "check-in started"
        );

        let mut detector = LivenessDetector::new(config.liveness.clone())?;
        let handle = detector.open()?;
        let mut capture = CaptureTask::spawn(source, config.frame_queue_depth);
        phase.advance(CheckInPhase::Capturing);

        // CAPTURING
        let mut probe = ProbeSelector::new(
            config.liveness.layout,
            config.min_frontality,
            config.liveness.reopen_threshold,
        );
        let mut stats = CaptureStats::default();
        let deadline = Instant::now() + config.wall_clock_limit;
        let mut first_timestamp: Option<Duration> = None;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break CaptureEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(attempt, "wall-clock limit reached during capture");
                    break CaptureEnd::TimedOut;
                }
                next = capture.recv() => next,
            };

            let frame = match next {
                None => break CaptureEnd::Exhausted,
                Some(Err(e)) => break CaptureEnd::Fault(e.into()),
                Some(Ok(frame)) => Arc::new(frame),
            };

            let first = *first_timestamp.get_or_insert(frame.timestamp);
            if frame.timestamp.saturating_sub(first) > config.time_budget {
                break CaptureEnd::TimedOut;
            }

            let landmarks = match self.detect_landmarks(&frame, config.inference_timeout).await {
                Ok(LandmarkDetection::Face(set)) => {
                    stats.faces_seen += 1;
                    Some(set)
                }
                Ok(LandmarkDetection::NoFace) => {
                    stats.no_face_frames += 1;
                    None
                }
                Ok(LandmarkDetection::MultipleFaces(count)) => {
                    stats.multi_face_frames += 1;
                    tracing::debug!(attempt, sequence = frame.sequence, count, "multiple faces in frame");
                    None
                }
                Err(InferenceError::Unavailable(msg)) => {
                    break CaptureEnd::Fault(CheckInError::InferenceUnavailable(msg));
                }
                Err(InferenceError::Failed(msg)) => {
                    stats.landmark_failures += 1;
                    tracing::debug!(attempt, sequence = frame.sequence, error = %msg, "landmark sample skipped");
                    None
                }
            };

            match detector.feed(handle, frame.timestamp, landmarks.as_ref()) {
                Ok(_) => {}
                Err(LivenessError::OutOfOrderFrame { previous, got }) => {
                    tracing::warn!(attempt, ?previous, ?got, "out-of-order frame skipped");
                    continue;
                }
                Err(e) => break CaptureEnd::Fault(e.into()),
            }
            stats.frames_processed += 1;

            if let Some(set) = &landmarks {
                probe.consider(&frame, set);
            }

            let blinks = match detector.blink_count(handle) {
                Ok(n) => n,
                Err(e) => break CaptureEnd::Fault(e.into()),
            };
            if blinks >= required_blinks as usize && probe.has_probe() {
                break CaptureEnd::Complete;
            }
        };

        capture.shutdown(config.release_grace).await;
        let frames_dropped = capture.dropped();
        drop(capture);
        phase.advance(CheckInPhase::Evaluating);

        let mut builder = OutcomeBuilder::new(
            user_id,
            config.similarity_threshold,
            required_blinks,
        );
        builder.frames(stats.frames_processed, frames_dropped);

        let liveness = detector.close(handle)?;
        match end {
            CaptureEnd::Fault(e) => {
                tracing::error!(attempt, user = user_id, error = %e, "check-in aborted");
                return Err(e);
            }
            CaptureEnd::Cancelled => {
                tracing::info!(attempt, user = user_id, "check-in cancelled");
                builder.blinks_only(liveness.blink_count());
                builder.cancelled();
            }
            CaptureEnd::Exhausted | CaptureEnd::Complete | CaptureEnd::TimedOut => {
                if matches!(end, CaptureEnd::TimedOut) {
                    builder.reason(FailureReason::SessionTimeout);
                }
                builder.liveness(liveness.blink_count());
                self.evaluate_face(&mut builder, enrollment.as_ref(), probe, &stats, config)
                    .await?;
            }
        }

        let outcome = builder.build();
        phase.advance(CheckInPhase::Done);
        tracing::info!(
            attempt,
            user = user_id,
            accepted = outcome.overall_accepted,
            blinks = outcome.blink_count,
            score = ?outcome.score,
            reasons = ?outcome.reasons,
            frames = outcome.frames_processed,
            dropped = outcome.frames_dropped,
            undefined = liveness.undefined_samples,
            landmark_failures = stats.landmark_failures,
            "check-in complete"
        );

        self.persist_detached(outcome.clone());
        Ok(outcome)
    }

    async fn evaluate_face(
        &self,
        builder: &mut OutcomeBuilder,
        enrollment: Option<&EnrollmentRecord>,
        probe: ProbeSelector,
        stats: &CaptureStats,
        config: &CheckInConfig,
    ) -> Result<(), CheckInError> {
        // Face-count reasons hold whether or not the user is enrolled.
        let crop = probe.into_best().as_ref().and_then(crop_face);
        if crop.is_none() {
            if stats.multi_face_frames > 0 {
                builder.reason(FailureReason::MultipleFacesDetected);
            }
            if stats.faces_seen > 0 || stats.multi_face_frames == 0 {
                builder.reason(FailureReason::NoFaceDetected);
            }
            tracing::debug!(
                faces = stats.faces_seen,
                multi = stats.multi_face_frames,
                empty = stats.no_face_frames,
                "no usable probe frame"
            );
        }

        let Some(record) = enrollment else {
            builder.reason(FailureReason::NotEnrolled);
            return Ok(());
        };
        let Some(crop) = crop else {
            return Ok(());
        };

        let embedding = self.embed_probe(crop, config.inference_timeout).await?;
        match self
            .matcher
            .compare(&embedding, record, config.similarity_threshold)
        {
            Ok(result) => builder.face_score(result.score, result.accepted),
            Err(e @ MatchError::ModelVersionMismatch { .. }) => {
                tracing::warn!(user = %record.user_id, error = %e, "re-enrollment required");
                builder.reason(FailureReason::ModelVersionMismatch);
            }
            Err(e @ MatchError::EmbeddingDimensionMismatch { .. }) => {
                tracing::warn!(user = %record.user_id, error = %e, "stored embedding rejected");
                builder.reason(FailureReason::EmbeddingDimensionMismatch);
            }
            Err(MatchError::EmptyEnrollment(_)) => builder.reason(FailureReason::NotEnrolled),
            Err(e @ MatchError::InvalidThreshold(_)) => {
                return Err(CheckInError::InvalidConfig(e.to_string()));
            }
        }
        Ok(())
    }

    /// Landmark inference on the blocking pool. A timeout counts as a failed
    /// sample, not a fault.
    async fn detect_landmarks(
        &self,
        frame: &Arc<Frame>,
        timeout: Duration,
    ) -> Result<LandmarkDetection, InferenceError> {
        let extractor = Arc::clone(&self.landmarks);
        let frame = Arc::clone(frame);
        let task = tokio::task::spawn_blocking(move || extractor.extract(&frame));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(InferenceError::Failed(format!("landmark worker: {e}"))),
            Err(_) => Err(InferenceError::Failed(format!(
                "landmark inference exceeded {timeout:?}"
            ))),
        }
    }

    async fn embed_probe(
        &self,
        crop: FaceCrop,
        timeout: Duration,
    ) -> Result<FaceEmbedding, CheckInError> {
        let embedder = Arc::clone(&self.embedder);
        let task = tokio::task::spawn_blocking(move || embedder.embed(&crop));
        let embedding = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                return Err(CheckInError::InferenceTimeout {
                    stage: "embedding",
                    timeout,
                })
            }
            Ok(Err(e)) => return Err(CheckInError::Join(e.to_string())),
            Ok(Ok(Err(InferenceError::Unavailable(msg)))) => {
                return Err(CheckInError::InferenceUnavailable(msg))
            }
            Ok(Ok(Err(InferenceError::Failed(msg)))) => {
                return Err(CheckInError::InferenceFailed(msg))
            }
            Ok(Ok(Ok(embedding))) => embedding,
        };
        if !embedding.is_finite() {
            return Err(CheckInError::InferenceFailed(
                "embedding contains non-finite values".into(),
            ));
        }
        Ok(embedding)
    }

    fn persist_detached(&self, outcome: VerificationOutcome) {
        let sink = Arc::clone(&self.attendance);
        tokio::spawn(async move {
            if let Err(e) = sink.persist_attendance(&outcome).await {
                tracing::warn!(user = %outcome.user_id, error = %e, "failed to persist attendance");
            }
        });
    }
}
