//! Active liveness detection via deliberate blinks.
//!
//! A printed photograph or a still image on a screen cannot blink on request.
//! The detector tracks the mean eye aspect ratio (EAR) of both eyes frame by
//! frame and counts completed closures with a two-threshold hysteresis:
//!
//! ```text
//!            EAR < close                    EAR > reopen
//!   OPEN ─────────────────▶ CLOSING ─────────────────────▶ OPEN   (+1 blink)
//! ```
//!
//! Values between the two thresholds never cause a transition. Without that
//! dead band, sensor jitter around a single threshold would be counted as a
//! burst of blinks.
//!
//! The detector is pull based: callers `open` a session, `feed` it one sample
//! per frame in timestamp order and `close` it whenever they are done. A
//! partial session (closed early on timeout or cancellation) still yields a
//! consistent [`LivenessResult`].
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images, frozen video frames.
//! - **Does not block:** Replayed video of the enrolled user blinking. Pair with
//!   a challenge that the replay cannot anticipate if that matters.

use crate::landmarks::{mean_eye_aspect_ratio, LandmarkLayout};
use crate::types::{BlinkEvent, LandmarkSet};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// EAR below which an open eye is considered to be closing.
pub const DEFAULT_CLOSE_THRESHOLD: f32 = 0.20;
/// EAR above which a closing eye is considered open again.
pub const DEFAULT_REOPEN_THRESHOLD: f32 = 0.25;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LivenessError {
    #[error("a liveness session is already active for this attempt")]
    SessionLimitExceeded,
    #[error("liveness session {0} is already closed")]
    SessionAlreadyClosed(u64),
    #[error("unknown liveness session {0}")]
    UnknownSession(u64),
    #[error("frame at {got:?} does not follow previous frame at {previous:?}")]
    OutOfOrderFrame { previous: Duration, got: Duration },
    #[error("close threshold {close} must be below reopen threshold {reopen}")]
    InvalidThresholds { close: f32, reopen: f32 },
}

/// Thresholds and landmark topology for a detector.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub close_threshold: f32,
    pub reopen_threshold: f32,
    pub layout: LandmarkLayout,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            close_threshold: DEFAULT_CLOSE_THRESHOLD,
            reopen_threshold: DEFAULT_REOPEN_THRESHOLD,
            layout: LandmarkLayout::default(),
        }
    }
}

impl LivenessConfig {
    /// The dead band must be non-empty; NaN thresholds are rejected too.
    pub fn validate(&self) -> Result<(), LivenessError> {
        if self.close_threshold < self.reopen_threshold {
            Ok(())
        } else {
            Err(LivenessError::InvalidThresholds {
                close: self.close_threshold,
                reopen: self.reopen_threshold,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EyeState {
    Open,
    Closing { since: Duration },
}

/// Hysteresis blink counter over a mean-EAR series.
#[derive(Debug, Clone)]
pub struct BlinkCounter {
    close_threshold: f32,
    reopen_threshold: f32,
    state: EyeState,
    events: Vec<BlinkEvent>,
}

impl BlinkCounter {
    pub fn new(close_threshold: f32, reopen_threshold: f32) -> Self {
        Self {
            close_threshold,
            reopen_threshold,
            state: EyeState::Open,
            events: Vec::new(),
        }
    }

    /// Advance by one sample. Returns the blink completed by this sample.
    pub fn update(&mut self, timestamp: Duration, ear: f32) -> Option<BlinkEvent> {
        match self.state {
            EyeState::Open if ear < self.close_threshold => {
                self.state = EyeState::Closing { since: timestamp };
                None
            }
            EyeState::Closing { since } if ear > self.reopen_threshold => {
                let event = BlinkEvent {
                    start: since,
                    end: timestamp,
                };
                self.events.push(event);
                self.state = EyeState::Open;
                Some(event)
            }
            _ => None,
        }
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[BlinkEvent] {
        &self.events
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, EyeState::Closing { .. })
    }
}

/// Opaque reference to a session opened on a [`LivenessDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Final (or partial) result of a liveness session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    /// Completed blinks, time ordered and non-overlapping.
    pub events: Vec<BlinkEvent>,
    pub frames_fed: usize,
    /// Frames without a usable landmark set (no face, several faces, bad geometry).
    pub undefined_samples: usize,
    /// The session ended mid-closure; that closure is not counted.
    pub ended_while_closed: bool,
}

impl LivenessResult {
    pub fn blink_count(&self) -> usize {
        self.events.len()
    }
}

#[derive(Debug)]
struct Session {
    id: u64,
    counter: BlinkCounter,
    last_timestamp: Option<Duration>,
    frames_fed: usize,
    undefined_samples: usize,
}

/// Blink-counting liveness detector for a single check-in attempt.
///
/// At most one session is active at a time. `feed` takes `&mut self`, so a
/// session has exactly one writer.
#[derive(Debug)]
pub struct LivenessDetector {
    config: LivenessConfig,
    active: Option<Session>,
    issued: u64,
}

impl LivenessDetector {
    pub fn new(config: LivenessConfig) -> Result<Self, LivenessError> {
        config.validate()?;
        Ok(Self {
            config,
            active: None,
            issued: 0,
        })
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Begin a new, empty session.
    pub fn open(&mut self) -> Result<SessionHandle, LivenessError> {
        if self.active.is_some() {
            return Err(LivenessError::SessionLimitExceeded);
        }
        self.issued += 1;
        self.active = Some(Session {
            id: self.issued,
            counter: BlinkCounter::new(self.config.close_threshold, self.config.reopen_threshold),
            last_timestamp: None,
            frames_fed: 0,
            undefined_samples: 0,
        });
        tracing::debug!(session = self.issued, "liveness session opened");
        Ok(SessionHandle(self.issued))
    }

    /// Advance the session by one frame.
    ///
    /// `None` marks a frame without a usable face. It is recorded as an
    /// undefined sample and leaves the eye state untouched.
    pub fn feed(
        &mut self,
        handle: SessionHandle,
        timestamp: Duration,
        landmarks: Option<&LandmarkSet>,
    ) -> Result<Option<BlinkEvent>, LivenessError> {
        let ear = landmarks.and_then(|set| mean_eye_aspect_ratio(set, &self.config.layout));
        self.feed_ear(handle, timestamp, ear)
    }

    /// Same as [`feed`](Self::feed) with a precomputed mean EAR.
    pub fn feed_ear(
        &mut self,
        handle: SessionHandle,
        timestamp: Duration,
        ear: Option<f32>,
    ) -> Result<Option<BlinkEvent>, LivenessError> {
        let session = self.session_mut(handle)?;

        if let Some(previous) = session.last_timestamp {
            if timestamp <= previous {
                return Err(LivenessError::OutOfOrderFrame {
                    previous,
                    got: timestamp,
                });
            }
        }
        session.last_timestamp = Some(timestamp);
        session.frames_fed += 1;

        match ear.filter(|v| v.is_finite()) {
            Some(ear) => {
                let event = session.counter.update(timestamp, ear);
                if let Some(ev) = &event {
                    tracing::debug!(
                        session = session.id,
                        blinks = session.counter.count(),
                        duration_ms = ev.duration().as_millis() as u64,
                        "blink completed"
                    );
                }
                Ok(event)
            }
            None => {
                session.undefined_samples += 1;
                Ok(None)
            }
        }
    }

    /// Blinks completed so far.
    pub fn blink_count(&self, handle: SessionHandle) -> Result<usize, LivenessError> {
        match &self.active {
            Some(session) if session.id == handle.0 => Ok(session.counter.count()),
            _ => Err(self.stale_handle(handle)),
        }
    }

    /// Finalize the session. Later calls with the same handle fail with
    /// [`LivenessError::SessionAlreadyClosed`].
    pub fn close(&mut self, handle: SessionHandle) -> Result<LivenessResult, LivenessError> {
        match self.active.take() {
            Some(session) if session.id == handle.0 => {
                let result = LivenessResult {
                    ended_while_closed: session.counter.is_closing(),
                    events: session.counter.events,
                    frames_fed: session.frames_fed,
                    undefined_samples: session.undefined_samples,
                };
                tracing::debug!(
                    session = handle.0,
                    blinks = result.blink_count(),
                    frames = result.frames_fed,
                    undefined = result.undefined_samples,
                    "liveness session closed"
                );
                Ok(result)
            }
            other => {
                self.active = other;
                Err(self.stale_handle(handle))
            }
        }
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut Session, LivenessError> {
        let err = self.stale_handle(handle);
        match self.active.as_mut() {
            Some(session) if session.id == handle.0 => Ok(session),
            _ => Err(err),
        }
    }

    fn stale_handle(&self, handle: SessionHandle) -> LivenessError {
        if handle.0 >= 1 && handle.0 <= self.issued {
            LivenessError::SessionAlreadyClosed(handle.0)
        } else {
            LivenessError::UnknownSession(handle.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::synthetic_face;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Feed a series at 33 ms spacing and return the closed result.
    fn run_series(series: &[Option<f32>]) -> LivenessResult {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let handle = detector.open().unwrap();
        for (i, ear) in series.iter().enumerate() {
            detector.feed_ear(handle, ms(i as u64 * 33), *ear).unwrap();
        }
        detector.close(handle).unwrap()
    }

    #[test]
    fn test_hysteresis_counts_two_blinks() {
        let series = [0.30, 0.18, 0.15, 0.22, 0.28, 0.12, 0.29];
        let result = run_series(&series.map(Some));
        assert_eq!(result.blink_count(), 2);
        assert_eq!(result.events[0], BlinkEvent { start: ms(33), end: ms(132) });
        assert_eq!(result.events[1], BlinkEvent { start: ms(165), end: ms(198) });
        assert!(!result.ended_while_closed);
    }

    #[test]
    fn test_dead_band_is_stable() {
        let series: Vec<Option<f32>> = (0..60)
            .map(|i| Some(if i % 2 == 0 { 0.21 } else { 0.24 }))
            .collect();
        let result = run_series(&series);
        assert_eq!(result.blink_count(), 0);
        assert!(!result.ended_while_closed);
    }

    #[test]
    fn test_jitter_inside_closure_counts_once() {
        // Dips back into the dead band without crossing reopen.
        let series = [0.30, 0.10, 0.24, 0.12, 0.23, 0.15, 0.31];
        let result = run_series(&series.map(Some));
        assert_eq!(result.blink_count(), 1);
    }

    #[test]
    fn test_unfinished_closure_not_counted() {
        let series = [0.30, 0.12, 0.29, 0.30, 0.11, 0.10];
        let result = run_series(&series.map(Some));
        assert_eq!(result.blink_count(), 1);
        assert!(result.ended_while_closed);
    }

    #[test]
    fn test_exact_threshold_values_do_not_transition() {
        // Strict comparisons: 0.20 does not close, 0.25 does not reopen.
        let result = run_series(&[Some(0.30), Some(0.20), Some(0.19), Some(0.25)]);
        assert_eq!(result.blink_count(), 0);
        assert!(result.ended_while_closed);
    }

    #[test]
    fn test_count_never_decreases() {
        let series = [
            0.31, 0.29, 0.14, 0.16, 0.27, 0.22, 0.18, 0.33, 0.05, 0.21, 0.24, 0.26, 0.30, 0.10,
        ];
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let handle = detector.open().unwrap();
        let mut last = 0;
        for (i, ear) in series.iter().enumerate() {
            detector.feed_ear(handle, ms(i as u64 * 40), Some(*ear)).unwrap();
            let now = detector.blink_count(handle).unwrap();
            assert!(now >= last, "count dropped from {last} to {now}");
            last = now;
        }
        assert_eq!(detector.close(handle).unwrap().blink_count(), last);
    }

    #[test]
    fn test_undefined_samples_do_not_open_or_close() {
        // Absent face while open, then a closure interrupted by absent frames.
        let series = [
            Some(0.30),
            None,
            None,
            Some(0.15),
            None,
            None,
            Some(0.30),
        ];
        let result = run_series(&series);
        assert_eq!(result.blink_count(), 1);
        assert_eq!(result.undefined_samples, 4);
        assert_eq!(result.frames_fed, 7);
        assert_eq!(result.events[0].start, ms(99));
        assert_eq!(result.events[0].end, ms(198));
    }

    #[test]
    fn test_nan_ear_is_undefined() {
        let result = run_series(&[Some(0.30), Some(f32::NAN), Some(0.10), Some(0.30)]);
        assert_eq!(result.blink_count(), 1);
        assert_eq!(result.undefined_samples, 1);
    }

    #[test]
    fn test_feed_with_landmarks() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let handle = detector.open().unwrap();
        let frames = [0.32, 0.08, 0.31, 0.30, 0.09, 0.33];
        for (i, ear) in frames.iter().enumerate() {
            let face = synthetic_face(*ear);
            detector.feed(handle, ms(i as u64 * 33), Some(&face)).unwrap();
        }
        detector.feed(handle, ms(500), None).unwrap();
        let result = detector.close(handle).unwrap();
        assert_eq!(result.blink_count(), 2);
        assert_eq!(result.undefined_samples, 1);
    }

    #[test]
    fn test_out_of_order_frame_rejected() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let handle = detector.open().unwrap();
        detector.feed_ear(handle, ms(100), Some(0.30)).unwrap();
        detector.feed_ear(handle, ms(133), Some(0.10)).unwrap();

        let err = detector.feed_ear(handle, ms(133), Some(0.30)).unwrap_err();
        assert!(matches!(err, LivenessError::OutOfOrderFrame { .. }));
        let err = detector.feed_ear(handle, ms(50), Some(0.30)).unwrap_err();
        assert!(matches!(err, LivenessError::OutOfOrderFrame { .. }));

        // Rejected frames leave the closure pending.
        detector.feed_ear(handle, ms(166), Some(0.30)).unwrap();
        let result = detector.close(handle).unwrap();
        assert_eq!(result.blink_count(), 1);
        assert_eq!(result.frames_fed, 3);
    }

    #[test]
    fn test_second_open_exceeds_limit() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let _handle = detector.open().unwrap();
        assert_eq!(detector.open().unwrap_err(), LivenessError::SessionLimitExceeded);
    }

    #[test]
    fn test_feed_after_close_fails() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let handle = detector.open().unwrap();
        detector.feed_ear(handle, ms(0), Some(0.3)).unwrap();
        detector.close(handle).unwrap();

        let err = detector.feed_ear(handle, ms(33), Some(0.3)).unwrap_err();
        assert_eq!(err, LivenessError::SessionAlreadyClosed(handle.id()));
        let err = detector.close(handle).unwrap_err();
        assert_eq!(err, LivenessError::SessionAlreadyClosed(handle.id()));
    }

    #[test]
    fn test_reopen_after_close_starts_empty() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let first = detector.open().unwrap();
        detector.feed_ear(first, ms(0), Some(0.3)).unwrap();
        detector.feed_ear(first, ms(33), Some(0.1)).unwrap();
        detector.feed_ear(first, ms(66), Some(0.3)).unwrap();
        assert_eq!(detector.close(first).unwrap().blink_count(), 1);

        let second = detector.open().unwrap();
        assert_ne!(first, second);
        assert_eq!(detector.blink_count(second).unwrap(), 0);
        // The old handle cannot touch the new session.
        assert!(detector.feed_ear(first, ms(99), Some(0.1)).is_err());
        assert_eq!(detector.close(second).unwrap().frames_fed, 0);
    }

    #[test]
    fn test_unknown_handle() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let err = detector.feed_ear(SessionHandle(7), ms(0), Some(0.3)).unwrap_err();
        assert_eq!(err, LivenessError::UnknownSession(7));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = LivenessConfig {
            close_threshold: 0.25,
            reopen_threshold: 0.20,
            ..LivenessConfig::default()
        };
        assert!(matches!(
            LivenessDetector::new(config),
            Err(LivenessError::InvalidThresholds { .. })
        ));

        let nan = LivenessConfig {
            close_threshold: f32::NAN,
            ..LivenessConfig::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_early_close_is_consistent() {
        let mut detector = LivenessDetector::new(LivenessConfig::default()).unwrap();
        let handle = detector.open().unwrap();
        let result = detector.close(handle).unwrap();
        assert_eq!(result, LivenessResult::default());
    }
}
