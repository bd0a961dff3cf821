use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use zbus::interface;

use blinkgate_core::{
    cancel_pair, CancelHandle, CheckInError, CheckInOrchestrator, EmbeddingExtractor,
    LandmarkExtractor, VerificationOutcome,
};

use crate::config::Config;
use crate::enrollment::{enroll_from_image, EnrollError, EnrollPolicy, EnrollRequest};
use crate::frames::ImageSequenceSource;
use crate::store::{BiometricStore, EnrollMode, StoreError};

const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("a check-in for '{0}' is already in progress")]
    Busy(String),
    #[error(transparent)]
    CheckIn(#[from] CheckInError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Invalid(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
            _ => zbus::fdo::Error::Failed(e.to_string()),
        }
    }
}

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub store: BiometricStore,
    landmarks: Arc<dyn LandmarkExtractor>,
    embedder: Arc<dyn EmbeddingExtractor>,
    orchestrator: CheckInOrchestrator,
    /// Cancel handles of running check-ins, one per user.
    active: Mutex<HashMap<String, CancelHandle>>,
}

/// Removes a user's entry from the active table when the check-in ends.
struct ActiveCheckIn<'a> {
    state: &'a AppState,
    user: String,
}

impl Drop for ActiveCheckIn<'_> {
    fn drop(&mut self) {
        self.state.active_table().remove(&self.user);
    }
}

impl AppState {
    pub fn new(
        config: Config,
        store: BiometricStore,
        landmarks: Arc<dyn LandmarkExtractor>,
        embedder: Arc<dyn EmbeddingExtractor>,
    ) -> Self {
        let shared = Arc::new(store.clone());
        let orchestrator =
            CheckInOrchestrator::new(landmarks.clone(), embedder.clone(), shared.clone(), shared);
        Self {
            config,
            store,
            landmarks,
            embedder,
            orchestrator,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, user: &str, handle: CancelHandle) -> Result<ActiveCheckIn<'_>, ServiceError> {
        let mut table = self.active_table();
        if table.contains_key(user) {
            return Err(ServiceError::Busy(user.to_string()));
        }
        table.insert(user.to_string(), handle);
        Ok(ActiveCheckIn {
            state: self,
            user: user.to_string(),
        })
    }

    fn enroll_policy(&self) -> EnrollPolicy {
        let check_in = self.config.check_in_config();
        EnrollPolicy {
            layout: check_in.liveness.layout,
            min_frontality: check_in.min_frontality,
            min_open_ear: check_in.liveness.reopen_threshold,
        }
    }

    pub async fn enroll(
        &self,
        user: &str,
        image_path: &str,
        label: &str,
        append: bool,
    ) -> Result<String, ServiceError> {
        require_user(user)?;
        let request = EnrollRequest {
            user: user.to_string(),
            image_path: PathBuf::from(image_path),
            label: if label.is_empty() { "default" } else { label }.to_string(),
            mode: if append {
                EnrollMode::Append
            } else {
                EnrollMode::Replace
            },
            required_blinks: self.config.required_blinks,
        };
        let id = enroll_from_image(
            self.landmarks.clone(),
            self.embedder.clone(),
            &self.store,
            self.enroll_policy(),
            request,
        )
        .await?;
        Ok(id)
    }

    pub async fn check_in(
        &self,
        user: &str,
        frames_dir: &str,
        fps: f64,
    ) -> Result<VerificationOutcome, ServiceError> {
        require_user(user)?;
        if !(fps.is_finite() && fps > 0.0) {
            return Err(ServiceError::Invalid(format!("frame rate must be positive, got {fps}")));
        }

        let (handle, signal) = cancel_pair();
        let _active = self.claim(user, handle)?;

        let source = Box::new(ImageSequenceSource::new(frames_dir, fps));
        let outcome = self
            .orchestrator
            .run_check_in_with_cancel(user, source, &self.config.check_in_config(), signal)
            .await?;
        Ok(outcome)
    }

    /// Returns whether a running check-in for `user` was signalled.
    pub fn cancel(&self, user: &str) -> bool {
        match self.active_table().get(user) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn history(&self, user: &str, limit: u32) -> Result<serde_json::Value, ServiceError> {
        require_user(user)?;
        let limit = if limit == 0 { DEFAULT_HISTORY_LIMIT } else { limit };
        let records = self.store.attendance_history(user, limit as usize).await?;
        let summary = self.store.attendance_summary(user).await?;
        Ok(serde_json::json!({
            "user": user,
            "total": summary.total,
            "successful": summary.successful,
            "records": records,
        }))
    }

    pub async fn status(&self) -> Result<serde_json::Value, ServiceError> {
        let counts = self.store.counts().await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "inference_ready": self.embedder.is_ready(),
            "embedding_model_version": self.embedder.model_version(),
            "users_enrolled": counts.users,
            "references": counts.enrollments,
            "attendance_records": counts.attendance,
            "similarity_threshold": self.config.similarity_threshold,
            "close_threshold": self.config.close_threshold,
            "reopen_threshold": self.config.reopen_threshold,
            "required_blinks": self.config.required_blinks,
            "active_check_ins": self.active_table().len(),
        }))
    }
}

fn require_user(user: &str) -> Result<(), ServiceError> {
    if user.trim().is_empty() {
        return Err(ServiceError::Invalid("user must not be empty".into()));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// D-Bus interface for the blinkgate check-in daemon.
///
/// Bus name: org.blinkgate.CheckIn1
/// Object path: /org/blinkgate/CheckIn1
pub struct CheckInService {
    pub state: Arc<AppState>,
}

#[interface(name = "org.blinkgate.CheckIn1")]
impl CheckInService {
    /// Enroll a reference image for the given user.
    ///
    /// Replaces existing references unless `append` is set. Returns the UUID
    /// of the new reference.
    async fn enroll(
        &self,
        user: &str,
        image_path: &str,
        label: &str,
        append: bool,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, image_path, label, append, "enroll requested");
        self.state
            .enroll(user, image_path, label, append)
            .await
            .map_err(|e| {
                tracing::error!(user, error = %e, "enroll failed");
                e.into()
            })
    }

    /// Run a check-in over a recorded clip; returns the outcome as JSON.
    ///
    /// Verification rejections are part of the outcome. Only infrastructure
    /// faults are returned as D-Bus errors.
    async fn check_in(&self, user: &str, frames_dir: &str, fps: f64) -> zbus::fdo::Result<String> {
        tracing::info!(user, frames_dir, fps, "check-in requested");
        let outcome = self
            .state
            .check_in(user, frames_dir, fps)
            .await
            .map_err(|e| {
                tracing::error!(user, error = %e, "check-in failed");
                zbus::fdo::Error::from(e)
            })?;
        to_json(&outcome)
    }

    /// Cancel the user's running check-in, if any.
    async fn cancel_check_in(&self, user: &str) -> bool {
        let cancelled = self.state.cancel(user);
        tracing::info!(user, cancelled, "cancel requested");
        cancelled
    }

    /// Attendance history for the user as JSON, newest first.
    async fn history(&self, user: &str, limit: u32) -> zbus::fdo::Result<String> {
        tracing::info!(user, limit, "history requested");
        let history = self.state.history(user, limit).await?;
        to_json(&history)
    }

    /// Enrolled references for the user as JSON, without embedding data.
    async fn list_models(&self, user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, "list_models requested");
        let models = self
            .state
            .store
            .list_by_user(user)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&models)
    }

    /// Remove every reference for the user. Attendance history is kept.
    async fn remove_enrollment(&self, user: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user, "remove_enrollment requested");
        let removed = self
            .state
            .store
            .remove_user(user)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            tracing::info!(user, "enrollment removed");
        } else {
            tracing::warn!(user, "no enrollment to remove");
        }
        Ok(removed)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.state.status().await?;
        to_json(&status)
    }
}
