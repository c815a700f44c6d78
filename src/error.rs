//! Errors surfaced by the supervisor's lifecycle operations.

use thiserror::Error;

/// Lifecycle errors returned by `Supervisor::start` / `Supervisor::stop`.
///
/// Per-frame failures (read stalls, detector errors, dispatch errors) never
/// show up here; they stay inside the pipeline and are logged.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The camera already has a registered pipeline.
    #[error("camera {0} is already being processed")]
    AlreadyRunning(String),

    /// The camera has no registered pipeline.
    #[error("camera {0} is not being processed")]
    NotRunning(String),

    /// The frame source or detector could not be opened. Nothing was registered.
    #[error("failed to acquire resources for camera {camera_id}: {source:#}")]
    AcquisitionFailed {
        camera_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The pipeline stopped and was deregistered, but releasing a handle failed.
    #[error("camera {camera_id} stopped with release failure: {reason}")]
    ReleaseFailed { camera_id: String, reason: String },
}

impl SupervisorError {
    pub fn camera_id(&self) -> &str {
        match self {
            SupervisorError::AlreadyRunning(id) | SupervisorError::NotRunning(id) => id,
            SupervisorError::AcquisitionFailed { camera_id, .. }
            | SupervisorError::ReleaseFailed { camera_id, .. } => camera_id,
        }
    }
}
