use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

use storyteller_common::prompt::PromptError;

use crate::camera::{CameraSource, CaptureError, SharedCamera};
use crate::inference::scheduler::InferenceScheduler;
use crate::inference::InferenceError;

/// Anything that stops the installation before the first tick.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("camera '{device}' failed to open: {source}")]
    Camera {
        device: String,
        source: CaptureError,
    },
    #[error("no film frames found in {0}")]
    EmptyFilm(String),
    #[error("invalid prompt schedule: {0}")]
    Prompt(#[from] PromptError),
    #[error("failed to initialize inference backend: {0}")]
    Backend(#[from] InferenceError),
    #[error("startup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Owns the camera for the life of the process: opened once by
/// [`CameraLifecycle::acquire`], released exactly once by
/// [`CameraLifecycle::release`] (or on drop if release was never reached).
pub struct CameraLifecycle {
    camera: SharedCamera,
}

impl CameraLifecycle {
    /// Open the device. Blocking; a failure here aborts startup.
    pub fn acquire(mut source: CameraSource) -> Result<Self, StartupError> {
        if let Err(source_err) = source.open() {
            return Err(StartupError::Camera {
                device: source.device_name().to_string(),
                source: source_err,
            });
        }
        info!(device = source.device_name(), "camera acquired");
        Ok(Self {
            camera: Arc::new(Mutex::new(source)),
        })
    }

    /// Handle for the component that snapshots the camera.
    pub fn camera(&self) -> SharedCamera {
        Arc::clone(&self.camera)
    }

    /// Release the device. Waits for an in-progress capture to finish first.
    pub fn release(self) {
        self.release_once();
    }

    /// Returns false if the camera was already released.
    fn release_once(&self) -> bool {
        let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
        if camera.is_released() {
            return false;
        }
        camera.release();
        info!(device = camera.device_name(), "camera released");
        true
    }
}

impl Drop for CameraLifecycle {
    fn drop(&mut self) {
        if self.release_once() {
            warn!("camera lifecycle dropped without an explicit release");
        }
    }
}

/// Stop scheduling, let the in-flight inference call settle, then release the
/// camera. The order matters: a running call may still be reading the camera.
pub async fn shutdown(mut scheduler: InferenceScheduler, lifecycle: CameraLifecycle) {
    scheduler.shutdown().await;
    // The scheduler owns the backend's blocking client; drop it off the
    // async workers along with the camera.
    let release = move || {
        drop(scheduler);
        lifecycle.release();
    };
    match tokio::task::spawn_blocking(release).await {
        Ok(()) => info!("shutdown complete"),
        Err(e) => error!(error = %e, "camera release task failed"),
    }
}
