pub mod cache;
pub mod http;
pub mod passthrough;
pub mod scheduler;

use std::f64::consts::PI;
use storyteller_common::config::InferenceConfig;
use storyteller_common::frame::{Frame, FrameError};

/// Everything one transform call needs, snapshotted when the call is launched.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub image: Frame,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub strength: f32,
    pub steps: u32,
    pub seed: u64,
}

/// What a transform call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutput {
    Image(Frame),
    /// The backend's content-safety check refused the result.
    Rejected,
}

/// The slow external image transform.
///
/// Calls block for as long as the model takes and cannot be interrupted;
/// the scheduler runs them on the blocking thread pool.
pub trait InferenceBackend: Send + Sync {
    fn transform(&self, request: &InferenceRequest) -> Result<InferenceOutput, InferenceError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("camera snapshot failed: {0}")]
    Capture(#[from] crate::camera::CaptureError),
    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inference backend returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("inference image conversion failed: {0}")]
    Image(#[from] FrameError),
    #[error("inference backend failed: {0}")]
    Backend(String),
}

/// Per-call parameters that do not change while the installation runs.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub negative_prompt: String,
    pub strength: f32,
    pub steps: u32,
    pub seed: u64,
    /// Modulate strength with the film index instead of using it as-is.
    pub breathe: bool,
    pub width: u32,
    pub height: u32,
}

impl RequestParams {
    pub fn from_config(config: &InferenceConfig, (width, height): (u32, u32)) -> Self {
        Self {
            negative_prompt: config.negative_prompt.clone(),
            strength: config.strength,
            steps: config.steps,
            seed: config.seed,
            breathe: config.breathe,
            width,
            height,
        }
    }

    pub fn strength_for(&self, index: u32) -> f32 {
        if self.breathe {
            breathe(index)
        } else {
            self.strength
        }
    }

    pub fn request(&self, image: Frame, prompt: String, index: u32) -> InferenceRequest {
        let strength = self.strength_for(index);
        InferenceRequest {
            image,
            prompt,
            negative_prompt: self.negative_prompt.clone(),
            width: self.width,
            height: self.height,
            strength,
            steps: effective_steps(self.steps, strength),
            seed: self.seed,
        }
    }
}

/// Img2img runs `floor(steps * strength)` denoising steps; bump the step
/// count so at least one actually runs.
pub fn effective_steps(steps: u32, strength: f32) -> u32 {
    if ((steps as f32) * strength).floor() < 1.0 {
        (1.0 / strength.max(0.10)).ceil() as u32
    } else {
        steps
    }
}

/// Strength oscillating over a five-frame cycle between 0.1 and 0.9.
pub fn breathe(index: u32) -> f32 {
    let phase = (index % 5) as f64 * (2.0 * PI / 5.0);
    (0.5 + phase.sin() * 0.4) as f32
}
