pub mod http;
pub mod still;

use image::DynamicImage;
use std::sync::{Arc, Mutex};
use storyteller_common::frame::{Frame, Geometry};
use tracing::debug;

/// Open/read/release primitives of a capture device.
///
/// Reads block; callers run them off the display loop.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Read one raw frame in whatever layout the device produces.
    fn read(&mut self) -> Result<DynamicImage, CaptureError>;

    fn release(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera is not open")]
    NotOpen,
    #[error("camera has been released")]
    Released,
    #[error("camera request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("camera returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("camera frame could not be decoded: {0}")]
    Decode(String),
    #[error("camera device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Closed,
    Open,
    Released,
}

/// The camera shared between the lifecycle owner and the inference task.
pub type SharedCamera = Arc<Mutex<CameraSource>>;

/// Produces normalized camera frames: RGB, center-cropped to the target
/// aspect ratio, resized to the target width, mirrored.
pub struct CameraSource {
    device: Box<dyn CaptureDevice>,
    geometry: Geometry,
    state: DeviceState,
}

impl CameraSource {
    pub fn new(device: Box<dyn CaptureDevice>, geometry: Geometry) -> Self {
        Self {
            device,
            geometry,
            state: DeviceState::Closed,
        }
    }

    pub fn open(&mut self) -> Result<(), CaptureError> {
        match self.state {
            DeviceState::Open => Ok(()),
            DeviceState::Released => Err(CaptureError::Released),
            DeviceState::Closed => {
                self.device.open()?;
                self.state = DeviceState::Open;
                Ok(())
            }
        }
    }

    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        match self.state {
            DeviceState::Closed => return Err(CaptureError::NotOpen),
            DeviceState::Released => return Err(CaptureError::Released),
            DeviceState::Open => {}
        }
        let raw = self.device.read()?.into_rgb8();
        let frame = self.geometry.normalize(&raw).mirrored();
        debug!(
            device = self.device.name(),
            width = frame.width(),
            height = frame.height(),
            "captured camera frame"
        );
        Ok(frame)
    }

    /// Release the device. Later calls are no-ops and later captures fail.
    pub fn release(&mut self) {
        if self.state == DeviceState::Released {
            return;
        }
        if self.state == DeviceState::Open {
            self.device.release();
        }
        self.state = DeviceState::Released;
    }

    pub fn is_released(&self) -> bool {
        self.state == DeviceState::Released
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }
}
