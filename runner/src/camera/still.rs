use image::{DynamicImage, ImageReader};
use std::path::PathBuf;
use tracing::info;

use super::{CaptureDevice, CaptureError};

/// Serves the same image file on every read. Used to rehearse the
/// installation without camera hardware.
pub struct StillImageDevice {
    path: PathBuf,
    image: Option<DynamicImage>,
}

impl StillImageDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            image: None,
        }
    }
}

impl CaptureDevice for StillImageDevice {
    fn open(&mut self) -> Result<(), CaptureError> {
        let image = ImageReader::open(&self.path)
            .map_err(|e| CaptureError::Device(format!("{}: {e}", self.path.display())))?
            .decode()
            .map_err(|e| CaptureError::Decode(e.to_string()))?;
        info!(path = self.path.display().to_string(), "still image camera opened");
        self.image = Some(image);
        Ok(())
    }

    fn read(&mut self) -> Result<DynamicImage, CaptureError> {
        self.image.clone().ok_or(CaptureError::NotOpen)
    }

    fn release(&mut self) {
        self.image = None;
    }

    fn name(&self) -> &str {
        "still"
    }
}
