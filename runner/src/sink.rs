use image::imageops::{self, FilterType};
use std::path::{Path, PathBuf};
use storyteller_common::frame::{fit_within, Frame, FrameError};
use tracing::{debug, info};

/// Receives one composited frame per tick.
pub trait DisplaySink: Send {
    fn present(&mut self, frame: &Frame) -> Result<(), DisplayError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("failed to encode display frame: {0}")]
    Encode(#[from] FrameError),
    #[error("failed to write display frame {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Scales each frame to fit the viewport and writes it to a PNG file that an
/// external full-screen viewer watches.
///
/// Frames are written to a sibling temp file and renamed into place, so the
/// viewer never reads a partially written image.
pub struct FileSink {
    path: PathBuf,
    tmp_path: PathBuf,
    viewport: (u32, u32),
    written: u64,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, viewport_width: u32, viewport_height: u32) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
            viewport: (viewport_width, viewport_height),
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_err(&self, path: &Path, source: std::io::Error) -> DisplayError {
        DisplayError::Write {
            path: path.display().to_string(),
            source,
        }
    }
}

impl DisplaySink for FileSink {
    fn present(&mut self, frame: &Frame) -> Result<(), DisplayError> {
        let (width, height) = fit_within(frame.width(), frame.height(), self.viewport.0, self.viewport.1);
        let scaled = if (width, height) == frame.dimensions() || width == 0 || height == 0 {
            frame.clone()
        } else {
            Frame::from_image(imageops::resize(frame.as_image(), width, height, FilterType::Triangle))
        };
        let png = scaled.encode_png()?;
        std::fs::write(&self.tmp_path, &png).map_err(|e| self.write_err(&self.tmp_path, e))?;
        std::fs::rename(&self.tmp_path, &self.path).map_err(|e| self.write_err(&self.path, e))?;
        self.written += 1;
        if self.written == 1 {
            info!(
                path = self.path.display().to_string(),
                width, height, "first frame written to display file"
            );
        }
        debug!(frame = self.written, bytes = png.len(), "display frame written");
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Discards frames; for headless rehearsal runs.
#[derive(Default)]
pub struct NullSink {
    pub presented: u64,
}

impl DisplaySink for NullSink {
    fn present(&mut self, _frame: &Frame) -> Result<(), DisplayError> {
        self.presented += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_scales_to_viewport() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("display.png"), 640, 360);
        sink.present(&Frame::solid(256, 192, [255, 0, 0])).unwrap();

        let written = image::open(sink.path()).unwrap().into_rgb8();
        assert_eq!(written.dimensions(), (480, 360));
        let [r, g, b] = written.get_pixel(100, 100).0;
        assert!(r > 250 && g < 5 && b < 5);
        assert!(!dir.path().join("display.png.tmp").exists());
    }

    #[test]
    fn file_sink_overwrites_previous_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("display.png"), 256, 192);
        sink.present(&Frame::solid(256, 192, [255, 0, 0])).unwrap();
        sink.present(&Frame::solid(256, 192, [0, 0, 255])).unwrap();
        let written = image::open(sink.path()).unwrap().into_rgb8();
        assert_eq!(written.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn file_sink_reports_unwritable_path() {
        let mut sink = FileSink::new("/nonexistent-dir/display.png", 256, 192);
        let err = sink.present(&Frame::solid(4, 3, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, DisplayError::Write { .. }));
    }

    #[test]
    fn null_sink_counts() {
        let mut sink = NullSink::default();
        sink.present(&Frame::solid(1, 1, [0, 0, 0])).unwrap();
        sink.present(&Frame::solid(1, 1, [0, 0, 0])).unwrap();
        assert_eq!(sink.presented, 2);
    }
}
