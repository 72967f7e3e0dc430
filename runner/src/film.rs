use image::{DynamicImage, ImageReader};
use std::path::{Path, PathBuf};
use storyteller_common::frame::{Frame, Geometry};
use tracing::debug;

/// Indexed frame lookup with an existence check.
pub trait AssetStore: Send {
    fn exists(&self, index: u32) -> bool;

    fn load(&self, index: u32) -> Result<DynamicImage, AssetError>;

    /// Length of the contiguous run of frames starting at index 1.
    fn count(&self) -> u32 {
        let mut count = 0;
        while self.exists(count + 1) {
            count += 1;
        }
        count
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("film frame {index} does not exist")]
    MissingFrameAsset { index: u32 },
    #[error("failed to read film frame {path}: {source}")]
    Read {
        index: u32,
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode film frame {path}: {source}")]
    Decode {
        index: u32,
        path: String,
        source: image::ImageError,
    },
}

impl AssetError {
    /// Index of the frame that could not be produced.
    pub fn index(&self) -> u32 {
        match self {
            AssetError::MissingFrameAsset { index }
            | AssetError::Read { index, .. }
            | AssetError::Decode { index, .. } => *index,
        }
    }
}

/// Frames stored as `<dir>/<prefix>-<index:04>.png`.
pub struct DirectoryAssetStore {
    dir: PathBuf,
    prefix: String,
}

impl DirectoryAssetStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path_for(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}-{index:04}.png", self.prefix))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl AssetStore for DirectoryAssetStore {
    fn exists(&self, index: u32) -> bool {
        self.path_for(index).is_file()
    }

    fn load(&self, index: u32) -> Result<DynamicImage, AssetError> {
        let path = self.path_for(index);
        if !path.is_file() {
            return Err(AssetError::MissingFrameAsset { index });
        }
        let display = path.display().to_string();
        ImageReader::open(&path)
            .map_err(|source| AssetError::Read {
                index,
                path: display.clone(),
                source,
            })?
            .decode()
            .map_err(|source| AssetError::Decode {
                index,
                path: display,
                source,
            })
    }
}

/// Walks the archival film frame by frame, looping back to frame 1 when the
/// sequence runs out. Frames get the same crop/resize as the camera feed so
/// the composited layers line up.
pub struct FilmSource {
    store: Box<dyn AssetStore>,
    geometry: Geometry,
}

impl FilmSource {
    pub fn new(store: Box<dyn AssetStore>, geometry: Geometry) -> Self {
        Self { store, geometry }
    }

    /// Returns the frame at `index` and the index to request next.
    ///
    /// A missing asset resets the sequence: the frame at index 1 is returned
    /// together with next index 2.
    pub fn next(&self, index: u32) -> Result<(Frame, u32), AssetError> {
        match self.read(index) {
            Ok(frame) => Ok((frame, index.saturating_add(1))),
            Err(AssetError::MissingFrameAsset { .. }) => {
                debug!(index, "film sequence exhausted, wrapping to frame 1");
                let frame = self.read(1)?;
                Ok((frame, 2))
            }
            Err(e) => Err(e),
        }
    }

    pub fn len(&self) -> u32 {
        self.store.count()
    }

    fn read(&self, index: u32) -> Result<Frame, AssetError> {
        let image = self.store.load(index)?.into_rgb8();
        Ok(self.geometry.normalize(&image))
    }
}
