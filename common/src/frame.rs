use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use std::io::Cursor;

/// An immutable 8-bit RGB frame.
///
/// Frames move between pipeline stages behind an `Arc`, so a handoff never
/// copies pixels and a frame is never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Convert any decoded image into the canonical RGB layout.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self {
            image: image.into_rgb8(),
        }
    }

    /// A frame filled with a single color (sentinel / placeholder frames).
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(rgb)),
        }
    }

    /// Decode an encoded image (PNG, JPEG) with format sniffing.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(FrameError::Io)?
            .decode()
            .map_err(FrameError::Decode)?;
        Ok(Self::from_dynamic(img))
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(FrameError::Encode)?;
        Ok(buf.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }

    /// Horizontal mirror; a mirrored camera feed feels natural to the visitor.
    pub fn mirrored(&self) -> Self {
        Self {
            image: imageops::flip_horizontal(&self.image),
        }
    }
}

/// Target geometry shared by every layer of the composite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub width: u32,
    /// Width divided by height.
    pub aspect_ratio: f64,
}

impl Geometry {
    pub fn new(width: u32, aspect_ratio: f64) -> Self {
        Self {
            width,
            aspect_ratio,
        }
    }

    pub fn height(&self) -> u32 {
        ((self.width as f64 / self.aspect_ratio).round() as u32).max(1)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height())
    }

    /// Center-crop `image` to the target aspect ratio, then resize to the
    /// target width with nearest-neighbour sampling.
    pub fn normalize(&self, image: &RgbImage) -> Frame {
        let (x, y, w, h) = center_crop_box(image.width(), image.height(), self.aspect_ratio);
        let cropped = imageops::crop_imm(image, x, y, w, h).to_image();
        let (width, height) = self.dimensions();
        if cropped.dimensions() == (width, height) {
            return Frame::from_image(cropped);
        }
        Frame::from_image(imageops::resize(&cropped, width, height, FilterType::Nearest))
    }
}

/// Largest centered box of the given aspect ratio that fits in `width x height`.
/// Returns `(x, y, w, h)`.
pub fn center_crop_box(width: u32, height: u32, aspect_ratio: f64) -> (u32, u32, u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0, width, height);
    }
    let source_ratio = width as f64 / height as f64;
    if source_ratio > aspect_ratio {
        // Too wide: trim the sides.
        let w = ((height as f64 * aspect_ratio).round() as u32).clamp(1, width);
        ((width - w) / 2, 0, w, height)
    } else {
        // Too tall (or exact): trim top and bottom.
        let h = ((width as f64 / aspect_ratio).round() as u32).clamp(1, height);
        (0, (height - h) / 2, width, h)
    }
}

/// Largest size with the frame's aspect ratio that fits inside the viewport.
pub fn fit_within(width: u32, height: u32, viewport_width: u32, viewport_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let scale = f64::min(
        viewport_width as f64 / width as f64,
        viewport_height as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).clamp(1, viewport_width.max(1));
    let h = ((height as f64 * scale).round() as u32).clamp(1, viewport_height.max(1));
    (w, h)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("image payload is empty")]
    Empty,
    #[error("failed to sniff image format: {0}")]
    Io(std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(image::ImageError),
}
